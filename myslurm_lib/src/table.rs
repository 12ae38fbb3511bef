//! Typed, ordered, header-described table persisted as a flat comma-delimited file.
//!
//! The file format has no quoting or escaping: text values containing the delimiter
//! or a line break are rejected when they are written into the table, so whatever
//! is in memory can always be saved and loaded back unchanged.

use std::{
    collections::BTreeMap,
    fmt, fs, io,
    ops::Range,
    path::{Path, PathBuf},
};

use myslurm_data::Projection;
use thiserror::Error;

pub const DELIMITER: char = ',';

/// positional column rewritten by every sort
pub const INDEX_COLUMN: &str = "index";

#[derive(Error, Debug)]
pub enum TableError {
    #[error("table file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("row {index} out of range, table has {len} rows")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid value {value:?} for column {column}: {reason}")]
    InvalidValue {
        column: String,
        value: String,
        reason: String,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
    /// human readable timestamp, stored as text
    Timestamp,
}

impl ColumnType {
    /// Converts a raw field into a value of this type.
    /// The empty string is `Value::Null` for every type.
    pub fn coerce(self, raw: &str) -> Result<Value, String> {
        if raw.is_empty() {
            return Ok(Value::Null);
        }
        match self {
            ColumnType::Integer => raw
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|err| format!("not an integer ({})", err)),
            ColumnType::Text | ColumnType::Timestamp => {
                if raw.contains(|c: char| c == DELIMITER || c == '\n' || c == '\r') {
                    Err(format!(
                        "text must not contain {:?} or line breaks",
                        DELIMITER
                    ))
                } else {
                    Ok(Value::Text(raw.to_string()))
                }
            }
        }
    }
}

/// A single cell. Variant order defines sort order: empty cells sort lowest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

/// Ordered column declarations. Order is the on-disk column order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: &[(&str, ColumnType)]) -> Result<Self, TableError> {
        if columns.is_empty() {
            return Err(TableError::InvalidSchema("no columns".to_string()));
        }
        let mut declared: Vec<Column> = Vec::with_capacity(columns.len());
        for (name, column_type) in columns {
            if name.is_empty() || name.contains(DELIMITER) {
                return Err(TableError::InvalidSchema(format!(
                    "invalid column name {:?}",
                    name
                )));
            }
            if declared.iter().any(|c| c.name == *name) {
                return Err(TableError::InvalidSchema(format!(
                    "duplicate column {}",
                    name
                )));
            }
            if *name == INDEX_COLUMN && *column_type != ColumnType::Integer {
                return Err(TableError::InvalidSchema(format!(
                    "{} column must be an integer",
                    INDEX_COLUMN
                )));
            }
            declared.push(Column {
                name: name.to_string(),
                column_type: *column_type,
            });
        }
        Ok(Self { columns: declared })
    }

    fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn header(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        names.join(&DELIMITER.to_string())
    }
}

pub type Row = Vec<Value>;

/// Partial mapping of column name to raw value, the input of `Table::upsert`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry(BTreeMap<String, String>);

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl ToString) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: &str, value: impl ToString) {
        self.0.insert(column.to_string(), value.to_string());
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(|v| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upserted {
    Inserted(usize),
    Updated(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    schema: Schema,
    rows: Vec<Row>,
}

impl Table {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// reads a table file; a missing file is `TableError::NotFound`
    pub fn load(path: &Path, schema: Schema) -> Result<Self, TableError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TableError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(TableError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&content, schema)
    }

    pub fn parse(content: &str, schema: Schema) -> Result<Self, TableError> {
        let mut lines = content.lines().enumerate();
        let header = match lines.next() {
            Some((_, header)) => header,
            None => {
                return Err(TableError::Parse {
                    line: 1,
                    message: "missing header line".to_string(),
                })
            }
        };
        let expected = schema.header();
        if header != expected {
            return Err(TableError::Parse {
                line: 1,
                message: format!("expected header {:?}, found {:?}", expected, header),
            });
        }
        let mut rows = Vec::new();
        for (i, line) in lines {
            let line_number = i + 1;
            let fields: Vec<&str> = line.split(DELIMITER).collect();
            if fields.len() != schema.len() {
                return Err(TableError::Parse {
                    line: line_number,
                    message: format!("expected {} fields, found {}", schema.len(), fields.len()),
                });
            }
            let row = schema
                .columns
                .iter()
                .zip(fields)
                .map(|(column, raw)| {
                    column
                        .column_type
                        .coerce(raw)
                        .map_err(|reason| TableError::Parse {
                            line: line_number,
                            message: format!("column {}: {}", column.name, reason),
                        })
                })
                .collect::<Result<Row, TableError>>()?;
            rows.push(row);
        }
        Ok(Self { schema, rows })
    }

    /// Overwrites `path` with the header and all rows.
    /// Not atomic: a crash while writing leaves a truncated file behind.
    pub fn save(&self, path: &Path) -> Result<(), TableError> {
        fs::write(path, self.to_delimited()).map_err(|source| TableError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_delimited(&self) -> String {
        let mut out = self.schema.header();
        out.push('\n');
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            out.push_str(&cells.join(&DELIMITER.to_string()));
            out.push('\n');
        }
        out
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, TableError> {
        self.schema
            .position(name)
            .ok_or_else(|| TableError::InvalidKey(name.to_string()))
    }

    fn coerce_cell(&self, column: usize, raw: &str) -> Result<Value, TableError> {
        let column = &self.schema.columns[column];
        column
            .column_type
            .coerce(raw)
            .map_err(|reason| TableError::InvalidValue {
                column: column.name.clone(),
                value: raw.to_string(),
                reason,
            })
    }

    /// first row whose `column` equals `raw` after coercion
    pub fn find_row(&self, column: &str, raw: &str) -> Result<Option<usize>, TableError> {
        let idx = self.column_index(column)?;
        let value = self.coerce_cell(idx, raw)?;
        Ok(self.rows.iter().position(|row| row[idx] == value))
    }

    pub fn get(&self, column: &str, row: usize) -> Result<&Value, TableError> {
        let idx = self.column_index(column)?;
        self.rows
            .get(row)
            .map(|r| &r[idx])
            .ok_or(TableError::IndexOutOfRange {
                index: row,
                len: self.rows.len(),
            })
    }

    pub fn project(&self, columns: &[&str]) -> Result<Projection, TableError> {
        self.project_rows(columns, 0..self.rows.len())
    }

    pub fn project_rows(
        &self,
        columns: &[&str],
        range: Range<usize>,
    ) -> Result<Projection, TableError> {
        let indices = columns
            .iter()
            .map(|name| self.column_index(name))
            .collect::<Result<Vec<usize>, TableError>>()?;
        let len = self.rows.len();
        let rows = self
            .rows
            .get(range.clone())
            .ok_or(TableError::IndexOutOfRange {
                index: range.end.saturating_sub(1),
                len,
            })?;
        Ok(Projection {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| indices.iter().map(|i| row[*i].to_string()).collect())
                .collect(),
        })
    }

    /// Stable sort on one column, then rewrite the index column to match row positions.
    pub fn sort_by(&mut self, column: &str, descending: bool) -> Result<(), TableError> {
        let idx = self.column_index(column)?;
        if descending {
            self.rows.sort_by(|a, b| b[idx].cmp(&a[idx]));
        } else {
            self.rows.sort_by(|a, b| a[idx].cmp(&b[idx]));
        }
        if let Some(index_column) = self.schema.position(INDEX_COLUMN) {
            for (position, row) in self.rows.iter_mut().enumerate() {
                row[index_column] = Value::Integer(position as i64);
            }
        }
        Ok(())
    }

    /// Validates every cell of `entry` the way `upsert` would, without touching the table.
    pub fn check(&self, entry: &Entry) -> Result<(), TableError> {
        self.coerce_entry(entry).map(|_| ())
    }

    fn coerce_entry(&self, entry: &Entry) -> Result<Vec<(usize, Value)>, TableError> {
        entry
            .iter()
            .map(|(name, raw)| {
                let idx = self.column_index(name)?;
                Ok((idx, self.coerce_cell(idx, raw)?))
            })
            .collect()
    }

    /// Insert-or-update keyed on `match_column`.
    ///
    /// A matching row gets only the supplied cells overwritten. Otherwise a new row
    /// with every cell empty is filled from `entry` and appended. Every cell is
    /// validated before anything changes, so an error leaves the table untouched.
    pub fn upsert(&mut self, entry: &Entry, match_column: &str) -> Result<Upserted, TableError> {
        let key = entry.get(match_column).ok_or_else(|| {
            TableError::InvalidKey(format!("entry has no value for {}", match_column))
        })?;
        if key.is_empty() {
            return Err(TableError::InvalidValue {
                column: match_column.to_string(),
                value: String::new(),
                reason: "match value must not be empty".to_string(),
            });
        }
        let cells = self.coerce_entry(entry)?;

        match self.find_row(match_column, key)? {
            Some(row_idx) => {
                let row = &mut self.rows[row_idx];
                for (idx, value) in cells {
                    row[idx] = value;
                }
                Ok(Upserted::Updated(row_idx))
            }
            None => {
                let mut row = vec![Value::Null; self.schema.len()];
                for (idx, value) in cells {
                    row[idx] = value;
                }
                self.rows.push(row);
                Ok(Upserted::Inserted(self.rows.len() - 1))
            }
        }
    }
}

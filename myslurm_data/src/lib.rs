use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Fields requested from the accounting query, in the order the scheduler prints them.
pub const POLL_FIELDS: [&str; 7] = [
    "JobID",
    "JobName",
    "Partition",
    "State",
    "Elapsed",
    "Start",
    "End",
];

/// A job as known right after the scheduler accepted it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub jobid: u64,
    pub name: String,
    pub workdir: PathBuf,
    pub partition: Option<String>,
    /// log path relative to `workdir`, placeholders already substituted
    pub output: String,
    pub cpus_per_task: Option<u32>,
    pub time_limit: Option<String>,
}

/// One line of the accounting query, timestamps already in display form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRecord {
    pub jobid: u64,
    pub name: String,
    pub partition: String,
    pub state: String,
    pub elapsed: String,
    pub start: String,
    pub end: String,
}

impl PollRecord {
    pub fn new(jobid: u64, state: &str) -> Self {
        Self {
            jobid,
            name: String::new(),
            partition: String::new(),
            state: state.to_string(),
            elapsed: String::new(),
            start: String::new(),
            end: String::new(),
        }
    }
}

/// Rows restricted to a subset of columns, rendered as strings for display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Projection {
    /// column-aligned plain text table, header first
    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(cell.chars().count());
                }
            }
        }
        let format_line = |cells: &[String]| -> String {
            cells
                .iter()
                .zip(widths.iter())
                .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        };
        let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        let mut lines = vec![format_line(self.columns.as_slice()), format_line(separator.as_slice())];
        lines.extend(self.rows.iter().map(|row| format_line(row.as_slice())));
        lines.join("\n")
    }
}

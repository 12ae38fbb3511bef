use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;
use myslurm_data::{PollRecord, Projection, SubmittedJob};
use tracing::{debug, info, instrument, warn};

use crate::{
    bridge::normalize_timestamp,
    error::{Error, Result},
    table::{ColumnType, Entry, Schema, Table, TableError, Upserted, DELIMITER},
};

pub const JOB_ID: &str = "JobID";
pub const JOB_NAME: &str = "JobName";
pub const WORK_DIR: &str = "WorkDir";
pub const PARTITION: &str = "Partition";
pub const OUTPUT: &str = "Output";
pub const STATE: &str = "State";
pub const ELAPSED: &str = "Elapsed";
pub const START: &str = "Start";
pub const END: &str = "End";
pub const CPUS: &str = "CPUs";
pub const TIME_LIMIT: &str = "TimeLimit";

/// On-disk column order of the job table.
pub const JOB_COLUMNS: [(&str, ColumnType); 12] = [
    ("index", ColumnType::Integer),
    (JOB_ID, ColumnType::Integer),
    (JOB_NAME, ColumnType::Text),
    (WORK_DIR, ColumnType::Text),
    (PARTITION, ColumnType::Text),
    (OUTPUT, ColumnType::Text),
    (STATE, ColumnType::Text),
    (ELAPSED, ColumnType::Text),
    (START, ColumnType::Timestamp),
    (END, ColumnType::Timestamp),
    (CPUS, ColumnType::Integer),
    (TIME_LIMIT, ColumnType::Text),
];

/// Columns shown when listing jobs. `index` is only valid for the listing it appears in.
pub const SUMMARY_COLUMNS: [&str; 6] = ["index", JOB_ID, JOB_NAME, STATE, ELAPSED, START];

pub fn job_schema() -> std::result::Result<Schema, TableError> {
    Schema::new(&JOB_COLUMNS)
}

/// Keeps well formed display timestamps, converts scheduler timestamps, drops anything else.
fn clean_timestamp(raw: &str) -> String {
    let normalized = normalize_timestamp(raw);
    if !normalized.is_empty() {
        return normalized;
    }
    // display form carries no year, 2000 accepts Feb 29
    let with_year = format!("2000-{}", raw.trim());
    match NaiveDateTime::parse_from_str(&with_year, "%Y-%m-%d %H:%M") {
        Ok(_) => raw.trim().to_string(),
        Err(_) => String::new(),
    }
}

/// scheduler supplied text cannot be rejected, so the delimiter is replaced
fn clean_text(column: &str, raw: &str) -> String {
    if raw.contains(DELIMITER) {
        warn!("replacing {:?} in {} value {:?}", DELIMITER, column, raw);
        raw.replace(DELIMITER, ";")
    } else {
        raw.to_string()
    }
}

fn submission_entry(job: &SubmittedJob) -> Entry {
    let mut entry = Entry::new()
        .with(JOB_ID, job.jobid)
        .with(JOB_NAME, &job.name)
        .with(WORK_DIR, job.workdir.display())
        .with(OUTPUT, &job.output);
    if let Some(partition) = &job.partition {
        entry.insert(PARTITION, partition);
    }
    if let Some(cpus) = job.cpus_per_task {
        entry.insert(CPUS, cpus);
    }
    if let Some(time_limit) = &job.time_limit {
        entry.insert(TIME_LIMIT, time_limit);
    }
    entry
}

/// Fails with `TableError::InvalidValue` if `register` would refuse `job`.
/// Needs neither the table file nor its lock.
pub fn check_submission(job: &SubmittedJob) -> Result<()> {
    Table::new(job_schema()?).check(&submission_entry(job))?;
    Ok(())
}

/// The job table plus the file it lives in.
///
/// Rows are always kept sorted by descending job id, so `index` values are fresh
/// for the lifetime of this value and must not be reused after it is dropped.
pub struct JobRegistry {
    table: Table,
    path: PathBuf,
}

impl JobRegistry {
    /// Loads the job table, starting empty if there is no file yet.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let schema = job_schema()?;
        let table = match Table::load(path, schema.clone()) {
            Ok(table) => {
                debug!("loaded {} jobs", table.len());
                table
            }
            Err(TableError::NotFound(_)) => {
                info!("no job table yet, starting empty");
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Table::new(schema)
            }
            Err(err) => return Err(err.into()),
        };
        let mut registry = Self {
            table,
            path: path.to_path_buf(),
        };
        registry.sort()?;
        Ok(registry)
    }

    fn sort(&mut self) -> Result<()> {
        self.table.sort_by(JOB_ID, true)?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.table.save(&self.path)?;
        debug!("saved {} jobs to {}", self.table.len(), self.path.display());
        Ok(())
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// record a freshly submitted job and persist
    #[instrument(skip(self, job), fields(jobid = job.jobid))]
    pub fn register(&mut self, job: &SubmittedJob) -> Result<()> {
        let outcome = self.table.upsert(&submission_entry(job), JOB_ID)?;
        if let Upserted::Updated(_) = outcome {
            info!("job was already tracked, submission fields overwritten");
        }
        self.sort()?;
        self.save()?;
        info!("registered job {}", job.jobid);
        Ok(())
    }

    /// Merges one accounting record without saving.
    /// Known jobs only get their status fields overwritten.
    pub fn apply_poll_update(&mut self, record: &PollRecord) -> Result<Upserted> {
        let known = self
            .table
            .find_row(JOB_ID, &record.jobid.to_string())?
            .is_some();
        let mut entry = Entry::new()
            .with(JOB_ID, record.jobid)
            .with(STATE, clean_text(STATE, &record.state))
            .with(ELAPSED, clean_text(ELAPSED, &record.elapsed))
            .with(START, clean_timestamp(&record.start))
            .with(END, clean_timestamp(&record.end));
        if !known {
            entry.insert(JOB_NAME, clean_text(JOB_NAME, &record.name));
            entry.insert(PARTITION, clean_text(PARTITION, &record.partition));
        }
        Ok(self.table.upsert(&entry, JOB_ID)?)
    }

    /// apply a whole poll, then sort and persist once
    #[instrument(skip_all, fields(records = records.len()))]
    pub fn refresh(&mut self, records: &[PollRecord]) -> Result<()> {
        let mut inserted = 0;
        for record in records {
            if let Upserted::Inserted(_) = self.apply_poll_update(record)? {
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!("{} jobs seen for the first time", inserted);
        }
        self.sort()?;
        self.save()
    }

    pub fn resolve_index(&self, jobid: u64) -> Result<usize> {
        self.table
            .find_row(JOB_ID, &jobid.to_string())?
            .ok_or_else(|| Error::UnknownJob(jobid.to_string()))
    }

    pub fn resolve_jobid(&self, index: usize) -> Result<u64> {
        match self.table.get(JOB_ID, index)?.as_integer() {
            Some(jobid) if jobid >= 0 => Ok(jobid as u64),
            _ => Err(Error::UnknownJob(format!("at index {}", index))),
        }
    }

    /// `WorkDir` joined with `Output`
    pub fn resolved_log_path(&self, index: usize) -> Result<PathBuf> {
        let workdir = self.table.get(WORK_DIR, index)?;
        let output = self.table.get(OUTPUT, index)?;
        match (workdir.as_text(), output.as_text()) {
            (Some(workdir), Some(output)) => Ok(Path::new(workdir).join(output)),
            _ => Err(Error::LogUnavailable {
                jobid: self.table.get(JOB_ID, index)?.to_string(),
                reason: "job was not submitted through myslurm, output path unknown".to_string(),
            }),
        }
    }

    /// First `limit` rows in current order, `None` if no job is tracked.
    pub fn render_summary(&self, limit: usize) -> Result<Option<Projection>> {
        if self.table.is_empty() {
            return Ok(None);
        }
        let end = limit.min(self.table.len());
        Ok(Some(self.table.project_rows(&SUMMARY_COLUMNS, 0..end)?))
    }

    pub fn render_entry(&self, index: usize) -> Result<Projection> {
        Ok(self
            .table
            .project_rows(&SUMMARY_COLUMNS, index..index + 1)?)
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, fs, path::PathBuf};

    use myslurm_data::{PollRecord, SubmittedJob};
    use tempfile::tempdir;

    use super::{check_submission, JobRegistry, JOB_ID};
    use crate::{
        bridge::format_output_path,
        error::Error,
        table::{TableError, Upserted, Value},
        test_support::setup,
    };

    fn job(jobid: u64, name: &str) -> SubmittedJob {
        SubmittedJob {
            jobid,
            name: name.to_string(),
            workdir: PathBuf::from("/home/user/project"),
            partition: Some("gpu".to_string()),
            output: format_output_path("%x.%j.out", name, jobid),
            cpus_per_task: Some(4),
            time_limit: None,
        }
    }

    fn text(registry: &JobRegistry, column: &str, index: usize) -> String {
        registry.table().get(column, index).unwrap().to_string()
    }

    #[test]
    fn test_open_missing_starts_empty() {
        setup();
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.csv");
        let registry = JobRegistry::open(&path).unwrap();
        assert!(registry.is_empty());
        assert!(registry.render_summary(10).unwrap().is_none());
        registry.save().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            "index,JobID,JobName,WorkDir,Partition,Output,State,Elapsed,Start,End,CPUs,TimeLimit\n",
            content
        );
    }

    #[test]
    fn test_submit_then_poll() {
        setup();
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.csv");
        let mut registry = JobRegistry::open(&path).unwrap();
        registry.register(&job(42, "run1")).unwrap();
        assert_eq!("run1.42.out", text(&registry, "Output", 0));
        assert_eq!("", text(&registry, "State", 0));

        let mut registry = JobRegistry::open(&path).unwrap();
        let record = PollRecord {
            jobid: 42,
            name: "renamed".to_string(),
            partition: "cpu".to_string(),
            state: "COMPLETED".to_string(),
            elapsed: "00:01:05".to_string(),
            start: "03-01 10:15".to_string(),
            end: "2024-03-01T10:16:05".to_string(),
        };
        registry.refresh(&[record]).unwrap();

        let registry = JobRegistry::open(&path).unwrap();
        assert_eq!(1, registry.len());
        assert_eq!("COMPLETED", text(&registry, "State", 0));
        assert_eq!("00:01:05", text(&registry, "Elapsed", 0));
        assert_eq!("03-01 10:15", text(&registry, "Start", 0));
        assert_eq!("03-01 10:16", text(&registry, "End", 0));
        assert_eq!("run1", text(&registry, "JobName", 0));
        assert_eq!("/home/user/project", text(&registry, "WorkDir", 0));
        assert_eq!("gpu", text(&registry, "Partition", 0));
        assert_eq!("run1.42.out", text(&registry, "Output", 0));
        assert_eq!("4", text(&registry, "CPUs", 0));
    }

    #[test]
    fn test_poll_of_unseen_job_creates_row() {
        setup();
        let dir = tempdir().unwrap();
        let mut registry = JobRegistry::open(&dir.path().join("jobs.csv")).unwrap();
        let mut record = PollRecord::new(7, "RUNNING");
        record.name = "interactive,bash".to_string();
        record.partition = "debug".to_string();
        record.start = "Unknown".to_string();
        assert_eq!(Upserted::Inserted(0), registry.apply_poll_update(&record).unwrap());
        assert_eq!("interactive;bash", text(&registry, "JobName", 0));
        assert_eq!("debug", text(&registry, "Partition", 0));
        assert_eq!("", text(&registry, "Start", 0));
        assert_eq!("", text(&registry, "WorkDir", 0));

        match registry.resolved_log_path(0) {
            Err(Error::LogUnavailable { jobid, .. }) => assert_eq!("7", jobid),
            other => panic!("expected unavailable log, got {:?}", other),
        }
    }

    #[test]
    fn test_poll_update_is_idempotent_and_unique() {
        setup();
        let dir = tempdir().unwrap();
        let mut registry = JobRegistry::open(&dir.path().join("jobs.csv")).unwrap();
        registry.register(&job(10, "a")).unwrap();
        registry.register(&job(11, "b")).unwrap();
        let records = vec![
            PollRecord::new(10, "RUNNING"),
            PollRecord::new(12, "PENDING"),
            PollRecord::new(10, "RUNNING"),
        ];
        registry.refresh(&records).unwrap();
        let once = registry.table().clone();
        registry.refresh(&records).unwrap();
        assert_eq!(&once, registry.table());
        registry.register(&job(12, "c")).unwrap();

        let ids: Vec<&Value> = registry
            .table()
            .rows()
            .iter()
            .map(|row| &row[1])
            .collect();
        let unique: HashSet<&Value> = ids.iter().copied().collect();
        assert_eq!(3, ids.len());
        assert_eq!(ids.len(), unique.len());
        assert_eq!("c", text(&registry, "JobName", 0));
    }

    #[test]
    fn test_rows_sorted_with_fresh_index() {
        setup();
        let dir = tempdir().unwrap();
        let mut registry = JobRegistry::open(&dir.path().join("jobs.csv")).unwrap();
        for jobid in [5, 900, 42] {
            registry.register(&job(jobid, "x")).unwrap();
        }
        let ids: Vec<u64> = (0..3).map(|i| registry.resolve_jobid(i).unwrap()).collect();
        assert_eq!(vec![900, 42, 5], ids);
        for position in 0..3 {
            assert_eq!(position.to_string(), text(&registry, "index", position));
        }
        assert_eq!(1, registry.resolve_index(42).unwrap());
    }

    #[test]
    fn test_resolution_errors() {
        setup();
        let dir = tempdir().unwrap();
        let mut registry = JobRegistry::open(&dir.path().join("jobs.csv")).unwrap();
        registry.register(&job(42, "run1")).unwrap();
        assert!(matches!(
            registry.resolve_index(43),
            Err(Error::UnknownJob(_))
        ));
        assert!(matches!(
            registry.resolve_jobid(1),
            Err(Error::Table(TableError::IndexOutOfRange { index: 1, len: 1 }))
        ));
        assert!(matches!(
            registry.render_entry(3),
            Err(Error::Table(TableError::IndexOutOfRange { .. }))
        ));
        assert_eq!(
            PathBuf::from("/home/user/project/run1.42.out"),
            registry.resolved_log_path(0).unwrap()
        );
    }

    #[test]
    fn test_render() {
        setup();
        let dir = tempdir().unwrap();
        let mut registry = JobRegistry::open(&dir.path().join("jobs.csv")).unwrap();
        for jobid in 1..=4 {
            registry.register(&job(jobid, "x")).unwrap();
        }
        let summary = registry.render_summary(2).unwrap().unwrap();
        assert_eq!(
            vec!["index", JOB_ID, "JobName", "State", "Elapsed", "Start"],
            summary.columns
        );
        assert_eq!(2, summary.rows.len());
        assert_eq!("4", summary.rows[0][1]);
        assert_eq!(4, registry.render_summary(50).unwrap().unwrap().rows.len());

        let entry = registry.render_entry(3).unwrap();
        assert_eq!(vec![vec!["3", "1", "x", "", "", ""]], entry.rows);
    }

    #[test]
    fn test_check_submission() {
        assert!(check_submission(&job(0, "run1")).is_ok());
        let mut bad = job(0, "run1");
        bad.output = "logs\nrun1.out".to_string();
        match check_submission(&bad) {
            Err(Error::Table(TableError::InvalidValue { column, .. })) => assert_eq!("Output", column),
            other => panic!("expected invalid output, got {:?}", other),
        }
        let mut bad = job(0, "run1");
        bad.time_limit = Some("1,00:00".to_string());
        assert!(check_submission(&bad).is_err());
    }

    #[test]
    fn test_register_rejects_delimiter() {
        setup();
        let dir = tempdir().unwrap();
        let mut registry = JobRegistry::open(&dir.path().join("jobs.csv")).unwrap();
        let mut bad = job(1, "x");
        bad.workdir = PathBuf::from("/data/a,b");
        assert!(matches!(
            registry.register(&bad),
            Err(Error::Table(TableError::InvalidValue { .. }))
        ));
        assert!(registry.is_empty());
    }
}

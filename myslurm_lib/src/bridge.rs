use chrono::NaiveDateTime;
use myslurm_data::{PollRecord, POLL_FIELDS};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::SchedulerConfig,
    error::{Error, Result},
    process::{CommandOutput, CommandRunner, ProcessRunner},
};

const SCHEDULER_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DISPLAY_TIME_FORMAT: &str = "%m-%d %H:%M";

/// Talks to the batch scheduler through its command line tools.
pub struct SchedulerBridge<R = ProcessRunner> {
    config: SchedulerConfig,
    runner: R,
}

impl SchedulerBridge<ProcessRunner> {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_runner(config, ProcessRunner)
    }
}

impl<R: CommandRunner> SchedulerBridge<R> {
    pub fn with_runner(config: SchedulerConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// runs one scheduler command, killing it if it outlives the configured timeout
    async fn invoke(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        match timeout(self.config.timeout(), self.runner.run(program, args)).await {
            Ok(output) => Ok(output?),
            Err(_elapsed) => Err(Error::Timeout {
                command: program.to_string(),
                secs: self.config.timeout_secs,
            }),
        }
    }

    /// submit a batch job, returns the scheduler assigned job id
    #[instrument(skip(self))]
    pub async fn submit(&self, args: &[String]) -> Result<u64> {
        let program = &self.config.submit_command;
        let output = self.invoke(program, args).await?;
        if !output.success() {
            return Err(Error::SubmissionFailed(output.failure_message()));
        }
        if !output.stderr.trim().is_empty() {
            warn!("{} reported: {}", program, output.stderr.trim());
        }
        let jobid = parse_job_id(&output.stdout).ok_or_else(|| {
            Error::SubmissionFailed(format!(
                "no job id in output of {}: {:?}",
                program,
                output.stdout.trim()
            ))
        })?;
        info!("submitted job {}", jobid);
        Ok(jobid)
    }

    /// current accounting records of all jobs belonging to `user`
    #[instrument(skip(self))]
    pub async fn poll(&self, user: &str) -> Result<Vec<PollRecord>> {
        let program = &self.config.query_command;
        let args = vec![
            "-u".to_string(),
            user.to_string(),
            format!("--format={}", POLL_FIELDS.join(",")),
            "-n".to_string(),
            "-X".to_string(),
            "-P".to_string(),
        ];
        let output = self.invoke(program, &args).await?;
        if !output.success() {
            return Err(Error::SchedulerFailed {
                command: program.to_string(),
                stderr: output.failure_message(),
            });
        }
        let records = parse_poll_output(&output.stdout)?;
        info!("polled {} jobs", records.len());
        Ok(records)
    }

    /// ask the scheduler to cancel a job, the local record is kept
    #[instrument(skip(self))]
    pub async fn cancel(&self, jobid: u64) -> Result<()> {
        let program = &self.config.cancel_command;
        let output = self.invoke(program, &[jobid.to_string()]).await?;
        if !output.success() {
            return Err(Error::SchedulerFailed {
                command: program.to_string(),
                stderr: output.failure_message(),
            });
        }
        info!("cancelled job {}", jobid);
        Ok(())
    }
}

/// first whitespace separated token made only of digits
pub fn parse_job_id(stdout: &str) -> Option<u64> {
    stdout
        .split_whitespace()
        .filter(|token| token.chars().all(|c| c.is_ascii_digit()))
        .find_map(|token| token.parse().ok())
}

/// Parses `|` separated accounting lines in `POLL_FIELDS` order.
///
/// Array and heterogeneous job allocations (`123_4`, `123_[5-9]`, `123+1`) have no row
/// of their own. The first one listed stands in for the parent job id unless the parent
/// is listed itself.
pub fn parse_poll_output(stdout: &str) -> Result<Vec<PollRecord>> {
    let mut records = Vec::new();
    let mut compound: Vec<PollRecord> = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != POLL_FIELDS.len() {
            return Err(Error::SchedulerParse(format!(
                "expected {} fields, found {} in {:?}",
                POLL_FIELDS.len(),
                fields.len(),
                line
            )));
        }
        let raw_id = fields[0].trim();
        let (jobid, is_compound) = match raw_id.parse::<u64>() {
            Ok(jobid) => (jobid, false),
            Err(_) => match compound_parent(raw_id) {
                Some(parent) => (parent, true),
                None => {
                    return Err(Error::SchedulerParse(format!("invalid job id {:?}", raw_id)));
                }
            },
        };
        let record = PollRecord {
            jobid,
            name: fields[1].to_string(),
            partition: fields[2].to_string(),
            state: fields[3].to_string(),
            elapsed: fields[4].to_string(),
            start: normalize_timestamp(fields[5]),
            end: normalize_timestamp(fields[6]),
        };
        if !is_compound {
            records.push(record);
        } else if compound.iter().any(|r| r.jobid == jobid) {
            debug!("ignoring further task {} of job {}", raw_id, jobid);
        } else {
            compound.push(record);
        }
    }
    for record in compound {
        if records.iter().any(|r| r.jobid == record.jobid) {
            continue;
        }
        debug!("job {} reported through its first task", record.jobid);
        records.push(record);
    }
    Ok(records)
}

/// `123` for `123_4`, `123_[5-9]` and `123+1`
fn compound_parent(raw: &str) -> Option<u64> {
    let (head, _) = raw.split_once(|c: char| c == '_' || c == '+')?;
    if head.is_empty() || !head.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    head.parse().ok()
}

/// `2024-03-01T10:15:00` -> `03-01 10:15`, anything unparsable -> empty
pub fn normalize_timestamp(raw: &str) -> String {
    NaiveDateTime::parse_from_str(raw.trim(), SCHEDULER_TIME_FORMAT)
        .map(|dt| dt.format(DISPLAY_TIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// Substitutes `%x` (job name) and `%j` (job id) in an output path template.
/// Quotes are stripped from the job name first.
pub fn format_output_path(template: &str, job_name: &str, jobid: u64) -> String {
    let job_name = strip_quotes(job_name);
    template
        .replace("%x", &job_name)
        .replace("%j", &jobid.to_string())
}

pub fn strip_quotes(value: &str) -> String {
    value.replace(['\'', '"'], "")
}

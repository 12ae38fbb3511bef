use std::{
    fs,
    path::{Path, PathBuf},
};

use myslurm_data::SubmittedJob;
use tracing::{error, info, instrument};

use crate::{
    batch::{parse_directives, SubmitOptions},
    bridge::{format_output_path, strip_quotes, SchedulerBridge},
    config::Config,
    error::{Error, Result},
    lock::LockedRegistry,
    process::CommandRunner,
    registry::{check_submission, JobRegistry},
};

/// A submission as given on the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitRequest {
    pub options: SubmitOptions,
    pub script: PathBuf,
    pub script_args: Vec<String>,
}

impl SubmitRequest {
    /// arguments for the submit command, options given on the command line only
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.options.to_args();
        args.push(self.script.to_string_lossy().into_owned());
        args.extend(self.script_args.iter().cloned());
        args
    }
}

/// How the user picked a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// position in the listing produced by the same invocation
    Index(usize),
    JobId(u64),
}

impl Selection {
    /// row of the selected job, the job must be tracked
    pub fn index(&self, registry: &JobRegistry) -> Result<usize> {
        match *self {
            Selection::Index(index) => {
                registry.resolve_jobid(index)?;
                Ok(index)
            }
            Selection::JobId(jobid) => registry.resolve_index(jobid),
        }
    }

    /// a job id is accepted as is, tracked or not
    pub fn jobid(&self, registry: &JobRegistry) -> Result<u64> {
        match *self {
            Selection::Index(index) => registry.resolve_jobid(index),
            Selection::JobId(jobid) => Ok(jobid),
        }
    }
}

fn submitted_job(
    options: &SubmitOptions,
    request: &SubmitRequest,
    workdir: &Path,
    jobid: u64,
) -> SubmittedJob {
    let name = strip_quotes(&options.job_name_or_default(&request.script));
    SubmittedJob {
        jobid,
        output: format_output_path(options.output_or_default(), &name, jobid),
        name,
        workdir: workdir.to_path_buf(),
        partition: options.partition.clone(),
        cpus_per_task: options.cpus_per_task,
        time_limit: options.time.clone(),
    }
}

/// Submits the script, then records the job under the table lock.
/// Values the job table cannot store are refused before the scheduler sees the job.
#[instrument(skip_all, fields(script = %request.script.display()))]
pub async fn submit<R: CommandRunner>(
    config: &Config,
    bridge: &SchedulerBridge<R>,
    request: &SubmitRequest,
    workdir: &Path,
) -> Result<SubmittedJob> {
    let script_path = workdir.join(&request.script);
    let script = fs::read_to_string(&script_path).map_err(|err| {
        Error::SubmissionFailed(format!(
            "cannot read batch script {}: {}",
            script_path.display(),
            err
        ))
    })?;
    let directives = SubmitOptions::from_args(&parse_directives(&script));
    let options = request.options.clone().merge(directives);
    // the job id is not known yet, any digits stand in for `%j`
    check_submission(&submitted_job(&options, request, workdir, 0))?;

    let jobid = bridge.submit(&request.to_args()).await?;

    let job = submitted_job(&options, request, workdir, jobid);
    let recorded = match LockedRegistry::open(config).await {
        Ok(mut registry) => registry.register(&job),
        Err(err) => Err(err),
    };
    if let Err(err) = recorded {
        error!("job {} was submitted but could not be recorded", jobid);
        return Err(err);
    }
    Ok(job)
}

/// Polls the scheduler and merges the result into the job table.
/// The returned registry still holds the lock, indexes resolved against it are current.
#[instrument(skip(config, bridge))]
pub async fn refresh<R: CommandRunner>(
    config: &Config,
    bridge: &SchedulerBridge<R>,
    user: &str,
) -> Result<LockedRegistry> {
    let records = bridge.poll(user).await?;
    let mut registry = LockedRegistry::open(config).await?;
    registry.refresh(&records)?;
    Ok(registry)
}

/// Cancels the selected job. The local record stays until the next poll updates its state.
pub async fn cancel<R: CommandRunner>(
    bridge: &SchedulerBridge<R>,
    registry: &JobRegistry,
    selection: Selection,
) -> Result<u64> {
    let jobid = selection.jobid(registry)?;
    info!("cancelling job {}", jobid);
    bridge.cancel(jobid).await?;
    Ok(jobid)
}

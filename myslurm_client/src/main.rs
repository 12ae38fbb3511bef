use std::{path::PathBuf, process};

use myslurm_lib::{batch::SubmitOptions, config::Config, workflow::SubmitRequest};
use structopt::{clap::AppSettings, StructOpt};
use tracing_subscriber::EnvFilter;

use crate::operations::{LogView, QueueAction, QueueRequest};

mod operations;

/// Keeps track of jobs submitted to a Slurm-like batch scheduler
#[derive(StructOpt, Debug)]
#[structopt(name = "myslurm")]
struct Opt {
    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Debug, StructOpt)]
enum Operation {
    /// Submit a batch script and record the job
    Submit(SubmitOperation),
    /// Refresh job states, then list, show or cancel jobs
    Queue(QueueOperation),
}

#[derive(Debug, StructOpt)]
#[structopt(setting = AppSettings::TrailingVarArg)]
struct SubmitOperation {
    /// Name of the job, overrides the script's directive
    #[structopt(short = "J", long = "job-name")]
    job_name: Option<String>,
    /// Partition to run in
    #[structopt(short, long)]
    partition: Option<String>,
    /// Log file location, `%x` is the job name and `%j` the job id
    #[structopt(short, long)]
    output: Option<String>,
    #[structopt(short, long = "cpus-per-task")]
    cpus_per_task: Option<u32>,
    /// Time limit
    #[structopt(short, long)]
    time: Option<String>,
    #[structopt(name = "SCRIPT", parse(from_os_str))]
    script: PathBuf,
    /// Arguments passed on to the script
    #[structopt(name = "ARGS")]
    args: Vec<String>,
}

#[derive(Debug, StructOpt)]
struct QueueOperation {
    /// List jobs
    #[structopt(short, long)]
    list: bool,
    /// Select job by index of the listing
    #[structopt(short = "j", long = "jobindex")]
    index: Option<usize>,
    /// Select job by job id
    #[structopt(short = "J", long = "jobid", conflicts_with = "index")]
    jobid: Option<u64>,
    /// Show log file for selected job
    #[structopt(short, long)]
    output: bool,
    /// Tail log file for selected job (default is cat)
    #[structopt(short, long)]
    tail: bool,
    /// Follow log file for selected job like `tail -f`
    #[structopt(short = "T", long = "tailf")]
    tail_follow: bool,
    /// Number of jobs to display
    #[structopt(short, long = "numjobs", default_value = "10")]
    numjobs: usize,
    /// Cancel the selected job
    #[structopt(short, long)]
    cancel: bool,
    /// Print JSON instead of a table
    #[structopt(long)]
    json: bool,
    /// Poll jobs of this user instead of the invoking one
    #[structopt(short, long)]
    user: Option<String>,
}

impl From<SubmitOperation> for SubmitRequest {
    fn from(op: SubmitOperation) -> Self {
        SubmitRequest {
            options: SubmitOptions {
                job_name: op.job_name,
                partition: op.partition,
                output: op.output,
                cpus_per_task: op.cpus_per_task,
                time: op.time,
            },
            script: op.script,
            script_args: op.args,
        }
    }
}

impl From<QueueOperation> for QueueRequest {
    fn from(op: QueueOperation) -> Self {
        let action = if op.list {
            QueueAction::List
        } else if op.output {
            let view = if op.tail_follow {
                LogView::Follow
            } else if op.tail {
                LogView::Tail
            } else {
                LogView::Cat
            };
            QueueAction::ShowLog(view)
        } else if op.cancel {
            QueueAction::Cancel
        } else if op.index.is_some() || op.jobid.is_some() {
            QueueAction::Show
        } else {
            QueueAction::List
        };
        QueueRequest {
            action,
            index: op.index,
            jobid: op.jobid,
            limit: op.numjobs,
            json: op.json,
            user: op.user,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    let opt = Opt::from_args();
    let result = match Config::load() {
        Ok(config) => match opt.operation {
            Operation::Submit(op) => operations::submit(&config, op.into()).await,
            Operation::Queue(op) => operations::queue(&config, op.into()).await,
        },
        Err(err) => Err(err.into()),
    };
    if let Err(err) = result {
        eprintln!("myslurm: {}", err);
        process::exit(1);
    }
}

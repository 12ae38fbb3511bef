use std::{
    env, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use myslurm_data::Projection;
use myslurm_lib::{
    bridge::SchedulerBridge,
    config::{invoking_user, Config},
    registry::JobRegistry,
    workflow::{self, Selection, SubmitRequest},
    Error,
};
use tokio::process::Command;
use tracing::info;

const TAIL_LINES: usize = 10;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Lib(#[from] Error),

    #[error("{0}")]
    Usage(String),

    #[error("could not write output: {0}")]
    Output(#[from] io::Error),

    #[error("could not serialize output: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CliResult = Result<(), CliError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogView {
    Cat,
    Tail,
    Follow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueAction {
    List,
    Show,
    ShowLog(LogView),
    Cancel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueRequest {
    pub action: QueueAction,
    pub index: Option<usize>,
    pub jobid: Option<u64>,
    pub limit: usize,
    pub json: bool,
    pub user: Option<String>,
}

impl QueueRequest {
    fn selection(&self) -> Result<Selection, CliError> {
        match (self.index, self.jobid) {
            (Some(index), _) => Ok(Selection::Index(index)),
            (None, Some(jobid)) => Ok(Selection::JobId(jobid)),
            (None, None) => Err(CliError::Usage(
                "select a job with -j <index> or -J <jobid>".to_string(),
            )),
        }
    }
}

pub async fn submit(config: &Config, request: SubmitRequest) -> CliResult {
    let workdir = env::current_dir().map_err(Error::from)?;
    let bridge = SchedulerBridge::new(config.scheduler.clone());
    let job = workflow::submit(config, &bridge, &request, &workdir).await?;
    println!("Submitted batch job {}", job.jobid);
    println!("Registered job {} as {}, logging to {}", job.jobid, job.name, job.output);
    Ok(())
}

pub async fn queue(config: &Config, request: QueueRequest) -> CliResult {
    let user = request.user.clone().unwrap_or_else(invoking_user);
    let bridge = SchedulerBridge::new(config.scheduler.clone());
    let registry = workflow::refresh(config, &bridge, &user).await?;

    match request.action {
        QueueAction::List => match registry.render_summary(request.limit)? {
            Some(summary) => print_projection(&summary, request.json),
            None => {
                println!("No jobs tracked yet.");
                Ok(())
            }
        },
        QueueAction::Show => {
            let index = request.selection()?.index(&registry)?;
            print_projection(&registry.render_entry(index)?, request.json)
        }
        QueueAction::ShowLog(view) => {
            let index = request.selection()?.index(&registry)?;
            print_projection(&registry.render_entry(index)?, request.json)?;
            let path = existing_log(&registry, index)?;
            // the table is not touched while paging, let other invocations in
            drop(registry);
            show_log(&path, view).await
        }
        QueueAction::Cancel => {
            let selection = request.selection()?;
            let jobid = selection.jobid(&registry)?;
            println!("Cancelling {}", jobid);
            workflow::cancel(&bridge, &registry, selection).await?;
            Ok(())
        }
    }
}

fn print_projection(projection: &Projection, json: bool) -> CliResult {
    if json {
        println!("{}", serde_json::to_string_pretty(projection)?);
    } else {
        println!("{}", projection.render());
    }
    Ok(())
}

fn existing_log(registry: &JobRegistry, index: usize) -> Result<PathBuf, CliError> {
    let path = registry.resolved_log_path(index)?;
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::LogUnavailable {
            jobid: registry.resolve_jobid(index)?.to_string(),
            reason: format!("could not find output file\n\t{}", path.display()),
        }
        .into())
    }
}

async fn show_log(path: &Path, view: LogView) -> CliResult {
    info!("showing {}", path.display());
    match view {
        LogView::Cat => {
            let content = fs::read(path)?;
            io::stdout().write_all(&content)?;
        }
        LogView::Tail => {
            let content = fs::read(path)?;
            io::stdout().write_all(last_lines(&content, TAIL_LINES))?;
        }
        LogView::Follow => {
            // runs until interrupted
            let status = Command::new("tail").arg("-f").arg(path).status().await?;
            if !status.success() {
                return Err(CliError::Usage(format!("tail exited with {}", status)));
            }
        }
    }
    Ok(())
}

/// the last `n` lines of `content`, a missing final newline does not count as a line
fn last_lines(content: &[u8], n: usize) -> &[u8] {
    if n == 0 {
        return &content[content.len()..];
    }
    let body = content.strip_suffix(b"\n").unwrap_or(content);
    let start = body
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, byte)| **byte == b'\n')
        .nth(n.saturating_sub(1))
        .map(|(i, _)| i + 1)
        .unwrap_or(0);
    &content[start..]
}

#[cfg(test)]
mod test {
    use super::{last_lines, QueueAction, QueueRequest};
    use myslurm_lib::workflow::Selection;

    #[test]
    fn test_last_lines() {
        assert_eq!(b"c\nd\n", last_lines(b"a\nb\nc\nd\n", 2));
        assert_eq!(b"c\nd", last_lines(b"a\nb\nc\nd", 2));
        assert_eq!(b"a\nb\n", last_lines(b"a\nb\n", 10));
        assert_eq!(b"", last_lines(b"a\nb\n", 0));
        assert_eq!(b"", last_lines(b"", 3));
    }

    #[test]
    fn test_selection_required() {
        let mut request = QueueRequest {
            action: QueueAction::Cancel,
            index: None,
            jobid: None,
            limit: 10,
            json: false,
            user: None,
        };
        assert!(request.selection().is_err());
        request.jobid = Some(42);
        assert_eq!(Selection::JobId(42), request.selection().unwrap());
        request.index = Some(3);
        assert_eq!(Selection::Index(3), request.selection().unwrap());
    }
}

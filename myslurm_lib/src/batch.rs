//! `#SBATCH` directive lines and the handful of submission options the job table records.

use std::path::Path;

use tracing::warn;

use crate::bridge::strip_quotes;

pub const DIRECTIVE_PREFIX: &str = "#SBATCH";
/// what the scheduler writes to when no output option is given
pub const DEFAULT_OUTPUT: &str = "slurm-%j.out";

/// Submission options worth recording. Everything else is left to the scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub job_name: Option<String>,
    pub partition: Option<String>,
    pub output: Option<String>,
    pub cpus_per_task: Option<u32>,
    pub time: Option<String>,
}

#[derive(Clone, Copy)]
enum Flag {
    JobName,
    Partition,
    Output,
    CpusPerTask,
    Time,
}

impl Flag {
    fn from_long(name: &str) -> Option<Self> {
        match name {
            "job-name" => Some(Flag::JobName),
            "partition" => Some(Flag::Partition),
            "output" => Some(Flag::Output),
            "cpus-per-task" => Some(Flag::CpusPerTask),
            "time" => Some(Flag::Time),
            _ => None,
        }
    }

    fn from_short(name: char) -> Option<Self> {
        match name {
            'J' => Some(Flag::JobName),
            'p' => Some(Flag::Partition),
            'o' => Some(Flag::Output),
            'c' => Some(Flag::CpusPerTask),
            't' => Some(Flag::Time),
            _ => None,
        }
    }
}

impl SubmitOptions {
    /// Picks the known options out of an sbatch style argument list,
    /// `-J name`, `-Jname` and `--job-name=name` alike. Unknown tokens are skipped.
    pub fn from_args(args: &[String]) -> Self {
        let mut options = Self::default();
        let mut tokens = args.iter();
        while let Some(token) = tokens.next() {
            let (flag, inline) = if let Some(long) = token.strip_prefix("--") {
                match long.split_once('=') {
                    Some((name, value)) => (Flag::from_long(name), Some(value.to_string())),
                    None => (Flag::from_long(long), None),
                }
            } else if let Some(short) = token.strip_prefix('-') {
                let mut chars = short.chars();
                match chars.next() {
                    Some(c) => {
                        let rest = chars.as_str();
                        let inline = if rest.is_empty() {
                            None
                        } else {
                            Some(rest.trim_start_matches('=').to_string())
                        };
                        (Flag::from_short(c), inline)
                    }
                    None => (None, None),
                }
            } else {
                (None, None)
            };
            let flag = match flag {
                Some(flag) => flag,
                None => continue,
            };
            let value = match inline.or_else(|| tokens.next().cloned()) {
                Some(value) => value,
                None => break,
            };
            options.set(flag, value);
        }
        options
    }

    fn set(&mut self, flag: Flag, value: String) {
        match flag {
            Flag::JobName => self.job_name = Some(strip_quotes(&value)),
            Flag::Partition => self.partition = Some(value),
            Flag::Output => self.output = Some(value),
            Flag::CpusPerTask => match value.parse() {
                Ok(cpus) => self.cpus_per_task = Some(cpus),
                Err(_) => warn!("ignoring invalid cpus-per-task value {:?}", value),
            },
            Flag::Time => self.time = Some(value),
        }
    }

    /// field by field, `self` wins over `fallback`
    pub fn merge(self, fallback: SubmitOptions) -> Self {
        Self {
            job_name: self.job_name.or(fallback.job_name),
            partition: self.partition.or(fallback.partition),
            output: self.output.or(fallback.output),
            cpus_per_task: self.cpus_per_task.or(fallback.cpus_per_task),
            time: self.time.or(fallback.time),
        }
    }

    /// long form arguments for the submit command
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(name) = &self.job_name {
            args.push(format!("--job-name={}", name));
        }
        if let Some(partition) = &self.partition {
            args.push(format!("--partition={}", partition));
        }
        if let Some(output) = &self.output {
            args.push(format!("--output={}", output));
        }
        if let Some(cpus) = self.cpus_per_task {
            args.push(format!("--cpus-per-task={}", cpus));
        }
        if let Some(time) = &self.time {
            args.push(format!("--time={}", time));
        }
        args
    }

    /// the scheduler names a job after its script unless told otherwise
    pub fn job_name_or_default(&self, script: &Path) -> String {
        match &self.job_name {
            Some(name) => name.clone(),
            None => script
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "sbatch".to_string()),
        }
    }

    pub fn output_or_default(&self) -> &str {
        self.output.as_deref().unwrap_or(DEFAULT_OUTPUT)
    }
}

/// Argument tokens of the script's directive lines.
/// Like the scheduler, stops at the first line that is neither blank nor a comment.
pub fn parse_directives(script: &str) -> Vec<String> {
    let mut args = Vec::new();
    for line in script.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('#') {
            break;
        }
        if let Some(rest) = line.strip_prefix(DIRECTIVE_PREFIX) {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                args.extend(split_quoted(rest));
            }
        }
    }
    args
}

/// whitespace split that keeps quoted runs together and drops the quotes
fn split_quoted(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::{parse_directives, SubmitOptions, DEFAULT_OUTPUT};

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    const SCRIPT: &str = "#!/bin/bash\n\
                          #SBATCH --job-name=\"train model\"\n\
                          #SBATCH -p gpu\n\
                          \n\
                          # a comment\n\
                          #SBATCH --output=logs/%x_%j.log --cpus-per-task=8\n\
                          #SBATCHING is not a directive\n\
                          python train.py\n\
                          #SBATCH --time=1:00:00\n";

    #[test]
    fn test_parse_directives() {
        assert_eq!(
            args(&[
                "--job-name=train model",
                "-p",
                "gpu",
                "--output=logs/%x_%j.log",
                "--cpus-per-task=8",
            ]),
            parse_directives(SCRIPT)
        );
    }

    #[test]
    fn test_options_from_args() {
        let options = SubmitOptions::from_args(&parse_directives(SCRIPT));
        assert_eq!(Some("train model".to_string()), options.job_name);
        assert_eq!(Some("gpu".to_string()), options.partition);
        assert_eq!(Some("logs/%x_%j.log".to_string()), options.output);
        assert_eq!(Some(8), options.cpus_per_task);
        assert_eq!(None, options.time);

        let options = SubmitOptions::from_args(&args(&[
            "-J'train'",
            "--mem",
            "4G",
            "-t",
            "2:00:00",
            "-c",
            "many",
            "--partition",
        ]));
        assert_eq!(Some("train".to_string()), options.job_name);
        assert_eq!(Some("2:00:00".to_string()), options.time);
        assert_eq!(None, options.cpus_per_task);
        assert_eq!(None, options.partition);
    }

    #[test]
    fn test_cli_values_take_precedence() {
        let cli = SubmitOptions {
            job_name: Some("override".to_string()),
            ..SubmitOptions::default()
        };
        let merged = cli.merge(SubmitOptions::from_args(&parse_directives(SCRIPT)));
        assert_eq!(Some("override".to_string()), merged.job_name);
        assert_eq!(Some("gpu".to_string()), merged.partition);
        assert_eq!(
            args(&[
                "--job-name=override",
                "--partition=gpu",
                "--output=logs/%x_%j.log",
                "--cpus-per-task=8",
            ]),
            merged.to_args()
        );
    }

    #[test]
    fn test_defaults() {
        let options = SubmitOptions::default();
        assert_eq!("run.sh", options.job_name_or_default(Path::new("jobs/run.sh")));
        assert_eq!(DEFAULT_OUTPUT, options.output_or_default());
    }
}

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};

/// Overrides the data directory, otherwise `~/.myslurm`.
pub const HOME_ENV: &str = "MYSLURM_HOME";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// directory holding the job table, its lock file and `config.toml`
    pub data_dir: PathBuf,
    pub table_file: String,
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
}

/// Names of the scheduler's command line tools.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub submit_command: String,
    pub query_command: String,
    pub cancel_command: String,
    /// upper bound for a single scheduler command, a stalled command is killed
    pub timeout_secs: u64,
}

/// Retry policy while another invocation holds the table lock.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            table_file: "jobs.csv".to_string(),
            scheduler: SchedulerConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit_command: "sbatch".to_string(),
            query_command: "sacct".to_string(),
            cancel_command: "scancel".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: 40,
            backoff_ms: 25,
            max_backoff_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// login name used to filter the accounting query
pub fn invoking_user() -> String {
    whoami::username()
}

fn default_data_dir() -> PathBuf {
    match env::var_os(HOME_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".myslurm"),
    }
}

impl Config {
    /// Defaults, overridden by `<data_dir>/config.toml` when it exists.
    pub fn load() -> Result<Self> {
        let data_dir = default_data_dir();
        let mut config = Self::load_file(&data_dir.join(CONFIG_FILE))?.unwrap_or_default();
        // the file may not relocate the directory it was found in
        config.data_dir = data_dir;
        Ok(config)
    }

    /// `Ok(None)` when the file does not exist
    pub fn load_file(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        info!("loading configuration from {}", path.display());
        let config = Self::parse(&content)
            .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?;
        Ok(Some(config))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.table_file.is_empty() || self.table_file.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::Config(format!(
                "table_file must be a plain file name, got {:?}",
                self.table_file
            )));
        }
        if self.scheduler.timeout_secs == 0 {
            return Err(Error::Config("scheduler.timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn table_path(&self) -> PathBuf {
        self.data_dir.join(&self.table_file)
    }

    /// config rooted at `dir`, used by tests and embedders
    pub fn with_data_dir(dir: &Path) -> Self {
        Self {
            data_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::tempdir;

    use super::Config;
    use crate::error::Error;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!("jobs.csv", config.table_file);
        assert_eq!("sbatch", config.scheduler.submit_command);
        assert_eq!("sacct", config.scheduler.query_command);
        assert_eq!("scancel", config.scheduler.cancel_command);
        assert_eq!(30, config.scheduler.timeout_secs);
        assert_eq!(40, config.lock.retries);
    }

    #[test]
    fn test_partial_override() {
        let config = Config::parse(
            r#"
            [scheduler]
            query_command = "/opt/slurm/bin/sacct"
            timeout_secs = 5

            [lock]
            retries = 3
            "#,
        )
        .unwrap();
        assert_eq!("/opt/slurm/bin/sacct", config.scheduler.query_command);
        assert_eq!("sbatch", config.scheduler.submit_command);
        assert_eq!(5, config.scheduler.timeout_secs);
        assert_eq!(3, config.lock.retries);
        assert_eq!(25, config.lock.backoff_ms);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::parse("table_file = \"a/b.csv\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::parse("[scheduler]\ntimeout_secs = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(Config::parse("lock = 3"), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert!(Config::load_file(&path).unwrap().is_none());
        fs::write(&path, "table_file = \"tracked.csv\"\n").unwrap();
        let config = Config::load_file(&path).unwrap().unwrap();
        assert_eq!("tracked.csv", config.table_file);

        let rooted = Config::with_data_dir(dir.path());
        assert_eq!(dir.path().join("jobs.csv"), rooted.table_path());
    }
}

use std::{collections::HashMap, io, sync::Mutex};

use crate::process::{CommandOutput, CommandRunner};

pub fn setup() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Answers commands with prepared output and records every invocation.
pub struct CannedRunner {
    fallback: Option<CommandOutput>,
    by_program: HashMap<String, CommandOutput>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

impl CannedRunner {
    /// same output for every program
    pub fn new(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            fallback: Some(output(exit_code, stdout, stderr)),
            by_program: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// fails with `NotFound` for any program without a prepared answer
    pub fn empty() -> Self {
        Self {
            fallback: None,
            by_program: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, program: &str, exit_code: i32, stdout: &str) -> Self {
        self.by_program
            .insert(program.to_string(), output(exit_code, stdout, ""));
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for &CannedRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        self.by_program
            .get(program)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, program.to_string()))
    }
}

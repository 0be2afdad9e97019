use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::WorkerCommand;

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<String>,
    voluntary: bool,
}

impl ExitStatus {
    pub fn new(code: Option<i32>, signal: Option<String>, voluntary: bool) -> Self {
        Self {
            code,
            signal,
            voluntary,
        }
    }

    /// `voluntary` is true when the exit follows a disconnect request from
    /// the supervisor.
    pub fn from_std(status: std::process::ExitStatus, voluntary: bool) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal().map(signal_name)
            },
            #[cfg(not(unix))]
            signal: None,
            voluntary,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn signal(&self) -> Option<&str> {
        self.signal.as_deref()
    }

    pub fn voluntary(&self) -> bool {
        self.voluntary
    }

    /// A nonzero exit code the supervisor did not ask for. Only these exits
    /// are restarted automatically.
    pub fn is_crash(&self) -> bool {
        !self.voluntary && matches!(self.code, Some(code) if code != 0)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.voluntary {
            write!(f, "voluntary exit")?;
            return match (&self.signal, self.code) {
                (Some(signal), _) => write!(f, " by {signal}"),
                (None, Some(code)) => write!(f, " with code {code}"),
                (None, None) => Ok(()),
            };
        }
        match (&self.signal, self.code) {
            (Some(signal), _) => write!(f, "killed by {signal}"),
            (None, Some(0)) => write!(f, "exited cleanly"),
            (None, Some(code)) => write!(f, "exited with code {code}"),
            (None, None) => write!(f, "exited"),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {signal}"))
}

pub struct ProcessBuilder {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<std::path::PathBuf>,
}

impl ProcessBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn from_command(command: &WorkerCommand) -> Self {
        let builder = Self::new(&command.script)
            .args(&command.args)
            .envs(&command.env);
        match &command.cwd {
            Some(cwd) => builder.current_dir(cwd),
            None => builder,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.env
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (k, v) in vars {
            self.env
                .push((k.as_ref().to_string(), v.as_ref().to_string()));
        }
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<std::path::Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Splits the command into program and arguments.
    ///
    /// A script given as `"node server.js"` with no explicit args is split
    /// with shell quoting rules; otherwise the command is the program.
    pub fn program_and_args(&self) -> (String, Vec<String>) {
        let (program, mut parsed_args) = if self.command.contains(' ') && self.args.is_empty() {
            match shell_words::split(&self.command) {
                Ok(parts) => {
                    let mut parts = parts.into_iter();
                    match parts.next() {
                        Some(first) => (first, parts.collect()),
                        None => (self.command.clone(), Vec::new()),
                    }
                }
                Err(_) => (self.command.clone(), Vec::new()),
            }
        } else {
            (self.command.clone(), Vec::new())
        };
        parsed_args.extend(self.args.iter().cloned());
        (program, parsed_args)
    }

    pub fn spawn(self) -> crate::Result<Child> {
        let (program, args) = self.program_and_args();

        tracing::debug!("Spawning worker: program='{}', args={:?}", program, args);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        for (key, value) in self.env {
            cmd.env(key, value);
        }

        cmd.spawn()
            .map_err(|e| crate::Error::SpawnFailed(format!("{}: {}", program, e)))
    }
}

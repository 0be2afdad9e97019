use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

use crate::Error;

/// How a freshly forked worker announces that it is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadyOn {
    /// The worker opened a network listener.
    #[default]
    #[serde(rename = "listening")]
    Listening,
    /// The worker sent `{"cmd": "ready"}` over its channel.
    #[serde(rename = "ready")]
    Ready,
}

impl FromStr for ReadyOn {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "listening" => Ok(Self::Listening),
            "ready" => Ok(Self::Ready),
            other => Err(Error::InvalidArgument(format!(
                "readyOn must either be \"listening\" or \"ready\", got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ReadyOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening => f.write_str("listening"),
            Self::Ready => f.write_str("ready"),
        }
    }
}

/// Order in which a batch of children is spawned or replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// One child at a time; the first failure stops the batch.
    #[default]
    #[serde(rename = "series")]
    Series,
    /// Every child at once; the batch always runs to completion.
    #[serde(rename = "parallel")]
    Parallel,
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "series" => Ok(Self::Series),
            "parallel" => Ok(Self::Parallel),
            other => Err(Error::InvalidArgument(format!(
                "strategy must either be \"series\" or \"parallel\", got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Series => f.write_str("series"),
            Self::Parallel => f.write_str("parallel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub start_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            start_ms: 200,
            max_ms: 120_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.start_ms == 0 {
            return Err(Error::InvalidArgument(
                "backoff.startMs must be greater than 0".to_string(),
            ));
        }
        if self.max_ms == 0 {
            return Err(Error::InvalidArgument(
                "backoff.maxMs must be greater than 0".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::InvalidArgument(format!(
                "backoff.multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// Per-child settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildOptions {
    pub ready_on: ReadyOn,
    /// Deadline for readiness; zero disables it.
    pub timeout: Duration,
    /// Grace period after readiness during which the worker must stay connected.
    pub confirm_delay: Duration,
    /// How long a graceful disconnect may take before the worker is killed.
    pub disconnect_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            ready_on: ReadyOn::Listening,
            timeout: Duration::ZERO,
            confirm_delay: Duration::from_millis(2000),
            disconnect_timeout: Duration::from_millis(2000),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ChildOptions {
    /// Parses the child keys of the configuration surface. Unknown keys are
    /// ignored; wrong types and out-of-range values are rejected.
    pub fn from_value(value: &serde_json::Value) -> crate::Result<Self> {
        let raw = ChildOptionsRaw::deserialize(value).map_err(invalid)?;
        raw.try_into()
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.backoff.validate()
    }
}

/// Options accepted by `Fleet::spawn`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnOptions {
    pub number: usize,
    pub strategy: Strategy,
    pub timeout: Duration,
    pub ready_on: ReadyOn,
    pub confirm_delay: Duration,
    pub disconnect_timeout: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        let child = ChildOptions::default();
        Self {
            number: 1,
            strategy: Strategy::Series,
            timeout: child.timeout,
            ready_on: child.ready_on,
            confirm_delay: child.confirm_delay,
            disconnect_timeout: child.disconnect_timeout,
        }
    }
}

impl SpawnOptions {
    pub fn from_value(value: &serde_json::Value) -> crate::Result<Self> {
        let raw = SpawnOptionsRaw::deserialize(value).map_err(invalid)?;
        raw.try_into()
    }

    pub fn with_number(mut self, number: usize) -> Self {
        self.number = number;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ready_on(mut self, ready_on: ReadyOn) -> Self {
        self.ready_on = ready_on;
        self
    }

    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.number == 0 {
            return Err(Error::InvalidArgument(
                "number must be 1 or greater".to_string(),
            ));
        }
        Ok(())
    }

    pub fn child_options(&self, backoff: &BackoffConfig) -> ChildOptions {
        ChildOptions {
            ready_on: self.ready_on,
            timeout: self.timeout,
            confirm_delay: self.confirm_delay,
            disconnect_timeout: self.disconnect_timeout,
            backoff: backoff.clone(),
        }
    }
}

/// The program a fleet runs: script path plus the invocation around it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub script: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(script: impl Into<String>) -> crate::Result<Self> {
        let script = script.into();
        if script.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "script must be a non-empty path".to_string(),
            ));
        }
        Ok(Self {
            script,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }
}

/// Construction-time settings of a fleet.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub script: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub defaults: SpawnOptions,
    pub backoff: BackoffConfig,
    pub event_capacity: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            script: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            defaults: SpawnOptions::default(),
            backoff: BackoffConfig::default(),
            event_capacity: 1024,
        }
    }
}

/// On-disk fleet description (JSON).
#[derive(Debug, Clone, PartialEq)]
pub struct FleetFile {
    pub script: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub backoff: BackoffConfig,
    pub options: SpawnOptions,
}

impl FleetFile {
    pub fn from_json(content: &str) -> crate::Result<Self> {
        let raw: FleetFileRaw = serde_json::from_str(content).map_err(invalid)?;
        raw.try_into()
    }

    pub async fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&content)
    }

    pub fn into_fleet_config(self) -> FleetConfig {
        FleetConfig {
            script: self.script,
            args: self.args,
            env: self.env,
            cwd: self.cwd,
            defaults: self.options,
            backoff: self.backoff,
            ..FleetConfig::default()
        }
    }
}

/// Polls a fleet file and swaps in the new contents when its checksum changes.
pub struct ConfigWatcher {
    path: PathBuf,
    current: ArcSwap<FleetFile>,
    checksum: Arc<RwLock<Vec<u8>>>,
}

impl ConfigWatcher {
    pub async fn new(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = fs::read(&path).await?;
        let file = Self::parse(&content)?;

        Ok(Self {
            path,
            current: ArcSwap::new(Arc::new(file)),
            checksum: Arc::new(RwLock::new(Self::compute_checksum(&content))),
        })
    }

    fn parse(content: &[u8]) -> crate::Result<FleetFile> {
        let text = std::str::from_utf8(content)
            .map_err(|e| Error::InvalidArgument(format!("config is not UTF-8: {e}")))?;
        FleetFile::from_json(text)
    }

    fn compute_checksum(content: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hasher.finalize().to_vec()
    }

    /// Reloads the file if it changed. Returns `true` when new contents were
    /// stored; an invalid file leaves the previous contents in place.
    pub async fn check_reload(&self) -> crate::Result<bool> {
        let content = fs::read(&self.path).await?;
        let new_checksum = Self::compute_checksum(&content);
        if new_checksum == *self.checksum.read() {
            return Ok(false);
        }

        let file = Self::parse(&content)?;
        self.current.store(Arc::new(file));
        *self.checksum.write() = new_checksum;
        Ok(true)
    }

    pub fn get(&self) -> Arc<FleetFile> {
        self.current.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn invalid(err: serde_json::Error) -> Error {
    Error::InvalidArgument(format!("invalid options: {err}"))
}

fn millis(key: &str, value: Option<f64>, default: Duration) -> crate::Result<Duration> {
    let Some(ms) = value else {
        return Ok(default);
    };
    if !ms.is_finite() || ms < 0.0 {
        return Err(Error::InvalidArgument(format!(
            "{key} must be 0 or greater, got {ms}"
        )));
    }
    if ms.fract() == 0.0 && ms <= u64::MAX as f64 {
        Ok(Duration::from_millis(ms as u64))
    } else {
        Duration::try_from_secs_f64(ms / 1000.0)
            .map_err(|e| Error::InvalidArgument(format!("{key} is out of range: {e}")))
    }
}

// Raw deserialization structs for the configuration surface
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildOptionsRaw {
    timeout: Option<f64>,
    ready_on: Option<String>,
    confirm_delay: Option<f64>,
    disconnect_timeout: Option<f64>,
}

impl TryFrom<ChildOptionsRaw> for ChildOptions {
    type Error = Error;

    fn try_from(raw: ChildOptionsRaw) -> crate::Result<Self> {
        let defaults = ChildOptions::default();
        Ok(ChildOptions {
            ready_on: raw
                .ready_on
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or(defaults.ready_on),
            timeout: millis("timeout", raw.timeout, defaults.timeout)?,
            confirm_delay: millis("confirmDelay", raw.confirm_delay, defaults.confirm_delay)?,
            disconnect_timeout: millis(
                "disconnectTimeout",
                raw.disconnect_timeout,
                defaults.disconnect_timeout,
            )?,
            backoff: defaults.backoff,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SpawnOptionsRaw {
    number: Option<i64>,
    strategy: Option<String>,
    #[serde(flatten)]
    child: ChildOptionsRaw,
}

impl TryFrom<SpawnOptionsRaw> for SpawnOptions {
    type Error = Error;

    fn try_from(raw: SpawnOptionsRaw) -> crate::Result<Self> {
        let number = match raw.number {
            None => 1,
            Some(n) if n >= 1 => usize::try_from(n)
                .map_err(|_| Error::InvalidArgument(format!("number is out of range: {n}")))?,
            Some(n) => {
                return Err(Error::InvalidArgument(format!(
                    "number must be 1 or greater, got {n}"
                )));
            }
        };
        let strategy = raw
            .strategy
            .as_deref()
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();
        let child = ChildOptions::try_from(raw.child)?;

        Ok(SpawnOptions {
            number,
            strategy,
            timeout: child.timeout,
            ready_on: child.ready_on,
            confirm_delay: child.confirm_delay,
            disconnect_timeout: child.disconnect_timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FleetFileRaw {
    script: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    backoff: Option<BackoffConfig>,
    #[serde(flatten)]
    options: SpawnOptionsRaw,
}

impl TryFrom<FleetFileRaw> for FleetFile {
    type Error = Error;

    fn try_from(raw: FleetFileRaw) -> crate::Result<Self> {
        if let Some(script) = &raw.script
            && script.trim().is_empty()
        {
            return Err(Error::InvalidArgument(
                "script must be a non-empty path".to_string(),
            ));
        }
        let backoff = raw.backoff.unwrap_or_default();
        backoff.validate()?;

        Ok(FleetFile {
            script: raw.script,
            args: raw.args,
            env: raw.env,
            cwd: raw.cwd,
            backoff,
            options: raw.options.try_into()?,
        })
    }
}

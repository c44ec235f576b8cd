use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_TAG: &str = "latest";

/// Identifier or name of a container, passed to the engine untouched.
/// Whether it refers to anything is decided by the engine, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerRef(String);

impl ContainerRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContainerRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Image reference split into repository name and tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = anyhow::Error;

    /// Parses `name[:tag]`. A colon that belongs to a registry port
    /// (`registry:5000/app`) is not a tag separator.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("image reference cannot be empty");
        }

        let last_slash = s.rfind('/');
        match s.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                let (name, tag) = (&s[..colon], &s[colon + 1..]);
                if name.is_empty() || tag.is_empty() {
                    anyhow::bail!("invalid image reference: {}", s);
                }
                Ok(Self::new(name, tag))
            }
            _ => Ok(Self::new(s, DEFAULT_TAG)),
        }
    }
}

/// Command to run inside an existing container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
}

impl ExecSpec {
    /// Runs `command` as given, capturing both stdout and stderr
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            capture_stdout: true,
            capture_stderr: true,
        }
    }

    /// Runs `script` through `bash -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["bash".to_string(), "-c".to_string(), script.into()])
    }

    pub fn stdout(mut self, capture: bool) -> Self {
        self.capture_stdout = capture;
        self
    }

    pub fn stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }
}

/// A container that could not be removed after a run.
/// Reported alongside the outcome, never in place of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupWarning {
    pub container_id: String,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to remove container {}: {}",
            self.container_id, self.message
        )
    }
}

/// Outcome of one exec or one-shot container run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub combined_output: Vec<u8>,
    pub completed: bool,
    pub exit_code: Option<i64>,
    pub cleanup_warning: Option<CleanupWarning>,
}

impl ExecResult {
    pub fn completed(combined_output: Vec<u8>, exit_code: Option<i64>) -> Self {
        Self {
            combined_output,
            completed: true,
            exit_code,
            cleanup_warning: None,
        }
    }

    /// Output captured before a failure; never marked completed
    pub fn partial(combined_output: Vec<u8>) -> Self {
        Self {
            combined_output,
            completed: false,
            exit_code: None,
            cleanup_warning: None,
        }
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.combined_output).into_owned()
    }
}

/// Lifecycle of an ephemeral container as the orchestrator drives it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Started,
    Running,
    Exited,
    Removed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Started => "started",
            LifecycleState::Running => "running",
            LifecycleState::Exited => "exited",
            LifecycleState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// How much of an ephemeral container's output to keep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePolicy {
    /// Keep only the first stdout chunk and stop reading
    FirstChunk,
    /// Read until the engine closes the stream
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    #[default]
    IfMissing,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
    pub created: Option<DateTime<Utc>>,
}

impl ContainerSummary {
    /// First name without the engine's leading slash, or the short id
    pub fn display_name(&self) -> &str {
        match self.names.first() {
            Some(name) => name.as_str(),
            None => self.id.get(..12).unwrap_or(&self.id),
        }
    }
}

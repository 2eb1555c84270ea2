// ABOUTME: Causal error type shared by every hostwire component.
// ABOUTME: Carries a typed kind, an optional backtrace and the errors it aggregates.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Leading backtrace lines produced by the error constructors themselves.
const SKIP_FIRST_LINES: usize = 4;

/// Trailing lines dropped from an aggregated cause: they repeat the
/// aggregate's own runtime frames.
const SKIP_LAST_LINES: usize = 4;

/// What went wrong, independent of where the error sits in a causal chain.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("{0}")]
    Message(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("trust material missing: {0}")]
    MissingTrustMaterial(PathBuf),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed for user {user}")]
    AuthenticationFailed { user: String },

    #[error("session error: {0}")]
    Session(String),

    #[error("command [{command}] failed (exit status {}): {stderr}", display_status(.exit_status))]
    CommandFailed {
        command: String,
        exit_status: Option<u32>,
        stderr: String,
    },

    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("channel closed unexpectedly without exit status")]
    ChannelClosed,

    #[error("scp protocol error: {0}")]
    Protocol(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("concurrent task panicked: {0}")]
    TaskPanicked(String),

    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),
}

fn display_status(status: &Option<u32>) -> String {
    status.map_or_else(|| "none".to_string(), |s| s.to_string())
}

/// A failure, possibly caused by other failures.
///
/// Leaf errors carry a [`ErrorKind`]. Aggregates built with
/// [`Error::caused_by`] may carry no kind at all and exist only to hold
/// their causes, in the order the causes occurred.
#[derive(Debug)]
pub struct Error {
    kind: Option<ErrorKind>,
    causes: Vec<Error>,
    stack: Option<String>,
    skip_first: usize,
    skip_last: usize,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Some(kind),
            causes: Vec::new(),
            stack: capture_stack(),
            skip_first: SKIP_FIRST_LINES,
            skip_last: 0,
        }
    }

    /// Plain message error.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Message(message.into()))
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Io {
            context: context.into(),
            source,
        })
    }

    /// Aggregate with no message of its own.
    pub fn caused_by(causes: Vec<Error>) -> Self {
        let stack = capture_stack();
        let causes = causes
            .into_iter()
            .map(|mut cause| {
                if stack.is_some() {
                    cause.skip_last = SKIP_LAST_LINES;
                }
                cause
            })
            .collect();
        Self {
            kind: None,
            causes,
            stack,
            skip_first: SKIP_FIRST_LINES,
            skip_last: 0,
        }
    }

    /// Wrap `cause` under a new message.
    pub fn with_context(message: impl Into<String>, cause: Error) -> Self {
        let mut err = Self::msg(message);
        err.causes.push(cause);
        err
    }

    /// Merge the outcome of a primary operation with the outcome of releasing
    /// the resource it used. Neither failure is discarded: when both fail the
    /// result names the primary failure first, then the release failure.
    pub fn combine<T>(primary: Result<T>, release: Result<()>) -> Result<T> {
        match (primary, release) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release)) => Err(release),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(release)) => {
                let mut err = Self::msg("releasing a resource failed after an earlier failure");
                err.causes = vec![primary, release];
                Err(err)
            }
        }
    }

    /// Override how many leading stack lines are hidden when rendering.
    pub fn skip_first(mut self, lines: usize) -> Self {
        self.skip_first = lines;
        self
    }

    pub fn kind(&self) -> Option<&ErrorKind> {
        self.kind.as_ref()
    }

    pub fn causes(&self) -> &[Error] {
        &self.causes
    }

    pub fn message(&self) -> Option<String> {
        self.kind.as_ref().map(ToString::to_string)
    }

    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Visit this error and every transitive cause, depth first.
    pub fn walk(&self) -> impl Iterator<Item = &Error> {
        let mut pending = vec![self];
        std::iter::from_fn(move || {
            let next = pending.pop()?;
            pending.extend(next.causes.iter().rev());
            Some(next)
        })
    }

    fn trimmed_stack(&self) -> Option<String> {
        let stack = self.stack.as_deref()?;
        Some(trim_lines(stack, self.skip_first, self.skip_last))
    }
}

fn capture_stack() -> Option<String> {
    let backtrace = Backtrace::capture();
    (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string())
}

fn trim_lines(text: &str, skip_first: usize, skip_last: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if skip_first >= lines.len() {
        return String::new();
    }
    let remaining = lines.len() - skip_first;
    if skip_last >= remaining {
        return String::new();
    }
    lines[skip_first..lines.len() - skip_last].join("\n")
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kind) = &self.kind {
            writeln!(f, "message={kind}")?;
        }
        if let Some(stack) = self.trimmed_stack() {
            writeln!(f, "stack=[")?;
            writeln!(f, "{stack}")?;
            writeln!(f, "]")?;
        }
        if !self.causes.is_empty() {
            writeln!(f, "CAUSED BY")?;
        }
        for cause in &self.causes {
            writeln!(f, "{cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.as_ref().and_then(std::error::Error::source)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::new(ErrorKind::Yaml(err))
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::new(ErrorKind::Ssh(err))
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Self::new(ErrorKind::Key(err))
    }
}

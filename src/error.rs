//! Build failure taxonomy.
//!
//! Every failure aborts the build on the spot. The variant tells the caller
//! which of the three user-facing failure classes it belongs to; anything
//! else (store I/O, serialization) is `Internal`.

use std::fmt;

use crate::recipe::RecipeError;

/// Coarse failure class reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Base image or package source unreachable.
    Fetch,
    /// Named package missing, version conflict, or malformed manifest.
    PackageResolution,
    /// A directive's command exited non-zero.
    StepExecution,
    /// The recipe itself could not be parsed.
    Recipe,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Fetch => write!(f, "FetchFailure"),
            FailureKind::PackageResolution => write!(f, "PackageResolutionFailure"),
            FailureKind::StepExecution => write!(f, "StepExecutionFailure"),
            FailureKind::Recipe => write!(f, "RecipeFailure"),
            FailureKind::Internal => write!(f, "InternalFailure"),
        }
    }
}

/// How a failed step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// The command ran and exited non-zero.
    Exited(i32),
    /// The command was killed by a signal.
    Signaled,
    /// The runner could not start the command.
    NotStarted,
    /// The step failed before any command ran.
    Rejected,
}

impl StepStatus {
    /// Status of a command that ran; `None` means killed by a signal.
    pub fn from_exit(code: Option<i32>) -> Self {
        code.map_or(StepStatus::Signaled, StepStatus::Exited)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Exited(code) => write!(f, "failed with exit status {code}"),
            StepStatus::Signaled => write!(f, "was killed by a signal"),
            StepStatus::NotStarted => write!(f, "could not start its command"),
            StepStatus::Rejected => write!(f, "failed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("step {step} `{directive}`: cannot fetch '{reference}': {reason}")]
    Fetch {
        step: usize,
        directive: String,
        reference: String,
        reason: String,
    },
    #[error("step {step} `{directive}`: package resolution failed: {reason}")]
    PackageResolution {
        step: usize,
        directive: String,
        packages: Vec<String>,
        reason: String,
    },
    #[error("step {step} `{directive}` {status}: {output}")]
    StepExecution {
        step: usize,
        directive: String,
        status: StepStatus,
        output: String,
    },
    #[error("invalid recipe: {0}")]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BuildError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BuildError::Fetch { .. } => FailureKind::Fetch,
            BuildError::PackageResolution { .. } => FailureKind::PackageResolution,
            BuildError::StepExecution { .. } => FailureKind::StepExecution,
            BuildError::Recipe(_) => FailureKind::Recipe,
            BuildError::Internal(_) => FailureKind::Internal,
        }
    }

    /// 1-based index of the failing directive, when the failure belongs to one.
    pub fn step(&self) -> Option<usize> {
        match self {
            BuildError::Fetch { step, .. }
            | BuildError::PackageResolution { step, .. }
            | BuildError::StepExecution { step, .. } => Some(*step),
            BuildError::Recipe(_) | BuildError::Internal(_) => None,
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            FailureKind::Fetch => 2,
            FailureKind::PackageResolution => 3,
            FailureKind::StepExecution => 4,
            FailureKind::Recipe | FailureKind::Internal => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let fetch = BuildError::Fetch {
            step: 1,
            directive: "FROM python:3.11-slim".into(),
            reference: "python:3.11-slim".into(),
            reason: "not found".into(),
        };
        let pkg = BuildError::PackageResolution {
            step: 3,
            directive: "INSTALL os nope".into(),
            packages: vec!["nope".into()],
            reason: "unknown package".into(),
        };
        let step = BuildError::StepExecution {
            step: 4,
            directive: "RUN false".into(),
            status: StepStatus::Exited(1),
            output: String::new(),
        };

        assert_eq!(fetch.exit_code(), 2);
        assert_eq!(pkg.exit_code(), 3);
        assert_eq!(step.exit_code(), 4);
        assert_eq!(step.step(), Some(4));
        assert_eq!(pkg.kind().to_string(), "PackageResolutionFailure");
    }

    #[test]
    fn step_failure_message_names_status() {
        let err = BuildError::StepExecution {
            step: 2,
            directive: "RUN exit 7".into(),
            status: StepStatus::Exited(7),
            output: "boom".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("step 2"));
        assert!(msg.contains("exit status 7"));

        let signalled = BuildError::StepExecution {
            step: 2,
            directive: "RUN sleep 100".into(),
            status: StepStatus::from_exit(None),
            output: String::new(),
        };
        assert!(signalled.to_string().contains("killed by a signal"));

        let not_started = BuildError::StepExecution {
            step: 3,
            directive: "RUN [\"missing-tool\"]".into(),
            status: StepStatus::NotStarted,
            output: "starting 'missing-tool': No such file or directory".into(),
        };
        let msg = not_started.to_string();
        assert!(msg.contains("could not start its command"), "{msg}");
        assert!(!msg.contains("signal"), "{msg}");
    }
}

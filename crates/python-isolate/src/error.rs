use std::path::PathBuf;
use std::sync::Arc;

/// An environment could not be materialized.
///
/// ProvisionError is Clone because a single failed build is delivered to every
/// caller which was waiting on it.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ProvisionError {
    #[error(
        "environment kind '{kind}' is not supported: only local execution \
         (local, venv, conda) is available"
    )]
    NotSupported { kind: String },
    #[error("{program} exited with {status}: {stderr}")]
    Engine {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("failed to {operation} at {path}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("environment build was aborted: {0}")]
    Aborted(String),
}

impl ProvisionError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source: Arc::new(err),
        }
    }
}

/// The channel between this process and an environment's interpreter failed.
/// These are never faults of the user's function itself.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("failed to stage exchange data at {path}")]
    Exchange {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode call payload")]
    Encode(#[source] serde_json::Error),
    #[error("failed to start worker using interpreter {interpreter}")]
    Spawn {
        interpreter: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker exited unexpectedly ({status}); last stderr output:\n{stderr_tail}")]
    Crashed { status: String, stderr_tail: String },
    #[error("worker protocol violation: {0}")]
    Protocol(String),
    #[error("return value could not be serialized: {0}")]
    Unserializable(String),
    #[error("keyword argument '{0}' is reserved for relation access")]
    ReservedKeyword(String),
    #[error("worker I/O error")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the worker (and thus possibly its environment) must be
    /// considered corrupted and never reused.
    pub fn poisons_environment(&self) -> bool {
        match self {
            TransportError::Crashed { .. }
            | TransportError::Protocol(_)
            | TransportError::Spawn { .. }
            | TransportError::Io(_) => true,
            TransportError::Exchange { .. }
            | TransportError::Encode(_)
            | TransportError::Unserializable(_)
            | TransportError::ReservedKeyword(_) => false,
        }
    }
}

/// A project's environments file is missing or malformed.
#[derive(thiserror::Error, Debug)]
pub enum ProjectError {
    #[error("{0} must exist to define environments")]
    Missing(PathBuf),
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    #[error("key '{key}' of environment '{name}' must be {expected}")]
    InvalidValue {
        name: String,
        key: String,
        expected: &'static str,
    },
    #[error("environment name conflicts with a reserved name: {0}")]
    ReservedName(String),
    #[error("environment names must be unique, but '{0}' is defined twice")]
    DuplicateName(String),
    #[error("invalid environment type for '{name}'")]
    InvalidKind {
        name: String,
        #[source]
        source: crate::spec::KindParseError,
    },
    #[error("environment '{name}' was used but not defined in {path}")]
    Undefined { name: String, path: PathBuf },
}

/// Render an error and its chain of sources as a single line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();

    while let Some(next) = source {
        out.push_str(": ");
        out.push_str(&next.to_string());
        source = next.source();
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_chain_includes_sources() {
        let err = ProvisionError::io(
            "create environment directory",
            "/envs/venv/abc",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied"),
        );
        insta::assert_snapshot!(
            error_chain(&err),
            @"failed to create environment directory at /envs/venv/abc: permission denied"
        );
    }

    #[test]
    fn test_poisoning_classification() {
        assert!(TransportError::Protocol("bad".to_string()).poisons_environment());
        assert!(TransportError::Crashed {
            status: "exit status: 3".to_string(),
            stderr_tail: String::new(),
        }
        .poisons_environment());
        assert!(!TransportError::Unserializable("set".to_string()).poisons_environment());
        assert!(!TransportError::ReservedKeyword("read_df".to_string()).poisons_environment());
    }
}

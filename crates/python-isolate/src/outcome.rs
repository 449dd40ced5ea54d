use crate::error::{error_chain, ProvisionError, TransportError};
use crate::value::{Table, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Result of one model run. Exactly one of a value or a classified failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionOutcome {
    Success {
        value: Value,
        /// Relations written by the model through `write_df`, by lowercase name.
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        written: BTreeMap<String, Table>,
    },
    Failure(Failure),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn into_result(self) -> Result<Value, Failure> {
        match self {
            ExecutionOutcome::Success { value, .. } => Ok(value),
            ExecutionOutcome::Failure(failure) => Err(failure),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum FailureKind {
    /// The environment could not be materialized.
    Provision,
    /// The environment's kind can never be provisioned here.
    NotSupported,
    /// The channel to the environment's interpreter failed.
    Transport,
    /// The function raised within its environment.
    RemoteExecution { exception: String },
    /// The run exceeded its time limit.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_traceback: Option<String>,
}

impl Failure {
    pub fn provision(err: &ProvisionError) -> Self {
        let kind = match err {
            ProvisionError::NotSupported { .. } => FailureKind::NotSupported,
            _ => FailureKind::Provision,
        };
        Self {
            kind,
            message: error_chain(err),
            remote_traceback: None,
        }
    }

    pub fn transport(err: &TransportError) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: error_chain(err),
            remote_traceback: None,
        }
    }

    pub fn remote_execution(
        exception: String,
        message: String,
        remote_traceback: Option<String>,
    ) -> Self {
        Self {
            kind: FailureKind::RemoteExecution { exception },
            message,
            remote_traceback,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!(
                "execution did not complete within {}",
                humantime::format_duration(after)
            ),
            remote_traceback: None,
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::RemoteExecution { exception } => {
                write!(f, "{exception}: {}", self.message)
            }
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Failure {}

//! Execution of Python model functions within isolated interpreter environments.
//!
//! An [`Executor`] takes an [`ExecutionRequest`] naming a function and the
//! [`EnvironmentSpec`] it requires. The spec's environment is materialized
//! once per content hash by the [`EnvironmentCache`], the function runs in a
//! pooled worker of that environment's interpreter, and its result or
//! failure comes back as an [`ExecutionOutcome`].

pub mod cache;
pub mod error;
pub mod executor;
pub mod outcome;
pub mod process;
pub mod project;
pub mod provision;
pub mod request;
pub mod spec;
pub mod transport;
pub mod value;

pub use cache::{Backing, EnvironmentCache, EnvironmentHandle, HandleStatus};
pub use error::{ProjectError, ProvisionError, TransportError};
pub use executor::{Executor, ExecutorConfig};
pub use outcome::{ExecutionOutcome, Failure, FailureKind};
pub use provision::{LocalProvisioner, PackagingEngine, Provisioner};
pub use request::{ExecutionRequest, PyFunction};
pub use spec::{EnvironmentKind, EnvironmentSpec};
pub use transport::{SubprocessTransport, Transport};
pub use value::{Column, ColumnData, Dtype, Series, Table, Value};

use crate::spec::EnvironmentSpec;
use crate::value::{Table, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// A Python function carried as module source plus the name of the callable
/// to invoke. The source runs as a fresh module on every call, so its
/// module-level globals are the function's captured state.
#[derive(Debug, Clone, PartialEq)]
pub struct PyFunction {
    pub source: String,
    pub entrypoint: String,
    /// Filename reported in tracebacks.
    pub filename: String,
}

impl PyFunction {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entrypoint: "main".to_string(),
            filename: "<model>".to_string(),
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = entrypoint.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }
}

/// One model run: what to execute, where, and with which inputs.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub spec: EnvironmentSpec,
    pub function: PyFunction,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    /// Relations the model reads by lowercase name. When Some, the entrypoint
    /// is called with `read_df` and `write_df` keyword arguments.
    pub relations: Option<BTreeMap<String, Table>>,
    /// Overrides the executor's configured timeout.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(spec: EnvironmentSpec, function: PyFunction) -> Self {
        Self {
            spec,
            function,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            relations: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Pass `read_df` and `write_df` to the entrypoint, even if it reads no relations.
    pub fn with_relation_io(mut self) -> Self {
        self.relations.get_or_insert_with(BTreeMap::new);
        self
    }

    /// Make `table` readable as `read_df(name)`. Names are case-insensitive.
    pub fn relation(mut self, name: &str, table: Table) -> Self {
        self.relations
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_lowercase(), table);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

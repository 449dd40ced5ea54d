use crate::cache::EnvironmentHandle;
use crate::error::TransportError;
use crate::outcome::{ExecutionOutcome, Failure};
use crate::request::PyFunction;
use crate::value::{Table, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub mod exchange;
mod worker;

pub use exchange::{ExchangeDir, ExchangeFormat, JsonExchange};
use worker::{CallRequest, CallResult, Returned, Worker};

/// Keyword arguments through which a model reads and writes relations.
pub const RELATION_KWARGS: [&str; 2] = ["read_df", "write_df"];

/// Transport moves a function and its arguments into an environment's
/// interpreter, runs it there, and moves its result back.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Invoke `function` within the environment of `handle`.
    ///
    /// If `relations` is Some, the function is also passed `read_df` and
    /// `write_df`, and relations it writes are returned with its value.
    ///
    /// Exceptions raised by the function itself are an Ok outcome of
    /// `Failure::remote_execution`. Err is reserved for failures of the
    /// transport, which never reflect on the function.
    async fn invoke(
        &self,
        handle: &EnvironmentHandle,
        function: &PyFunction,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        relations: Option<&BTreeMap<String, Table>>,
    ) -> Result<ExecutionOutcome, TransportError>;

    /// Discard all idle workers of the environment having `spec_hash`.
    fn reset(&self, spec_hash: &str);

    /// Discard all idle workers of every environment.
    fn reset_all(&self);
}

/// Transport which runs functions in pooled worker subprocesses.
pub struct SubprocessTransport {
    scratch: tempfile::TempDir,
    runner: PathBuf,
    format: Arc<dyn ExchangeFormat>,
    workers_per_environment: usize,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
}

struct Pool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Worker>>,
}

impl SubprocessTransport {
    pub fn new(workers_per_environment: usize) -> Result<Self, TransportError> {
        Self::with_format(workers_per_environment, Arc::new(JsonExchange))
    }

    pub fn with_format(
        workers_per_environment: usize,
        format: Arc<dyn ExchangeFormat>,
    ) -> Result<Self, TransportError> {
        let scratch = tempfile::Builder::new()
            .prefix("python-isolate-")
            .tempdir()?;
        let runner = worker::install_runner(scratch.path())?;

        Ok(Self {
            scratch,
            runner,
            format,
            workers_per_environment: workers_per_environment.max(1),
            pools: Default::default(),
        })
    }

    fn pool(&self, spec_hash: &str) -> Arc<Pool> {
        self.pools
            .lock()
            .unwrap()
            .entry(spec_hash.to_string())
            .or_insert_with(|| {
                Arc::new(Pool {
                    permits: Arc::new(Semaphore::new(self.workers_per_environment)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Check out an idle worker, or start a new one.
    /// Blocks while the environment's pool is at capacity.
    async fn checkout(&self, handle: &EnvironmentHandle) -> Result<Lease, TransportError> {
        let pool = self.pool(handle.spec_hash());
        let permit = pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Protocol("worker pool is closed".to_string()))?;

        loop {
            let idle = pool.idle.lock().unwrap().pop();
            let Some(worker) = idle else {
                break;
            };
            if worker.is_alive() {
                return Ok(Lease::new(pool, permit, worker));
            }
            tracing::debug!(spec_hash = handle.spec_hash(), "discarding dead idle worker");
        }

        let worker = Worker::spawn(handle.interpreter(), &self.runner).await?;
        Ok(Lease::new(pool, permit, worker))
    }
}

#[async_trait::async_trait]
impl Transport for SubprocessTransport {
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(spec_hash = handle.spec_hash(), entrypoint = %function.entrypoint),
    )]
    async fn invoke(
        &self,
        handle: &EnvironmentHandle,
        function: &PyFunction,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        relations: Option<&BTreeMap<String, Table>>,
    ) -> Result<ExecutionOutcome, TransportError> {
        // Stage every input before a worker is involved.
        let mut exchange = ExchangeDir::new(self.scratch.path(), self.format.clone())?;
        let args = args
            .iter()
            .map(|arg| exchange.encode(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let mut wire_kwargs = serde_json::Map::new();
        for (key, arg) in kwargs {
            wire_kwargs.insert(key.clone(), exchange.encode(arg)?);
        }
        let relations = match relations {
            None => None,
            Some(relations) => {
                if let Some(reserved) = RELATION_KWARGS.iter().find(|k| kwargs.contains_key(**k)) {
                    return Err(TransportError::ReservedKeyword(reserved.to_string()));
                }
                let mut wire = serde_json::Map::new();
                for (name, table) in relations {
                    wire.insert(name.to_lowercase(), exchange.encode_table(table)?);
                }
                Some(wire)
            }
        };

        let mut lease = self.checkout(handle).await?;

        let result = lease
            .worker()
            .call(CallRequest {
                id: 0,
                source: &function.source,
                entrypoint: &function.entrypoint,
                filename: &function.filename,
                args,
                kwargs: wire_kwargs,
                exchange_dir: exchange.path(),
                format: exchange.format().name(),
                relations,
            })
            .await;

        let outcome = match result {
            Ok(CallResult::Ok(returned)) => decode_returned(&exchange, returned),
            Ok(CallResult::Raised(raised)) => Ok(ExecutionOutcome::Failure(
                Failure::remote_execution(raised.exception, raised.message, raised.traceback),
            )),
            Ok(CallResult::Unserializable(message)) => Err(TransportError::Unserializable(message)),
            Ok(CallResult::Invalid(message)) => Err(TransportError::Protocol(format!(
                "worker rejected request: {message}"
            ))),
            Err(err) => Err(err),
        };

        // Workers are reused only if the exchange left them in a known state.
        match &outcome {
            Err(err) if err.poisons_environment() => lease.discard(),
            _ => lease.release(),
        }
        outcome
    }

    fn reset(&self, spec_hash: &str) {
        let pool = self.pools.lock().unwrap().remove(spec_hash);

        if let Some(pool) = pool {
            let idle = std::mem::take(&mut *pool.idle.lock().unwrap());
            tracing::debug!(%spec_hash, workers = idle.len(), "reset worker pool");
        }
    }

    fn reset_all(&self) {
        let pools = std::mem::take(&mut *self.pools.lock().unwrap());

        for (_, pool) in pools {
            pool.idle.lock().unwrap().clear();
        }
    }
}

fn decode_returned(
    exchange: &ExchangeDir,
    Returned { value, written }: Returned,
) -> Result<ExecutionOutcome, TransportError> {
    let value = exchange.decode(value)?;

    let mut tables = BTreeMap::new();
    for (name, wire) in written {
        let Value::Table(table) = exchange.decode(wire)? else {
            return Err(TransportError::Protocol(format!(
                "written relation '{name}' is not a table"
            )));
        };
        tables.insert(name, table);
    }
    Ok(ExecutionOutcome::Success {
        value,
        written: tables,
    })
}

/// Exclusive use of a worker. Unless released back to its pool, a leased
/// worker is terminated when the Lease is dropped. This is what happens when
/// an invocation is cancelled or times out mid-call.
struct Lease {
    pool: Arc<Pool>,
    worker: Option<Worker>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    fn new(pool: Arc<Pool>, permit: OwnedSemaphorePermit, worker: Worker) -> Self {
        Self {
            pool,
            worker: Some(worker),
            _permit: permit,
        }
    }

    fn worker(&mut self) -> &mut Worker {
        self.worker.as_mut().expect("worker is present until the lease ends")
    }

    fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.idle.lock().unwrap().push(worker);
        }
    }

    fn discard(mut self) {
        self.worker.take();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.worker.is_some() {
            tracing::debug!("terminating worker of an abandoned call");
        }
    }
}

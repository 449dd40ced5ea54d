use crate::cache::EnvironmentCache;
use crate::error::TransportError;
use crate::outcome::{ExecutionOutcome, Failure};
use crate::provision::{CondaEngine, LocalProvisioner, Provisioner, UvEngine};
use crate::request::ExecutionRequest;
use crate::transport::{SubprocessTransport, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(clap::Args, Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory under which venv and conda environments are built and kept.
    #[clap(long = "env-root", env = "ISOLATE_ENV_ROOT", default_value_os_t = default_env_root())]
    pub env_root: PathBuf,
    /// Ambient interpreter of the local environment.
    #[clap(long = "python", env = "ISOLATE_PYTHON", default_value = "python3")]
    pub python: PathBuf,
    /// Time limit of a single function execution, once its environment is ready.
    #[clap(long = "timeout", env = "ISOLATE_TIMEOUT", default_value = "30m")]
    #[arg(value_parser = humantime::parse_duration)]
    pub timeout: Duration,
    /// Maximum number of concurrent workers of each environment.
    #[clap(
        long = "workers-per-environment",
        env = "ISOLATE_WORKERS_PER_ENVIRONMENT",
        default_value = "4"
    )]
    pub workers_per_environment: usize,
    /// Program used to create venv environments.
    #[clap(long = "uv", env = "ISOLATE_UV", default_value = "uv")]
    pub uv: PathBuf,
    /// Program used to create conda environments.
    #[clap(long = "conda", env = "ISOLATE_CONDA", default_value = "conda")]
    pub conda: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            env_root: default_env_root(),
            python: PathBuf::from("python3"),
            timeout: Duration::from_secs(30 * 60),
            workers_per_environment: 4,
            uv: PathBuf::from("uv"),
            conda: PathBuf::from("conda"),
        }
    }
}

/// `<user cache dir>/python-isolate/envs`, or a relative `.python-isolate/envs`
/// where the platform has no cache directory.
pub fn default_env_root() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("python-isolate"))
        .unwrap_or_else(|| PathBuf::from(".python-isolate"))
        .join("envs")
}

/// Executor runs Python functions within the environments they declare.
pub struct Executor {
    config: ExecutorConfig,
    cache: EnvironmentCache,
    transport: Arc<dyn Transport>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Result<Self, TransportError> {
        let provisioner = LocalProvisioner::new(&config.env_root, &config.python)
            .with_venv_engine(Arc::new(UvEngine::new(&config.uv)))
            .with_conda_engine(Arc::new(CondaEngine::new(&config.conda)));
        let transport = SubprocessTransport::new(config.workers_per_environment)?;

        Ok(Self::with_parts(
            config,
            Arc::new(provisioner),
            Arc::new(transport),
        ))
    }

    pub fn with_parts(
        config: ExecutorConfig,
        provisioner: Arc<dyn Provisioner>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            cache: EnvironmentCache::new(provisioner),
            transport,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn cache(&self) -> &EnvironmentCache {
        &self.cache
    }

    /// Run `request` to an outcome. Every failure, whether of provisioning,
    /// transport, the function itself, or its time limit, is an outcome.
    #[tracing::instrument(
        skip_all,
        fields(
            spec_hash = %request.spec.content_hash(),
            kind = %request.spec.kind(),
            entrypoint = %request.function.entrypoint,
        ),
    )]
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let ExecutionRequest {
            spec,
            function,
            args,
            kwargs,
            relations,
            timeout,
        } = request;

        if let Err(err) = spec.validate() {
            return ExecutionOutcome::Failure(Failure::provision(&err));
        }
        let handle = match self.cache.get_or_create(&spec).await {
            Ok(handle) => handle,
            Err(err) => return ExecutionOutcome::Failure(Failure::provision(&err)),
        };

        let timeout = timeout.unwrap_or(self.config.timeout);
        let started = std::time::Instant::now();

        // On timeout, the dropped invocation terminates its in-flight worker.
        let invoked = tokio::time::timeout(
            timeout,
            self.transport
                .invoke(&handle, &function, &args, &kwargs, relations.as_ref()),
        )
        .await;

        let outcome = match invoked {
            Err(_elapsed) => {
                tracing::warn!(?timeout, "execution timed out");
                ExecutionOutcome::Failure(Failure::timeout(timeout))
            }
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                if err.poisons_environment() {
                    tracing::warn!(
                        error = %crate::error::error_chain(&err),
                        "transport failed; evicting environment and its workers"
                    );
                    self.cache.evict_hash(handle.spec_hash());
                    self.transport.reset(handle.spec_hash());
                }
                ExecutionOutcome::Failure(Failure::transport(&err))
            }
        };

        tracing::debug!(
            success = outcome.is_success(),
            elapsed = ?started.elapsed(),
            "execution finished"
        );
        outcome
    }

    /// Forget all environments and stop all idle workers.
    pub fn shutdown(&self) {
        self.cache.clear();
        self.transport.reset_all();
    }
}

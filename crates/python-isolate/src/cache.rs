use crate::error::ProvisionError;
use crate::provision::Provisioner;
use crate::spec::{EnvironmentKind, EnvironmentSpec};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A materialized environment, ready to run functions.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentHandle {
    spec_hash: String,
    kind: EnvironmentKind,
    created_at: time::OffsetDateTime,
    backing: Backing,
}

/// Where an environment lives on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Backing {
    /// Root directory of the environment's artifacts.
    /// None for the ambient interpreter, which has no artifacts of its own.
    pub root: Option<PathBuf>,
    /// Interpreter from which workers are started.
    pub interpreter: PathBuf,
}

impl EnvironmentHandle {
    pub fn new(spec: &EnvironmentSpec, backing: Backing) -> Self {
        Self {
            spec_hash: spec.content_hash().to_string(),
            kind: spec.kind().clone(),
            created_at: time::OffsetDateTime::now_utc(),
            backing,
        }
    }

    pub fn spec_hash(&self) -> &str {
        &self.spec_hash
    }
    pub fn kind(&self) -> &EnvironmentKind {
        &self.kind
    }
    pub fn created_at(&self) -> time::OffsetDateTime {
        self.created_at
    }
    pub fn backing(&self) -> &Backing {
        &self.backing
    }
    pub fn interpreter(&self) -> &Path {
        &self.backing.interpreter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Building,
    Ready,
    Failed,
}

type BuildResult = Result<Arc<EnvironmentHandle>, ProvisionError>;
type SharedBuild = Shared<BoxFuture<'static, BuildResult>>;

enum Entry {
    Building { build: SharedBuild, generation: u64 },
    Ready(Arc<EnvironmentHandle>),
    // Failures are retained for `status()` only and are never served.
    Failed { error: ProvisionError },
}

/// EnvironmentCache maps environment specs to materialized environments,
/// keyed by content hash.
///
/// At most one build per key is in flight. Builds run as spawned tasks and
/// are shared by every caller waiting on them, so a caller which gives up
/// (including the caller which started the build) never cancels it, and
/// a finished build always settles its entry.
pub struct EnvironmentCache {
    provisioner: Arc<dyn Provisioner>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    generation: AtomicU64,
}

impl EnvironmentCache {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            entries: Default::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Return the environment of `spec`, building it if it's not yet cached.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(spec_hash = %spec.content_hash(), kind = %spec.kind()),
    )]
    pub async fn get_or_create(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<Arc<EnvironmentHandle>, ProvisionError> {
        spec.validate()?;

        let build = {
            let mut entries = self.entries.lock().unwrap();

            match entries.get(spec.content_hash()) {
                Some(Entry::Ready(handle)) => {
                    tracing::debug!("environment cache hit");
                    return Ok(handle.clone());
                }
                Some(Entry::Building { build, .. }) => {
                    tracing::debug!("awaiting in-flight environment build");
                    build.clone()
                }
                Some(Entry::Failed { .. }) | None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let build = self.start_build(spec.clone(), generation);

                    entries.insert(
                        spec.content_hash().to_string(),
                        Entry::Building {
                            build: build.clone(),
                            generation,
                        },
                    );
                    build
                }
            }
        };

        build.await
    }

    fn start_build(&self, spec: EnvironmentSpec, generation: u64) -> SharedBuild {
        let provisioner = self.provisioner.clone();
        let entries = self.entries.clone();

        let task = tokio::spawn(async move {
            let started = std::time::Instant::now();
            tracing::info!(spec_hash = %spec.content_hash(), kind = %spec.kind(), "building environment");

            let result: BuildResult =
                match std::panic::AssertUnwindSafe(provisioner.build(&spec))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(handle)) => Ok(Arc::new(handle)),
                    Ok(Err(error)) => Err(error),
                    Err(panic) => Err(ProvisionError::Aborted(panic_message(&*panic))),
                };

            match &result {
                Ok(handle) => tracing::info!(
                    spec_hash = %spec.content_hash(),
                    interpreter = %handle.interpreter().display(),
                    elapsed = ?started.elapsed(),
                    "environment is ready"
                ),
                Err(error) => tracing::warn!(
                    spec_hash = %spec.content_hash(),
                    error = %crate::error::error_chain(error),
                    "environment build failed"
                ),
            }

            // Settle the entry only if it's still the one this build was
            // started for. It may since have been evicted or replaced.
            let mut entries = entries.lock().unwrap();
            if let Some(Entry::Building { generation: g, .. }) = entries.get(spec.content_hash()) {
                if *g == generation {
                    let settled = match &result {
                        Ok(handle) => Entry::Ready(handle.clone()),
                        Err(error) => Entry::Failed {
                            error: error.clone(),
                        },
                    };
                    entries.insert(spec.content_hash().to_string(), settled);
                }
            }
            result
        });

        task.map(|joined| match joined {
            Ok(result) => result,
            Err(err) => Err(ProvisionError::Aborted(err.to_string())),
        })
        .boxed()
        .shared()
    }

    /// Current status of the environment of `spec`, if it's known.
    pub fn status(&self, spec: &EnvironmentSpec) -> Option<HandleStatus> {
        self.entries
            .lock()
            .unwrap()
            .get(spec.content_hash())
            .map(|entry| match entry {
                Entry::Building { .. } => HandleStatus::Building,
                Entry::Ready(_) => HandleStatus::Ready,
                Entry::Failed { .. } => HandleStatus::Failed,
            })
    }

    /// Error of the last failed build of `spec`, if its entry is Failed.
    pub fn last_error(&self, spec: &EnvironmentSpec) -> Option<ProvisionError> {
        match self.entries.lock().unwrap().get(spec.content_hash()) {
            Some(Entry::Failed { error }) => Some(error.clone()),
            _ => None,
        }
    }

    /// Forget the environment of `spec`, so that the next request rebuilds it.
    /// Returns true if an entry was removed. Callers already awaiting an
    /// in-flight build still receive its result.
    pub fn evict(&self, spec: &EnvironmentSpec) -> bool {
        self.evict_hash(spec.content_hash())
    }

    pub(crate) fn evict_hash(&self, spec_hash: &str) -> bool {
        let removed = self.entries.lock().unwrap().remove(spec_hash).is_some();
        if removed {
            tracing::debug!(%spec_hash, "evicted environment");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Number of entries, in any status.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("build panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("build panicked: {s}")
    } else {
        "build panicked".to_string()
    }
}

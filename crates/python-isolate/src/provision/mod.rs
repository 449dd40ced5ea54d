use crate::cache::{Backing, EnvironmentHandle};
use crate::error::ProvisionError;
use crate::process::Command;
use crate::spec::{EnvironmentKind, EnvironmentSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod engine;

pub use engine::{interpreter_path, CondaEngine, EngineRequest, PackagingEngine, UvEngine};

/// Name of the file which marks a completely built environment.
pub const MARKER_FILE: &str = "isolate-spec.json";

/// Provisioner materializes the environment of a spec.
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    async fn build(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, ProvisionError>;
}

/// Provisioner of environments on the local host.
///
/// Environments live at `<root>/<kind>/<hash>/`. An environment's marker file
/// is written only after its engine succeeds, and a directory with a matching
/// marker is reused as-is, including by later processes. A directory without
/// one is the remnant of an interrupted build, and is rebuilt.
pub struct LocalProvisioner {
    root: PathBuf,
    python: PathBuf,
    venv: Arc<dyn PackagingEngine>,
    conda: Arc<dyn PackagingEngine>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Marker {
    spec_hash: String,
    kind: String,
    requirements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    python_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extra: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    created_at: time::OffsetDateTime,
}

impl LocalProvisioner {
    /// Provisioner rooted at `root`, using `python` as the ambient interpreter
    /// and default `uv` and `conda` engines.
    pub fn new(root: impl Into<PathBuf>, python: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            python: python.into(),
            venv: Arc::new(UvEngine::default()),
            conda: Arc::new(CondaEngine::default()),
        }
    }

    pub fn with_venv_engine(mut self, engine: Arc<dyn PackagingEngine>) -> Self {
        self.venv = engine;
        self
    }

    pub fn with_conda_engine(mut self, engine: Arc<dyn PackagingEngine>) -> Self {
        self.conda = engine;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory which holds (or will hold) the environment of `spec`.
    pub fn environment_dir(&self, spec: &EnvironmentSpec) -> PathBuf {
        self.root
            .join(spec.kind().as_str())
            .join(spec.content_hash())
    }

    async fn resolve_ambient(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, ProvisionError> {
        if !spec.requirements().is_empty() {
            tracing::warn!(
                requirements = ?spec.requirements(),
                "the local environment runs the ambient interpreter as-is; its requirements are not installed"
            );
        }

        let output = engine::run(
            Command::new(&self.python).args(["-c", "import sys; print(sys.executable)"]),
        )
        .await?;

        let interpreter = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let interpreter = if interpreter.is_empty() {
            self.python.clone()
        } else {
            PathBuf::from(interpreter)
        };

        Ok(EnvironmentHandle::new(
            spec,
            Backing {
                root: None,
                interpreter,
            },
        ))
    }

    async fn materialize(
        &self,
        spec: &EnvironmentSpec,
        engine: &dyn PackagingEngine,
    ) -> Result<EnvironmentHandle, ProvisionError> {
        let dir = self.environment_dir(spec);
        let interpreter = interpreter_path(&dir);

        if let Some(marker) = read_marker(&dir).await {
            if marker.spec_hash == spec.content_hash() && interpreter.exists() {
                tracing::debug!(dir = %dir.display(), "reusing existing environment");
                return Ok(EnvironmentHandle::new(
                    spec,
                    Backing {
                        root: Some(dir),
                        interpreter,
                    },
                ));
            }
        }

        // Anything here now is left over from a build which didn't finish.
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::info!(dir = %dir.display(), "removed incomplete environment"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(ProvisionError::io("remove incomplete environment", &dir, err)),
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| ProvisionError::io("create environment root", parent, err))?;
        }

        let request = EngineRequest {
            python_version: spec.python_version().map(str::to_string),
            requirements: spec.requirements().to_vec(),
            extra: spec.extra().clone(),
        };
        tracing::info!(dir = %dir.display(), engine = engine.name(), "creating environment");

        let result = match engine.create(&request, &dir).await {
            Ok(()) if !interpreter.exists() => Err(ProvisionError::Engine {
                program: engine.name().to_string(),
                status: "success".to_string(),
                stderr: format!("no interpreter was created at {}", interpreter.display()),
            }),
            Ok(()) => write_marker(&dir, spec).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            if let Err(error) = tokio::fs::remove_dir_all(&dir).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), %error, "failed to remove failed environment");
                }
            }
            return Err(err);
        }

        Ok(EnvironmentHandle::new(
            spec,
            Backing {
                root: Some(dir),
                interpreter,
            },
        ))
    }
}

#[async_trait::async_trait]
impl Provisioner for LocalProvisioner {
    async fn build(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, ProvisionError> {
        match spec.kind() {
            EnvironmentKind::Remote { name } => Err(ProvisionError::NotSupported { kind: name.clone() }),
            EnvironmentKind::Local => self.resolve_ambient(spec).await,
            EnvironmentKind::Venv => self.materialize(spec, self.venv.as_ref()).await,
            EnvironmentKind::Conda => self.materialize(spec, self.conda.as_ref()).await,
        }
    }
}

async fn read_marker(dir: &Path) -> Option<Marker> {
    let content = tokio::fs::read(dir.join(MARKER_FILE)).await.ok()?;

    match serde_json::from_slice(&content) {
        Ok(marker) => Some(marker),
        Err(error) => {
            tracing::warn!(dir = %dir.display(), %error, "ignoring malformed environment marker");
            None
        }
    }
}

async fn write_marker(dir: &Path, spec: &EnvironmentSpec) -> Result<(), ProvisionError> {
    let marker = Marker {
        spec_hash: spec.content_hash().to_string(),
        kind: spec.kind().to_string(),
        requirements: spec.requirements().to_vec(),
        python_version: spec.python_version().map(str::to_string),
        extra: spec.extra().clone(),
        created_at: time::OffsetDateTime::now_utc(),
    };
    let content = serde_json::to_vec_pretty(&marker).map_err(|err| {
        ProvisionError::io("encode environment marker", dir, std::io::Error::from(err))
    })?;

    // Write-then-rename, so a present marker is always a complete one.
    let path = dir.join(MARKER_FILE);
    let partial = dir.join(format!("{MARKER_FILE}.partial"));

    tokio::fs::write(&partial, content)
        .await
        .map_err(|err| ProvisionError::io("write environment marker", &partial, err))?;
    tokio::fs::rename(&partial, &path)
        .await
        .map_err(|err| ProvisionError::io("commit environment marker", &path, err))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine which fakes an environment by writing an interpreter file.
    #[derive(Default)]
    struct FakeEngine {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl PackagingEngine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }

        async fn create(&self, request: &EngineRequest, target: &Path) -> Result<(), ProvisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let interpreter = interpreter_path(target);
            std::fs::create_dir_all(interpreter.parent().unwrap()).unwrap();
            std::fs::write(&interpreter, request.requirements.join("\n")).unwrap();

            if self.fail {
                return Err(ProvisionError::Engine {
                    program: "fake".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "no matching distribution".to_string(),
                });
            }
            Ok(())
        }
    }

    fn venv_spec() -> EnvironmentSpec {
        EnvironmentSpec::new(EnvironmentKind::Venv, ["pandas==2.0"])
    }

    #[tokio::test]
    async fn test_marker_allows_reuse_across_provisioners() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());

        let provisioner =
            LocalProvisioner::new(root.path(), "python3").with_venv_engine(engine.clone());
        let first = provisioner.build(&venv_spec()).await.unwrap();

        let dir = root.path().join("venv").join(venv_spec().content_hash());
        assert_eq!(first.backing().root.as_deref(), Some(dir.as_path()));
        assert_eq!(first.interpreter(), interpreter_path(&dir));

        let marker: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join(MARKER_FILE)).unwrap()).unwrap();
        assert_eq!(marker["specHash"], venv_spec().content_hash());
        assert_eq!(marker["requirements"], serde_json::json!(["pandas==2.0"]));

        // A fresh provisioner (as after a restart) reuses the environment.
        let provisioner =
            LocalProvisioner::new(root.path(), "python3").with_venv_engine(engine.clone());
        let second = provisioner.build(&venv_spec()).await.unwrap();

        assert_eq!(second.interpreter(), first.interpreter());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_incomplete_environment_is_rebuilt() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let provisioner =
            LocalProvisioner::new(root.path(), "python3").with_venv_engine(engine.clone());

        // An interrupted build: an interpreter but no marker.
        let dir = provisioner.environment_dir(&venv_spec());
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        std::fs::write(dir.join("stray"), "").unwrap();

        provisioner.build(&venv_spec()).await.unwrap();

        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert!(!dir.join("stray").exists());
        assert!(dir.join(MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn test_failed_build_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            fail: true,
            ..Default::default()
        });
        let provisioner = LocalProvisioner::new(root.path(), "python3").with_venv_engine(engine);

        let err = provisioner.build(&venv_spec()).await.unwrap_err();
        insta::assert_snapshot!(err, @"fake exited with exit status: 1: no matching distribution");

        assert!(!provisioner.environment_dir(&venv_spec()).exists());
    }

    #[tokio::test]
    async fn test_remote_kinds_touch_nothing() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let provisioner = LocalProvisioner::new(root.path().join("envs"), "python3")
            .with_venv_engine(engine.clone())
            .with_conda_engine(engine.clone());

        let spec = EnvironmentSpec::new(
            EnvironmentKind::Remote {
                name: "fal".to_string(),
            },
            ["pandas"],
        );
        let err = provisioner.build(&spec).await.unwrap_err();

        assert!(matches!(err, ProvisionError::NotSupported { .. }));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert!(!root.path().join("envs").exists());
    }
}

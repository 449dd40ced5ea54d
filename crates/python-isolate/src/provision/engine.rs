use crate::error::ProvisionError;
use crate::process::{self, Command};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What a packaging engine must materialize: an interpreter of
/// `python_version` (or the engine's default) with `requirements` installed.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub python_version: Option<String>,
    pub requirements: Vec<String>,
    /// Engine-specific options, such as `index_url` or `channels`.
    pub extra: BTreeMap<String, String>,
}

/// PackagingEngine creates an interpreter environment at a target directory.
/// It's told nothing of caching: the target never exists beforehand, and is
/// removed by the caller if creation fails.
#[async_trait::async_trait]
pub trait PackagingEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn create(&self, request: &EngineRequest, target: &Path) -> Result<(), ProvisionError>;
}

/// Path of the interpreter within a venv or conda prefix.
pub fn interpreter_path(prefix: &Path) -> PathBuf {
    if cfg!(windows) {
        prefix.join("Scripts").join("python.exe")
    } else {
        prefix.join("bin").join("python")
    }
}

/// Creates virtualenvs using `uv`.
pub struct UvEngine {
    program: PathBuf,
}

impl UvEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn commands(&self, request: &EngineRequest, target: &Path) -> Vec<Command> {
        let mut venv = Command::new(&self.program);
        venv.arg("venv").arg("--no-config");
        if let Some(version) = &request.python_version {
            venv.arg("--python").arg(version);
        }
        venv.arg(target);

        let mut commands = vec![venv];

        if !request.requirements.is_empty() {
            let mut install = Command::new(&self.program);
            install
                .args(["pip", "install", "--no-config", "--python"])
                .arg(interpreter_path(target));
            if let Some(index_url) = request.extra.get("index_url") {
                install.arg("--index-url").arg(index_url);
            }
            install.args(&request.requirements);
            commands.push(install);
        }
        commands
    }
}

impl Default for UvEngine {
    fn default() -> Self {
        Self::new("uv")
    }
}

#[async_trait::async_trait]
impl PackagingEngine for UvEngine {
    fn name(&self) -> &str {
        "uv"
    }

    async fn create(&self, request: &EngineRequest, target: &Path) -> Result<(), ProvisionError> {
        for mut cmd in self.commands(request, target) {
            run(&mut cmd).await?;
        }
        Ok(())
    }
}

/// Creates conda prefixes using `conda`, then installs requirements with pip.
pub struct CondaEngine {
    program: PathBuf,
}

impl CondaEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn commands(&self, request: &EngineRequest, target: &Path) -> Vec<Command> {
        let mut create = Command::new(&self.program);
        create
            .args(["create", "--yes", "--quiet", "--prefix"])
            .arg(target);
        if let Some(channels) = request.extra.get("channels") {
            for channel in channels.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                create.arg("--channel").arg(channel);
            }
        }
        match &request.python_version {
            Some(version) => create.arg(format!("python={version}")),
            None => create.arg("python"),
        };
        create.arg("pip");

        let mut commands = vec![create];

        if !request.requirements.is_empty() {
            let mut install = Command::new(interpreter_path(target));
            install.args(["-m", "pip", "install", "--disable-pip-version-check"]);
            if let Some(index_url) = request.extra.get("index_url") {
                install.arg("--index-url").arg(index_url);
            }
            install.args(&request.requirements);
            commands.push(install);
        }
        commands
    }
}

impl Default for CondaEngine {
    fn default() -> Self {
        Self::new("conda")
    }
}

#[async_trait::async_trait]
impl PackagingEngine for CondaEngine {
    fn name(&self) -> &str {
        "conda"
    }

    async fn create(&self, request: &EngineRequest, target: &Path) -> Result<(), ProvisionError> {
        for mut cmd in self.commands(request, target) {
            run(&mut cmd).await?;
        }
        Ok(())
    }
}

/// Run `cmd` to completion, mapping a non-zero exit into an Engine error
/// which carries the tail of its stderr.
pub(crate) async fn run(cmd: &mut Command) -> Result<process::Output, ProvisionError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    tracing::debug!(?cmd, "running packaging command");

    let output = process::output(cmd)
        .await
        .map_err(|err| ProvisionError::io("run packaging command", &program, err))?;

    if !output.status.success() {
        return Err(ProvisionError::Engine {
            program,
            status: output.status.to_string(),
            stderr: stderr_tail(&output.stderr),
        });
    }
    Ok(output)
}

fn stderr_tail(stderr: &[u8]) -> String {
    const MAX_LINES: usize = 20;

    let stderr = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    lines[lines.len().saturating_sub(MAX_LINES)..].join("\n")
}

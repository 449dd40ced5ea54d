//! Child processes which integrate with tokio without its `process` feature.
//!
//! Waiting happens on a blocking thread through a [`SharedChild`], which lets
//! a child be signaled or killed while another task is waiting on it.
//! Dropping a [`Child`] that is still running terminates it: first with
//! SIGTERM, then with SIGKILL if it hasn't exited within a grace period.

pub use std::process::{Command, ExitStatus, Output, Stdio};
use shared_child::SharedChild;
#[cfg(unix)]
use std::os::fd::OwnedFd as OwnedImpl;
#[cfg(windows)]
use std::os::windows::io::OwnedHandle as OwnedImpl;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Time allowed for a dropped child to exit after SIGTERM.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

pub struct Child {
    inner: Arc<SharedChild>,

    pub stdin: Option<ChildStdio>,
    pub stdout: Option<ChildStdio>,
    pub stderr: Option<ChildStdio>,
}

pub type ChildStdio = tokio::fs::File;

impl Child {
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Self> {
        let mut inner = cmd.spawn()?;

        let stdin = map_stdio(inner.stdin.take());
        let stdout = map_stdio(inner.stdout.take());
        let stderr = map_stdio(inner.stderr.take());

        Ok(Self {
            inner: Arc::new(SharedChild::new(inner)?),
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    /// Wait for the child to exit. The returned future doesn't borrow `self`.
    pub fn wait(&self) -> impl std::future::Future<Output = std::io::Result<ExitStatus>> {
        let inner = self.inner.clone();
        let handle = tokio::task::spawn_blocking(move || inner.wait());

        async move {
            match handle.await {
                Ok(result) => result,
                Err(join) => Err(std::io::Error::new(std::io::ErrorKind::Other, join)),
            }
        }
    }

    pub fn try_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        self.inner.try_wait()
    }

    /// Forcibly kill the child. Returns Ok if it has already exited.
    pub fn kill(&self) -> std::io::Result<()> {
        self.inner.kill()
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Ok(Some(_status)) = self.inner.try_wait() {
            return; // Already exited.
        }
        let pid = self.inner.id();

        #[cfg(unix)]
        {
            use shared_child::unix::SharedChildExt;

            // Note that send_signal() returns Ok() if the child has been waited on.
            if let Err(error) = self.inner.send_signal(libc::SIGTERM) {
                tracing::error!(%pid, ?error, "failed to deliver SIGTERM to child process");
            }
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Outside of a runtime we can't linger to reap the child.
            _ = self.inner.kill();
            return;
        };
        let inner = self.inner.clone();
        let wait = self.wait();

        runtime.spawn(async move {
            tokio::select! {
                status = wait => match status {
                    Err(error) => {
                        tracing::error!(%pid, ?error, "failed to wait for dropped child process");
                    }
                    Ok(status) => {
                        tracing::debug!(%pid, %status, "dropped child process exited");
                    }
                },
                _ = tokio::time::sleep(TERMINATE_GRACE) => {
                    tracing::warn!(%pid, "dropped child process did not exit after SIGTERM; killing");
                    if let Err(error) = inner.kill() {
                        tracing::error!(%pid, ?error, "failed to kill dropped child process");
                    }
                }
            }
        });
    }
}

/// Spawn the command and wait for it to exit, buffering its stdout and stderr.
pub async fn output(cmd: &mut Command) -> std::io::Result<Output> {
    cmd.stdin(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.stdout(Stdio::piped());

    let mut child = Child::spawn(cmd)?;

    let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
    let (mut stdout_pipe, mut stderr_pipe) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => unreachable!("stdout and stderr are piped"),
    };

    let (out, err, wait) = tokio::join!(
        stdout_pipe.read_to_end(&mut stdout),
        stderr_pipe.read_to_end(&mut stderr),
        child.wait(),
    );
    let status = wait?;
    out?;
    err?;

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

fn map_stdio<F>(f: Option<F>) -> Option<ChildStdio>
where
    F: Into<OwnedImpl>,
{
    let f: Option<OwnedImpl> = f.map(Into::into);
    let f: Option<std::fs::File> = f.map(Into::into);
    f.map(Into::into)
}

#[cfg(all(test, unix))]
mod test {
    use super::{output, Child, Command};

    #[tokio::test]
    async fn test_wait_and_kill() {
        let child = Child::spawn(&mut Command::new("true")).unwrap();
        assert!(child.wait().await.unwrap().success());

        let child = Child::spawn(Command::new("sleep").arg("21600")).unwrap();
        let wait = child.wait();
        child.kill().unwrap();
        assert_eq!(wait.await.unwrap().to_string(), "signal: 9 (SIGKILL)");
    }

    #[tokio::test]
    async fn test_drop_terminates() {
        let child = Child::spawn(Command::new("sleep").arg("21600")).unwrap();
        let wait = child.wait();

        std::mem::drop(child);
        assert_eq!(wait.await.unwrap().to_string(), "signal: 15 (SIGTERM)");
    }

    #[tokio::test]
    async fn test_output() {
        let out = output(Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();

        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.stderr, b"err\n");
    }
}

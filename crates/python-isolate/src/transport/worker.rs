use crate::error::TransportError;
use crate::process::{Child, ChildStdio, Command, Stdio};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Number of trailing stderr lines retained for crash reports.
const STDERR_TAIL_LINES: usize = 40;
/// Time allowed for a crashed worker to finish exiting and flushing stderr.
const CRASH_SETTLE: Duration = Duration::from_secs(2);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest<'a> {
    pub id: u64,
    pub source: &'a str,
    pub entrypoint: &'a str,
    pub filename: &'a str,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub exchange_dir: &'a Path,
    pub format: &'a str,
    /// `$table` references of relations readable through `read_df`.
    /// When present, the entrypoint is also passed `read_df` and `write_df`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relations: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Deserialize, Debug)]
struct CallResponse {
    id: u64,
    result: CallResult,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum CallResult {
    /// The entrypoint returned.
    Ok(Returned),
    /// The user's code raised an exception.
    Raised(RemoteException),
    /// The entrypoint returned, but its value can't be encoded.
    Unserializable(String),
    /// The request itself couldn't be decoded by the runner.
    Invalid(String),
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct Returned {
    /// Wire-encoded return value.
    pub value: serde_json::Value,
    /// `$table` references of relations written through `write_df`.
    #[serde(default)]
    pub written: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteException {
    pub exception: String,
    pub message: String,
    pub traceback: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Ready {
    ready: ReadyInfo,
}

#[derive(Deserialize, Debug)]
struct ReadyInfo {
    python: String,
    pandas: Option<String>,
}

/// A long-lived interpreter process running the call loop of the runner script.
pub struct Worker {
    child: Child,
    stdin: ChildStdio,
    stdout: BufReader<ChildStdio>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: tokio::task::JoinHandle<()>,
    next_id: u64,
}

impl Worker {
    /// Start a worker and wait for its ready handshake.
    #[tracing::instrument(level = "debug", skip(runner))]
    pub async fn spawn(interpreter: &Path, runner: &Path) -> Result<Self, TransportError> {
        let mut cmd = Command::new(interpreter);
        cmd.arg("-u")
            .arg(runner)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = Child::spawn(&mut cmd).map_err(|source| TransportError::Spawn {
            interpreter: interpreter.to_path_buf(),
            source,
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            unreachable!("worker stdio is piped");
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_task = tokio::spawn(forward_stderr(
            child.id(),
            stderr,
            Arc::clone(&stderr_tail),
        ));

        let mut worker = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr_tail,
            stderr_task,
            next_id: 0,
        };

        let line = worker.read_line().await?;
        let Ready { ready } = serde_json::from_str(&line).map_err(|err| {
            TransportError::Protocol(format!("expected ready handshake, got {line:?}: {err}"))
        })?;

        tracing::debug!(
            pid = worker.child.id(),
            python = %ready.python,
            pandas = ?ready.pandas,
            "worker is ready"
        );

        Ok(worker)
    }

    /// Whether the worker process is still running.
    pub fn is_alive(&self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Send one request and await its response.
    ///
    /// If this future is dropped mid-call the worker's state is unknown,
    /// and the worker must be discarded rather than reused.
    pub async fn call(&mut self, mut request: CallRequest<'_>) -> Result<CallResult, TransportError> {
        self.next_id += 1;
        request.id = self.next_id;

        let mut line = serde_json::to_vec(&request).map_err(TransportError::Encode)?;
        line.push(b'\n');

        if let Err(error) = self.write_request(&line).await {
            tracing::debug!(%error, "failed to write worker request");
            return Err(self.crashed().await);
        }

        let line = self.read_line().await?;
        let CallResponse { id, result } = serde_json::from_str(&line)
            .map_err(|err| TransportError::Protocol(format!("invalid response {line:?}: {err}")))?;

        if id != self.next_id {
            return Err(TransportError::Protocol(format!(
                "response id {id} does not match request id {}",
                self.next_id
            )));
        }
        Ok(result)
    }

    async fn write_request(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(line).await?;
        self.stdin.flush().await
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();

        match self.stdout.read_line(&mut line).await {
            Ok(0) => Err(self.crashed().await),
            Ok(_) => Ok(line),
            Err(error) => {
                tracing::debug!(%error, "failed to read worker response");
                Err(self.crashed().await)
            }
        }
    }

    /// Build a crash report after the worker closed its pipes.
    async fn crashed(&mut self) -> TransportError {
        let status = match tokio::time::timeout(CRASH_SETTLE, self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(error)) => format!("unknown status ({error})"),
            Err(_) => {
                // Pipes are closed but the process lingers. It's useless to us.
                _ = self.child.kill();
                "still running; killed".to_string()
            }
        };
        // Let the forwarder drain whatever stderr remains.
        if !self.stderr_task.is_finished() {
            _ = tokio::time::timeout(CRASH_SETTLE, &mut self.stderr_task).await;
        }

        let stderr_tail = self
            .stderr_tail
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        tracing::warn!(pid = self.child.id(), %status, "worker exited unexpectedly");
        TransportError::Crashed {
            status,
            stderr_tail,
        }
    }
}

/// Forward worker stderr lines to tracing, retaining a tail for crash reports.
async fn forward_stderr(pid: u32, stderr: ChildStdio, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut stderr = BufReader::new(stderr);
    let mut line = String::new();

    loop {
        line.clear();

        match stderr.read_line(&mut line).await {
            Err(error) => {
                tracing::error!(%pid, %error, "failed to read from worker stderr");
                break;
            }
            Ok(0) => break, // Clean EOF.
            Ok(_) => (),
        }
        let line = line.trim_end();
        tracing::debug!(%pid, "{line}");

        let mut tail = tail.lock().unwrap();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
}

/// The runner script executed by every worker.
pub const RUNNER_PY: &str = include_str!("runner.py");

/// Write the runner script into `dir`, returning its path.
pub fn install_runner(dir: &Path) -> std::io::Result<PathBuf> {
    let path = dir.join("python_isolate_runner.py");
    std::fs::write(&path, RUNNER_PY)?;
    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_call_result_parsing() {
        let parsed: CallResponse = serde_json::from_str(
            r#"{"id": 3, "result": {"raised": {"exception": "ValueError", "message": "boom", "traceback": "Traceback..."}}}"#,
        )
        .unwrap();
        assert_eq!(parsed.id, 3);
        assert_eq!(
            parsed.result,
            CallResult::Raised(RemoteException {
                exception: "ValueError".to_string(),
                message: "boom".to_string(),
                traceback: Some("Traceback...".to_string()),
            })
        );

        let parsed: CallResponse = serde_json::from_str(
            r#"{"id": 1, "result": {"ok": {"value": null, "written": {"orders": {"$table": "/x/out-1.json"}}}}}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.result,
            CallResult::Ok(Returned {
                value: serde_json::Value::Null,
                written: BTreeMap::from([(
                    "orders".to_string(),
                    serde_json::json!({"$table": "/x/out-1.json"})
                )]),
            })
        );
    }

    #[test]
    fn test_request_shape() {
        let request = CallRequest {
            id: 7,
            source: "def main():\n    return 1\n",
            entrypoint: "main",
            filename: "model.py",
            args: vec![serde_json::json!(1)],
            kwargs: serde_json::Map::new(),
            exchange_dir: Path::new("/tmp/exchange-x"),
            format: "json",
            relations: None,
        };
        insta::assert_json_snapshot!(request, @r###"
        {
          "id": 7,
          "source": "def main():\n    return 1\n",
          "entrypoint": "main",
          "filename": "model.py",
          "args": [
            1
          ],
          "kwargs": {},
          "exchangeDir": "/tmp/exchange-x",
          "format": "json"
        }
        "###);

        let mut relations = serde_json::Map::new();
        relations.insert(
            "orders".to_string(),
            serde_json::json!({"$table": "/tmp/exchange-x/in-1.json"}),
        );
        let request = CallRequest {
            relations: Some(relations),
            args: Vec::new(),
            ..request
        };
        insta::assert_json_snapshot!(request, @r###"
        {
          "id": 7,
          "source": "def main():\n    return 1\n",
          "entrypoint": "main",
          "filename": "model.py",
          "args": [],
          "kwargs": {},
          "exchangeDir": "/tmp/exchange-x",
          "format": "json",
          "relations": {
            "orders": {
              "$table": "/tmp/exchange-x/in-1.json"
            }
          }
        }
        "###);
    }
}

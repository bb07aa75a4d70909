//! Fabric capability: each stage runs a Fabric pattern as a subprocess.
//!
//! `invoke` collects the whole stdout; `invoke_streaming` runs with
//! `--stream` and yields stdout line by line.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::{Capability, CapabilityError, Fragment, FragmentStream, StageInput};

/// A pipeline stage backed by one Fabric pattern
pub struct FabricCapability {
    /// Stage name shown to observers
    name: String,

    /// Pattern passed to `fabric -p`
    pattern: String,

    /// Path to the fabric binary
    binary_path: String,

    /// Upper bound on one invocation
    step_timeout: Duration,

    /// Whether to use `--stream`
    streaming: bool,
}

impl FabricCapability {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            binary_path: "fabric".to_string(),
            step_timeout: Duration::from_secs(300),
            streaming: true,
        }
    }

    pub fn with_binary_path(mut self, binary_path: impl Into<String>) -> Self {
        self.binary_path = binary_path.into();
        self
    }

    pub fn with_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Spawn fabric and feed the input on stdin, giving up at `deadline`
    async fn spawn(
        &self,
        input: &StageInput,
        stream: bool,
        deadline: Instant,
    ) -> Result<Child, CapabilityError> {
        let mut command = Command::new(&self.binary_path);
        command.args(["-p", &self.pattern]);
        if stream {
            command.arg("--stream");
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CapabilityError::failed(
                    &self.name,
                    format!("failed to spawn fabric for pattern '{}': {}", self.pattern, e),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            timeout_at(deadline, stdin.write_all(input.to_text().as_bytes()))
                .await
                .map_err(|_| self.timeout_error())??;
            // Drop stdin to signal EOF
        }

        Ok(child)
    }

    fn timeout_error(&self) -> CapabilityError {
        CapabilityError::Timeout {
            capability: self.name.clone(),
            seconds: self.step_timeout.as_secs(),
        }
    }
}

#[async_trait]
impl Capability for FabricCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &StageInput) -> Result<String, CapabilityError> {
        let deadline = Instant::now() + self.step_timeout;
        let child = self.spawn(input, false, deadline).await?;

        let output = timeout_at(deadline, child.wait_with_output())
            .await
            .map_err(|_| self.timeout_error())??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(CapabilityError::failed(
                &self.name,
                format!(
                    "pattern '{}' exited with code {}: {}",
                    self.pattern,
                    exit_code,
                    stderr.trim()
                ),
            ));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| CapabilityError::failed(&self.name, "fabric output is not valid UTF-8"))
    }

    async fn invoke_streaming(
        &self,
        input: &StageInput,
    ) -> Result<Option<FragmentStream>, CapabilityError> {
        if !self.streaming {
            return Ok(None);
        }

        let deadline = Instant::now() + self.step_timeout;
        let mut child = self.spawn(input, true, deadline).await?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapabilityError::failed(&self.name, "fabric stdout unavailable"))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let name = self.name.clone();
        let pattern = self.pattern.clone();
        let timeout_error = self.timeout_error();

        let stream = async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match timeout_at(deadline, lines.next_line()).await {
                    Err(_) => {
                        yield Err(timeout_error);
                        return;
                    }
                    Ok(Err(e)) => {
                        yield Err(CapabilityError::Io(e));
                        return;
                    }
                    Ok(Ok(Some(line))) => yield Ok(Fragment::Delta(format!("{}\n", line))),
                    Ok(Ok(None)) => break,
                }
            }

            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    yield Err(CapabilityError::Io(e));
                    return;
                }
            };
            if !status.success() {
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => String::new(),
                };
                yield Err(CapabilityError::failed(
                    &name,
                    format!(
                        "pattern '{}' exited with code {}: {}",
                        pattern,
                        status.code().unwrap_or(-1),
                        stderr.trim()
                    ),
                ));
                return;
            }
            debug!(stage = %name, "fabric stream finished");
        };

        Ok(Some(Box::pin(stream)))
    }
}

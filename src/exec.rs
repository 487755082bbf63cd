use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::Api, client::Client, core::subresource::AttachParams};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    time::Duration,
};

use crate::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn new(stdout: String, stderr: String) -> Self {
        Self { stdout, stderr }
    }
}

/// Runs a command inside a container of a running pod.
///
/// A command that exits non-zero, a broken stream, or a timeout all come back
/// as a single `Err`. Callers treat the call as at-least-once: it may have
/// had effects even when an error is returned.
#[async_trait]
pub trait PodExec: Send + Sync {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        stdin: Option<&[u8]>,
        command: &[String],
    ) -> Result<ExecOutput, Error>;
}

/// `PodExec` over the Kubernetes pod exec subresource
pub struct KubePodExec {
    client: Client,
    timeout: Duration,
}

impl KubePodExec {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn attach_and_wait(
        &self,
        pods_api: &Api<Pod>,
        pod: &str,
        container: &str,
        stdin: Option<&[u8]>,
        command: &[String],
    ) -> Result<ExecOutput, Error> {
        let attach_params = AttachParams {
            container: Some(container.to_string()),
            tty: false,
            stdin: stdin.is_some(),
            stdout: true,
            stderr: true,
            max_stdin_buf_size: Some(10240),
            max_stdout_buf_size: Some(10240),
            max_stderr_buf_size: Some(10240),
        };

        let mut attached_process = pods_api.exec(pod, command, &attach_params).await?;

        if let Some(input) = stdin {
            match attached_process.stdin() {
                None => {
                    return Err(Error::KubeExecError(format!(
                        "No stdin stream to pod: {pod}"
                    )))
                }
                Some(mut writer) => {
                    writer
                        .write_all(input)
                        .await
                        .map_err(|e| Error::KubeExecError(format!("writing stdin: {e}")))?;
                    writer
                        .shutdown()
                        .await
                        .map_err(|e| Error::KubeExecError(format!("closing stdin: {e}")))?;
                }
            }
        }

        let (result_stdout, result_stderr) =
            read_output(pod, attached_process.stdout(), attached_process.stderr()).await?;

        let status = match attached_process.take_status() {
            None => None,
            Some(status) => status.await,
        };
        let status = status.ok_or_else(|| {
            Error::KubeExecError(format!(
                "Error executing command: {:?} on pod: {:?}. Failed to find command status.",
                command, pod
            ))
        })?;

        // https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
        match status.status.as_deref() {
            Some("Success") => Ok(ExecOutput::new(result_stdout, result_stderr)),
            Some("Failure") => {
                if let Some(reason) = &status.reason {
                    warn!(
                        "Reason for failed kube exec: {reason}, code {:?}",
                        status.code
                    );
                }
                debug!("Failed command: {:?}", command);
                Err(Error::KubeExecError(format!(
                    "command failed on pod {pod}: {}",
                    status
                        .message
                        .clone()
                        .unwrap_or_else(|| result_stderr.trim().to_string())
                )))
            }
            // Status is only ever Success or Failure per the Kube API conventions
            _ => {
                error!(
                    "Undefined response from kube API when exec to pod: {:?}",
                    pod
                );
                Err(Error::KubeExecError(format!(
                    "Error executing command: {:?} on pod: {:?}.",
                    command, pod
                )))
            }
        }
    }
}

/// Drain stdout and stderr together so neither side can stall the other,
/// decoding both lossily.
async fn read_output<O, E>(
    pod: &str,
    stdout: Option<O>,
    stderr: Option<E>,
) -> Result<(String, String), Error>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let (stdout, stderr) = tokio::join!(drain(pod, "stdout", stdout), drain(pod, "stderr", stderr));
    Ok((stdout?, stderr?))
}

async fn drain<R: AsyncRead + Unpin>(
    pod: &str,
    stream: &str,
    reader: Option<R>,
) -> Result<String, Error> {
    let Some(mut reader) = reader else {
        warn!("No {} from exec to pod: {:?}", stream, pod);
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| Error::KubeExecError(format!("reading {stream}: {e}")))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[async_trait]
impl PodExec for KubePodExec {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        stdin: Option<&[u8]>,
        command: &[String],
    ) -> Result<ExecOutput, Error> {
        let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        tokio::time::timeout(
            self.timeout,
            self.attach_and_wait(&pods_api, pod, container, stdin, command),
        )
        .await
        .map_err(|_| {
            Error::KubeExecError(format!(
                "exec into {namespace}/{pod} timed out after {:?}",
                self.timeout
            ))
        })?
    }
}

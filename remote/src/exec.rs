use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::{ClusterHandle, ExecTarget, Executor};
use common::Error;

/// Default size of the buffer between local stdin and the websocket writer.
pub const DEFAULT_STDIN_BUFFER: usize = 64 * 1024;

/// [`Executor`] running commands through the pod `exec` sub-resource.
///
/// stdin, stdout and stderr are multiplexed over one upgraded connection; no
/// pseudo-terminal is allocated.
#[derive(Debug, Clone)]
pub struct KubeExecutor {
    handle: ClusterHandle,
    stdin_buffer: usize,
}

impl KubeExecutor {
    #[must_use]
    pub fn new(handle: ClusterHandle) -> Self {
        Self {
            handle,
            stdin_buffer: DEFAULT_STDIN_BUFFER,
        }
    }

    #[must_use]
    pub fn with_stdin_buffer(mut self, stdin_buffer: usize) -> Self {
        self.stdin_buffer = stdin_buffer.max(1);
        self
    }

    fn attach_params(&self, target: &ExecTarget) -> AttachParams {
        let params = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .tty(false)
            .max_stdin_buf_size(self.stdin_buffer);
        match &target.container {
            Some(container) => params.container(container.clone()),
            None => params,
        }
    }
}

/// Maps the status object the API server sends when a command ends.
///
/// Only `Success` is success. A `NonZeroExitCode` failure carries the exit code
/// as the `ExitCode` cause; other failures (e.g. the binary is missing inside
/// the container) have no exit code.
pub fn check_status(status: &Status) -> Result<(), Error> {
    if status.status.as_deref() == Some("Success") {
        return Ok(());
    }
    let message = status
        .message
        .clone()
        .unwrap_or_else(|| "remote command failed without a message".to_string());
    let code = if status.reason.as_deref() == Some("NonZeroExitCode") {
        status
            .details
            .as_ref()
            .and_then(|details| details.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|cause| cause.message.as_deref())
            .and_then(|code| code.trim().parse::<i32>().ok())
    } else {
        None
    };
    Err(Error::RemoteNonZeroExit { code, message })
}

async fn relay<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;
    Ok(copied)
}

impl Executor for KubeExecutor {
    #[instrument(skip(self, stdin, stdout, stderr))]
    async fn exec<I, O, E>(
        &self,
        target: &ExecTarget,
        command: &[String],
        stdin: I,
        stdout: O,
        stderr: E,
    ) -> Result<(), Error>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let namespace = target
            .namespace
            .as_deref()
            .unwrap_or(&self.handle.default_namespace);
        let pods: Api<Pod> = Api::namespaced(self.handle.client.clone(), namespace);
        tracing::info!("exec {:?} in {}/{}", command, namespace, &target.pod);
        let mut attached = pods
            .exec(&target.pod, command.to_vec(), &self.attach_params(target))
            .await
            .map_err(|err| {
                Error::connection(
                    format!("failed starting {:?} in pod {}/{}", command, namespace, &target.pod),
                    err,
                )
            })?;
        let missing = |stream: &str| Error::Stream {
            context: format!("remote {stream} was not attached"),
            source: None,
        };
        let mut remote_stdin = attached.stdin().ok_or_else(|| missing("stdin"))?;
        let remote_stdout = attached.stdout().ok_or_else(|| missing("stdout"))?;
        let remote_stderr = attached.stderr().ok_or_else(|| missing("stderr"))?;
        let status = attached.take_status().ok_or_else(|| missing("status"))?;
        let upload = async move {
            let mut stdin = stdin;
            match tokio::io::copy(&mut stdin, &mut remote_stdin).await {
                Ok(sent) => {
                    remote_stdin.flush().await?;
                    tracing::debug!("sent {} bytes to remote stdin", sent);
                    // closing stdin ends the whole exec session, status and late stderr
                    // included; the writer stays open until the command has exited
                    Ok(remote_stdin)
                }
                Err(err) => {
                    // end-of-input on a truncated archive makes the remote command fail
                    if let Err(shutdown) = remote_stdin.shutdown().await {
                        tracing::debug!("failed closing remote stdin: {}", shutdown);
                    }
                    Err(err)
                }
            }
        };
        let (uploaded, relayed_stdout, relayed_stderr, status) = tokio::join!(
            upload,
            relay(remote_stdout, stdout),
            relay(remote_stderr, stderr),
            status,
        );
        let joined = attached.join().await;
        // the exit status explains a broken stream better than the stream error does
        let succeeded = match &status {
            Some(status) => {
                tracing::debug!("remote status: {:?}", status);
                check_status(status)?;
                true
            }
            None => false,
        };
        joined.map_err(|err| Error::stream("remote connection terminated abnormally", err))?;
        match uploaded {
            Ok(remote_stdin) => drop(remote_stdin),
            // a command may exit successfully without draining its input (e.g. trailing padding)
            Err(err) if succeeded && err.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::debug!("remote command exited before consuming all of stdin");
            }
            Err(err) => return Err(Error::stream("failed streaming to remote stdin", err)),
        }
        relayed_stdout.map_err(|err| Error::io("failed relaying remote stdout", err))?;
        relayed_stderr.map_err(|err| Error::io("failed relaying remote stderr", err))?;
        if !succeeded {
            return Err(Error::Stream {
                context: "connection closed before the remote command reported its exit status"
                    .to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};
    use tokio::io::AsyncReadExt;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tracing_test::traced_test;

    fn failure(reason: &str, causes: Vec<StatusCause>) -> Status {
        Status {
            status: Some("Failure".to_string()),
            message: Some("command terminated with non-zero exit code".to_string()),
            reason: Some(reason.to_string()),
            details: Some(StatusDetails {
                causes: Some(causes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn success_status_is_ok() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert!(check_status(&status).is_ok());
    }

    #[test]
    fn non_zero_exit_code_is_parsed() {
        let status = failure(
            "NonZeroExitCode",
            vec![StatusCause {
                reason: Some("ExitCode".to_string()),
                message: Some("2".to_string()),
                ..Default::default()
            }],
        );
        match check_status(&status) {
            Err(Error::RemoteNonZeroExit { code, message }) => {
                assert_eq!(code, Some(2));
                assert!(message.contains("non-zero exit code"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn other_failures_have_no_code() {
        let status = failure("InternalError", vec![]);
        assert!(matches!(
            check_status(&status),
            Err(Error::RemoteNonZeroExit { code: None, .. })
        ));
        // a status object without a verdict is not success either
        assert!(check_status(&Status::default()).is_err());
    }

    #[tokio::test]
    async fn attach_params_request_all_streams_without_tty() -> Result<(), anyhow::Error> {
        let config = kube::Config::new("https://127.0.0.1:6443".parse()?);
        let handle = ClusterHandle {
            client: kube::Client::try_from(config)?,
            default_namespace: "default".to_string(),
        };
        let executor = KubeExecutor::new(handle).with_stdin_buffer(4096);
        let mut target = ExecTarget {
            namespace: None,
            pod: "web".to_string(),
            container: Some("app".to_string()),
        };
        let params = executor.attach_params(&target);
        assert!(params.stdin && params.stdout && params.stderr && !params.tty);
        assert_eq!(params.container.as_deref(), Some("app"));
        assert_eq!(params.max_stdin_buf_size, Some(4096));
        target.container = None;
        assert_eq!(executor.attach_params(&target).container, None);
        Ok(())
    }

    const STDIN_CHANNEL: u8 = 0;
    const STDERR_CHANNEL: u8 = 2;
    const STATUS_CHANNEL: u8 = 3;
    const CLOSE_CHANNEL: u8 = 255;

    const SUCCESS: &str = r#"{"metadata":{},"status":"Success"}"#;
    const EXIT_2: &str = r#"{"metadata":{},"status":"Failure","message":"command terminated with non-zero exit code: exit status 2","reason":"NonZeroExitCode","details":{"causes":[{"reason":"ExitCode","message":"2"}]}}"#;

    /// What the fake API server saw of one exec session.
    #[derive(Debug, Default)]
    struct Session {
        uri: String,
        stdin: Vec<u8>,
        stdin_closed: bool,
    }

    /// Accepts one exec upgrade and plays the kubelet side of the channel protocol.
    ///
    /// Reads stdin until `expected` bytes arrived or the client closed it. Then,
    /// unless stdin was closed, waits a little, writes a line to stderr and sends
    /// `status` before closing the connection.
    async fn serve_exec(
        listener: tokio::net::TcpListener,
        expected: usize,
        status: &'static str,
    ) -> Result<Session, anyhow::Error> {
        let (stream, _) = listener.accept().await?;
        let mut session = Session::default();
        let uri = &mut session.uri;
        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            *uri = request.uri().to_string();
            if let Some(offered) = request.headers().get("Sec-WebSocket-Protocol") {
                let protocol = offered
                    .to_str()
                    .unwrap()
                    .split(',')
                    .next()
                    .unwrap()
                    .trim()
                    .to_string();
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", protocol.parse().unwrap());
            }
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (mut sink, mut source) = ws.split();
        let closed = |message: &Option<Result<Message, _>>| match message {
            Some(Ok(Message::Binary(data))) => data.first() == Some(&CLOSE_CHANNEL),
            Some(Ok(Message::Close(_))) | None => true,
            _ => false,
        };
        while session.stdin.len() < expected {
            let message = source.next().await;
            if closed(&message) {
                session.stdin_closed = true;
                return Ok(session);
            }
            if let Some(Ok(Message::Binary(data))) = message
                && data.first() == Some(&STDIN_CHANNEL)
            {
                session.stdin.extend_from_slice(&data[1..]);
            }
        }
        let idle = tokio::time::timeout(std::time::Duration::from_millis(100), source.next()).await;
        if let Ok(message) = idle
            && closed(&message)
        {
            session.stdin_closed = true;
            return Ok(session);
        }
        let mut stderr = vec![STDERR_CHANNEL];
        stderr.extend_from_slice(b"tar: Removing leading `/' from member names\n");
        sink.send(Message::Binary(stderr)).await?;
        let mut verdict = vec![STATUS_CHANNEL];
        verdict.extend_from_slice(status.as_bytes());
        sink.send(Message::Binary(verdict)).await?;
        sink.send(Message::Close(None)).await?;
        Ok(session)
    }

    async fn fake_cluster() -> Result<(tokio::net::TcpListener, KubeExecutor), anyhow::Error> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}", listener.local_addr()?);
        let config = kube::Config::new(url.parse()?);
        let handle = ClusterHandle {
            client: kube::Client::try_from(config)?,
            default_namespace: "default".to_string(),
        };
        Ok((listener, KubeExecutor::new(handle).with_stdin_buffer(1024)))
    }

    fn web() -> ExecTarget {
        ExecTarget {
            namespace: None,
            pod: "web".to_string(),
            container: None,
        }
    }

    fn tar_into(dir: &str) -> Vec<String> {
        crate::extract_command(std::path::Path::new(dir))
    }

    #[tokio::test]
    #[traced_test]
    async fn complete_upload_waits_for_exit_status() -> Result<(), anyhow::Error> {
        let (listener, executor) = fake_cluster().await?;
        let server = tokio::spawn(serve_exec(listener, 10240, SUCCESS));
        let archive: Vec<u8> = (0..10240u32).map(|i| (i % 241) as u8).collect();
        let (stderr_writer, mut stderr_reader) = tokio::io::duplex(4096);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            executor.exec(
                &web(),
                &tar_into("/tmp"),
                std::io::Cursor::new(archive.clone()),
                tokio::io::sink(),
                stderr_writer,
            ),
        )
        .await?;
        let session = server.await??;
        result?;
        assert!(!session.stdin_closed);
        assert_eq!(session.stdin, archive);
        assert!(session.uri.contains("/namespaces/default/pods/web/exec"));
        assert!(session.uri.contains("command=tar"));
        assert!(session.uri.contains("stdin=true"));
        let mut stderr = String::new();
        stderr_reader.read_to_string(&mut stderr).await?;
        assert!(stderr.contains("Removing leading"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn remote_exit_code_is_reported_after_complete_upload() -> Result<(), anyhow::Error> {
        let (listener, executor) = fake_cluster().await?;
        let server = tokio::spawn(serve_exec(listener, 10240, EXIT_2));
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            executor.exec(
                &web(),
                &tar_into("/root"),
                std::io::Cursor::new(vec![0u8; 10240]),
                tokio::io::sink(),
                tokio::io::sink(),
            ),
        )
        .await?;
        server.await??;
        assert!(
            matches!(result, Err(Error::RemoteNonZeroExit { code: Some(2), .. })),
            "unexpected result: {result:?}"
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_input_closes_remote_stdin() -> Result<(), anyhow::Error> {
        let (listener, executor) = fake_cluster().await?;
        let server = tokio::spawn(serve_exec(listener, 10240, SUCCESS));
        let (mut producer, consumer) = common::bridge::create(4, 512);
        let writer = tokio::task::spawn_blocking(move || {
            std::io::Write::write_all(&mut producer, &[1u8; 4096])?;
            std::io::Write::flush(&mut producer)
            // dropped without close: the archive is incomplete
        });
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            executor.exec(
                &web(),
                &tar_into("/tmp"),
                consumer,
                tokio::io::sink(),
                tokio::io::sink(),
            ),
        )
        .await?;
        writer.await??;
        let session = server.await??;
        assert!(session.stdin_closed);
        assert!(session.stdin.len() <= 4096);
        assert!(matches!(result, Err(Error::Stream { .. })), "unexpected result: {result:?}");
        Ok(())
    }
}

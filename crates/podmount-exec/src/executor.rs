//! WebSocket implementation of the [`Executor`] seam.
//!
//! Each call opens its own exec session against the pod's `exec`
//! subresource and tears it down when the command ends. Buffered runs
//! collect the whole session; streaming runs hand back a reader fed by a
//! pump task on the runtime, so FUSE worker threads can block on it without
//! occupying the runtime itself.

use std::cmp;
use std::io::{self, Read};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use podmount_core::{ExecError, ExecResult, Executor, RemoteStream};

use crate::channel::{
    exec_url, parse_status, split_frame, stdin_frame, ExecOutcome, ExecTarget, ERROR_CHANNEL,
    EXEC_SUBPROTOCOL, INTERRUPT_BYTE, STDERR_CHANNEL, STDOUT_CHANNEL,
};
use crate::config::ClusterConfig;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// In-flight stdout chunks buffered between the pump and a reader.
const STREAM_BUFFER: usize = 32;

fn transport(err: impl ToString) -> ExecError {
    ExecError::Transport(err.to_string())
}

/// Runs commands in one container over the cluster's WebSocket exec
/// channel. Cheap to clone; every call is an independent session.
#[derive(Clone)]
pub struct PodExecutor {
    handle: Handle,
    config: Arc<ClusterConfig>,
    target: ExecTarget,
}

impl PodExecutor {
    pub fn new(handle: Handle, config: Arc<ClusterConfig>, target: ExecTarget) -> PodExecutor {
        PodExecutor {
            handle,
            config,
            target,
        }
    }

    fn connector(&self) -> ExecResult<Connector> {
        let mut builder = native_tls::TlsConnector::builder();
        if let Some(pem) = &self.config.ca_pem {
            let cert = native_tls::Certificate::from_pem(pem).map_err(transport)?;
            builder.add_root_certificate(cert);
        }
        if self.config.accept_invalid_certs {
            builder.danger_accept_invalid_certs(true);
        }
        Ok(Connector::NativeTls(builder.build().map_err(transport)?))
    }

    async fn connect(&self, argv: &[String], stdin: bool) -> ExecResult<WsStream> {
        let url = exec_url(&self.config, &self.target, argv, stdin).map_err(transport)?;
        debug!(target: "podmount::exec", %url, "opening exec session");

        let mut request = url.as_str().into_client_request().map_err(transport)?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(EXEC_SUBPROTOCOL));
        if let Some(token) = &self.config.token {
            let value =
                HeaderValue::from_str(&format!("Bearer {token}")).map_err(transport)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let connector = self.connector()?;
        let (ws, _response) =
            connect_async_tls_with_config(request, None, false, Some(connector))
                .await
                .map_err(transport)?;
        Ok(ws)
    }

    async fn run_buffered(
        &self,
        cancel: &CancellationToken,
        argv: &[String],
    ) -> ExecResult<Vec<u8>> {
        let mut ws = self.connect(argv, false).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut outcome = ExecOutcome::Success;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return Err(ExecError::Cancelled);
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Some((channel, payload)) = split_frame(&data) {
                            match channel {
                                STDOUT_CHANNEL => stdout.extend_from_slice(payload),
                                STDERR_CHANNEL => stderr.extend_from_slice(payload),
                                ERROR_CHANNEL => outcome = parse_status(payload),
                                _ => {}
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(transport(err)),
                },
            }
        }

        match outcome {
            ExecOutcome::Success => Ok(stdout),
            ExecOutcome::Failure { exit_code, message } => Err(ExecError::Command {
                stderr: if stderr.is_empty() {
                    message.into_bytes()
                } else {
                    stderr
                },
                exit_code: exit_code.unwrap_or(-1),
            }),
        }
    }

    fn spawn_stream(&self, cancel: &CancellationToken, ws: WsStream) -> ExecStream {
        let (event_tx, event_rx) = mpsc::channel::<ExecResult<Vec<u8>>>(STREAM_BUFFER);
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let cancel = cancel.child_token();
        let pump_cancel = cancel.clone();

        self.handle.spawn(async move {
            let (mut sink, mut stream) = ws.split();
            let mut stderr: Vec<u8> = Vec::new();
            let mut outcome = ExecOutcome::Success;
            let mut stdin_open = true;

            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => {
                        // Same cleanup as close: interrupt, drain, tear down.
                        let _ = sink.send(Message::Binary(stdin_frame(&[INTERRUPT_BYTE]))).await;
                        while let Some(msg) = stream.next().await {
                            match msg {
                                Ok(Message::Close(_)) | Err(_) => break,
                                _ => {}
                            }
                        }
                        let _ = event_tx.send(Err(ExecError::Cancelled)).await;
                        return;
                    }
                    data = stdin_rx.recv(), if stdin_open => match data {
                        Some(bytes) => {
                            if sink.send(Message::Binary(bytes)).await.is_err() {
                                stdin_open = false;
                            }
                        }
                        None => stdin_open = false,
                    },
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if let Some((channel, payload)) = split_frame(&data) {
                                match channel {
                                    STDOUT_CHANNEL => {
                                        if !payload.is_empty() {
                                            // A dropped reader discards the
                                            // tail; keep reading so the
                                            // sender is never blocked.
                                            let _ = event_tx.send(Ok(payload.to_vec())).await;
                                        }
                                    }
                                    STDERR_CHANNEL => stderr.extend_from_slice(payload),
                                    ERROR_CHANNEL => outcome = parse_status(payload),
                                    _ => {}
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            if let ExecOutcome::Failure { exit_code, message } = outcome {
                                let _ = event_tx
                                    .send(Err(ExecError::Command {
                                        stderr: if stderr.is_empty() {
                                            message.into_bytes()
                                        } else {
                                            stderr
                                        },
                                        exit_code: exit_code.unwrap_or(-1),
                                    }))
                                    .await;
                            }
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            let _ = event_tx.send(Err(transport(err))).await;
                            return;
                        }
                    },
                }
            }
        });

        ExecStream {
            events: Some(event_rx),
            stdin: stdin_tx,
            cancel,
            handle: self.handle.clone(),
            chunk: Vec::new(),
            pos: 0,
            closed: false,
        }
    }
}

impl Executor for PodExecutor {
    fn run(&self, cancel: &CancellationToken, argv: &[String]) -> ExecResult<Vec<u8>> {
        self.handle.block_on(self.run_buffered(cancel, argv))
    }

    fn run_read(
        &self,
        cancel: &CancellationToken,
        argv: &[String],
    ) -> ExecResult<Box<dyn RemoteStream>> {
        let ws = self.handle.block_on(self.connect(argv, true))?;
        Ok(Box::new(self.spawn_stream(cancel, ws)))
    }
}

/// Streaming stdout of one exec session.
///
/// Reads park the calling thread on the pump's channel; the stream is
/// strictly sequential. Closing interrupts the remote process, hands any
/// tail output to a drainer task and releases the session.
pub struct ExecStream {
    events: Option<mpsc::Receiver<ExecResult<Vec<u8>>>>,
    stdin: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    handle: Handle,
    chunk: Vec<u8>,
    pos: usize,
    closed: bool,
}

impl Read for ExecStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.chunk.len() {
                let n = cmp::min(buf.len(), self.chunk.len() - self.pos);
                buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            let events = match self.events.as_mut() {
                Some(events) => events,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "stream is closed",
                    ))
                }
            };
            match events.blocking_recv() {
                Some(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Some(Err(err)) => return Err(io::Error::new(io::ErrorKind::Other, err)),
                None => return Ok(0),
            }
        }
    }
}

impl RemoteStream for ExecStream {
    fn close(&mut self) -> ExecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Queue the interrupt for the remote process, then detach the
        // receiver into a drainer so a pump blocked on a full buffer can
        // finish delivering and observe the interrupt.
        let _ = self.stdin.send(stdin_frame(&[INTERRUPT_BYTE]));
        self.cancel.cancel();
        if let Some(mut events) = self.events.take() {
            self.handle.spawn(async move {
                while events.recv().await.is_some() {}
            });
        }
        Ok(())
    }
}

impl Drop for ExecStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

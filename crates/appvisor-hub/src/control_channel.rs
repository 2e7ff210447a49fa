use appvisor_core::control_ipc::{
    authorize, decode_frame, encode_frame, max_line_bytes, ControlAction, ControlError,
    ControlErrorCode, ControlRejection, ControlReply, ControlRequest, FrameError,
    DEFAULT_MAX_FRAME_BYTES,
};
use appvisor_core::secret::{self, SecretError};
use serde_json::Value;
use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

pub const DEFAULT_IPC_PORT: u16 = 2658;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTimings {
    pub request_timeout: Duration,
    /// Ports tried when binding, starting at the well-known port.
    pub bind_span: u16,
    /// Ports scanned for peers when sending without `target_port_only`.
    pub scan_span: u16,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub relaunch_delay: Duration,
    pub relaunch_grace: Duration,
}

impl Default for ControlTimings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            bind_span: 100,
            scan_span: 10,
            poll_interval: Duration::from_millis(300),
            max_wait: Duration::from_secs(10),
            relaunch_delay: Duration::from_millis(100),
            relaunch_grace: Duration::from_secs(1),
        }
    }
}

impl ControlTimings {
    pub fn probe_iterations(&self) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        let iterations = self.max_wait.as_millis().div_ceil(interval);
        u32::try_from(iterations).unwrap_or(u32::MAX).max(1)
    }

    /// Hard upper bound for the whole liveness loop.
    pub fn probe_budget(&self) -> Duration {
        self.poll_interval
            .saturating_mul(self.probe_iterations())
            .saturating_add(self.request_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub port: u16,
    pub secret: String,
}

/// An authenticated request waiting for the supervisor's answer.
#[derive(Debug)]
pub struct InboundControl {
    pub action: ControlAction,
    pub request: ControlRequest,
    pub reply: oneshot::Sender<ControlReply>,
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("control secret unavailable: {0}")]
    Secret(#[from] SecretError),
    #[error("no free port in {start}..{end}")]
    NoFreePort { start: u16, end: u32 },
    #[error("bind failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("request timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("peer closed the connection without replying")]
    Closed,
    #[error("peer rejected request: {0:?}")]
    Rejected(ControlError),
}

impl SendError {
    /// Failures that just mean "nobody useful is listening there".
    fn is_quiet(&self) -> bool {
        match self {
            SendError::Connect(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::TimedOut
            ),
            SendError::Timeout | SendError::Closed => true,
            SendError::Rejected(error) => error.code == ControlErrorCode::NotFound,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct ControlServer {
    endpoint: Endpoint,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
            info!(event = "control_server_stop", port = self.endpoint.port);
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

pub async fn listen(
    start_port: u16,
    secret_path: &Path,
    timings: ControlTimings,
    handler: mpsc::UnboundedSender<InboundControl>,
) -> Result<ControlServer, BindError> {
    let secret = secret::load_or_create(secret_path)?;
    let listener = bind_first_free(start_port, timings.bind_span).await?;
    let port = listener.local_addr()?.port();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shared_secret: Arc<str> = Arc::from(secret.as_str());
    let task = tokio::spawn(serve(
        listener,
        shared_secret,
        handler,
        timings.request_timeout,
        shutdown_rx,
    ));

    info!(event = "control_server_start", port, start_port);
    Ok(ControlServer {
        endpoint: Endpoint { port, secret },
        shutdown: shutdown_tx,
        task: Some(task),
    })
}

async fn bind_first_free(start_port: u16, span: u16) -> Result<TcpListener, BindError> {
    let end = (u32::from(start_port) + u32::from(span.max(1))).min(u32::from(u16::MAX) + 1);
    for candidate in u32::from(start_port)..end {
        let Ok(port) = u16::try_from(candidate) else {
            break;
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
                ) =>
            {
                debug!(event = "control_port_busy", port);
            }
            Err(err) => return Err(BindError::Io(err)),
        }
    }
    Err(BindError::NoFreePort {
        start: start_port,
        end,
    })
}

async fn serve(
    listener: TcpListener,
    secret: Arc<str>,
    handler: mpsc::UnboundedSender<InboundControl>,
    request_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, addr)) => {
                        if !addr.ip().is_loopback() {
                            warn!(event = "control_non_loopback_peer", peer = %addr);
                            continue;
                        }
                        let secret = secret.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, secret, handler, request_timeout).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "control_accept_error", error = %err);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    secret: Arc<str>,
    handler: mpsc::UnboundedSender<InboundControl>,
    request_timeout: Duration,
) {
    let (reader_half, mut writer_half) = stream.into_split();
    let mut reader = BufReader::new(reader_half);
    let line = match tokio::time::timeout(request_timeout, read_frame_line(&mut reader)).await {
        Ok(Ok(Ok(line))) if line.is_empty() => return,
        Ok(Ok(line)) => line,
        Ok(Err(err)) => {
            warn!(event = "control_read_error", error = %err);
            return;
        }
        Err(_) => {
            debug!(event = "control_read_timeout");
            return;
        }
    };

    let request =
        line.and_then(|line| decode_frame::<ControlRequest>(&line, DEFAULT_MAX_FRAME_BYTES));
    let reply = match request {
        Ok(request) => dispatch(request, &secret, &handler, request_timeout).await,
        Err(err) => {
            warn!(event = "control_decode_error", error = %err);
            ControlReply::error(ControlErrorCode::BadRequest, err.to_string())
        }
    };

    let frame = match encode_frame(&reply, DEFAULT_MAX_FRAME_BYTES) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "control_encode_error", error = %err);
            return;
        }
    };
    let write = async {
        writer_half.write_all(&frame).await?;
        writer_half.flush().await
    };
    if tokio::time::timeout(request_timeout, write).await.is_err() {
        warn!(event = "control_write_timeout");
    }
}

/// Reads one newline-terminated frame without buffering more than a frame's
/// worth of bytes. An empty line means the peer closed without sending.
async fn read_frame_line<R>(reader: &mut R) -> io::Result<Result<Vec<u8>, FrameError>>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max_line_bytes(DEFAULT_MAX_FRAME_BYTES);
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(limit as u64);
    limited.read_until(b'\n', &mut line).await?;
    if !line.ends_with(b"\n") && line.len() >= limit {
        return Ok(Err(FrameError::OversizedFrame {
            size: line.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        }));
    }
    Ok(Ok(line))
}

async fn dispatch(
    request: ControlRequest,
    secret: &str,
    handler: &mpsc::UnboundedSender<InboundControl>,
    request_timeout: Duration,
) -> ControlReply {
    let action = match authorize(&request, secret) {
        Ok(action) => action,
        Err(rejection) => {
            log_rejection(&request, &rejection);
            return ControlReply::rejected(&rejection);
        }
    };

    debug!(event = "control_request", action = %action, source_port = ?request.source_port);
    let (reply_tx, reply_rx) = oneshot::channel();
    let inbound = InboundControl {
        action,
        request,
        reply: reply_tx,
    };
    if handler.send(inbound).is_err() {
        return ControlReply::error(ControlErrorCode::Unavailable, "supervisor is gone");
    }
    match tokio::time::timeout(request_timeout, reply_rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => ControlReply::error(ControlErrorCode::Unavailable, "handler dropped request"),
        Err(_) => ControlReply::error(ControlErrorCode::Unavailable, "handler timed out"),
    }
}

fn log_rejection(request: &ControlRequest, rejection: &ControlRejection) {
    match rejection {
        ControlRejection::Unauthorized => warn!(
            event = "control_unauthorized",
            action = %request.action,
            source_port = ?request.source_port
        ),
        other => warn!(
            event = "control_rejected",
            code = ?other.code(),
            reason = %other,
            source_port = ?request.source_port
        ),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub target_port_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutput {
    pub port: u16,
    pub value: Value,
}

/// Signs `request` with this instance's endpoint and delivers it to every
/// listening peer in the scan range (or only to `port`). Returns immediately
/// with nothing when this instance has no endpoint.
pub async fn send(
    endpoint: Option<&Endpoint>,
    port: u16,
    request: ControlRequest,
    options: SendOptions,
    timings: &ControlTimings,
) -> Vec<SendOutput> {
    let Some(endpoint) = endpoint else {
        debug!(event = "control_send_skipped", action = %request.action);
        return Vec::new();
    };
    let request = request.signed(endpoint.port, &endpoint.secret);

    let span = if options.target_port_only {
        1
    } else {
        u32::from(timings.scan_span.max(1))
    };
    let end = (u32::from(port) + span).min(u32::from(u16::MAX) + 1);

    let mut outputs = Vec::new();
    for candidate in u32::from(port)..end {
        let Ok(target) = u16::try_from(candidate) else {
            break;
        };
        if target == endpoint.port {
            continue;
        }
        match exchange(target, &request, timings.request_timeout).await {
            Ok(reply) => outputs.push(SendOutput {
                port: target,
                value: reply.value,
            }),
            Err(err) if err.is_quiet() => {
                debug!(event = "control_send_skip", port = target, error = %err);
            }
            Err(err) => {
                warn!(
                    event = "control_send_error",
                    port = target,
                    action = %request.action,
                    error = %err
                );
            }
        }
    }
    outputs
}

pub async fn exchange(
    port: u16,
    request: &ControlRequest,
    timeout: Duration,
) -> Result<ControlReply, SendError> {
    let frame = encode_frame(request, DEFAULT_MAX_FRAME_BYTES)?;
    let round_trip = async {
        let stream = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .map_err(SendError::Connect)?;
        let (reader_half, mut writer_half) = stream.into_split();
        writer_half.write_all(&frame).await?;
        writer_half.flush().await?;

        let mut reader = BufReader::new(reader_half);
        let line = read_frame_line(&mut reader).await??;
        if line.is_empty() {
            return Err(SendError::Closed);
        }
        let reply: ControlReply = decode_frame(&line, DEFAULT_MAX_FRAME_BYTES)?;
        match reply.error {
            Some(error) => Err(SendError::Rejected(error)),
            None => Ok(reply),
        }
    };
    tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| SendError::Timeout)?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Gone { probes: u32 },
    StillAlive { probes: u32 },
}

/// Pings `target_port` until it stops answering. A probe cut short by the
/// overall deadline counts as no answer.
pub async fn probe_until_gone(
    endpoint: &Endpoint,
    target_port: u16,
    timings: &ControlTimings,
) -> ProbeOutcome {
    let iterations = timings.probe_iterations();
    let deadline = Instant::now() + timings.probe_budget();
    let options = SendOptions {
        target_port_only: true,
    };

    for probe in 1..=iterations {
        let ping = ControlRequest::new(ControlAction::Ping, Value::Null);
        let answered = tokio::time::timeout_at(
            deadline,
            send(Some(endpoint), target_port, ping, options, timings),
        )
        .await
        .map(|outputs| !outputs.is_empty())
        .unwrap_or(false);

        if !answered {
            debug!(event = "control_probe_gone", port = target_port, probes = probe);
            return ProbeOutcome::Gone { probes: probe };
        }
        if probe == iterations {
            break;
        }

        let now = Instant::now();
        if now >= deadline {
            return ProbeOutcome::StillAlive { probes: probe };
        }
        tokio::time::sleep(timings.poll_interval.min(deadline - now)).await;
    }
    ProbeOutcome::StillAlive { probes: iterations }
}

/// Asks the owning instance to relaunch this alternate instance once it has
/// exited. True when some peer accepted.
pub async fn request_alt_restart(
    endpoint: Option<&Endpoint>,
    port: u16,
    timings: &ControlTimings,
) -> bool {
    let request = ControlRequest::new(ControlAction::RestartAltInstance, Value::Null);
    send(endpoint, port, request, SendOptions::default(), timings)
        .await
        .iter()
        .any(|output| output.value == Value::Bool(true))
}

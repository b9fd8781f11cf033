//! Connection handlers for the collab server.
//!
//! This module handles the connection lifecycle: the join handshake, the
//! reader loop feeding updates into the connection manager, and the writer
//! task draining each client's outbox onto its socket.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use bytes::BytesMut;
use collab_core::{
    Client, ClientHandle, ClientId, ClientOutbox, ConnectionManager, Outbound, Payload,
    ProjectDirectory, ProjectMap, SharedPayload,
};
use collab_protocol::{
    codec, error_codes, Frame, FrameDecoder, FrameType, MessageKind, Version, ALL_PERMISSIONS,
    PROTOCOL_VERSION,
};
use serde_json::{Map, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Upper bound on bytes coalesced into one socket write.
const MAX_BATCH_BYTES: usize = 64 * 1024;

/// Shared server state.
pub struct AppState {
    /// The connection manager.
    pub manager: Arc<ConnectionManager>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state, seeding the user registry from the config.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let manager = ConnectionManager::new(config.manager.clone(), Arc::new(ProjectMap::new()));
        for user in &config.users {
            if !manager.register_user(user.clone()) {
                warn!(uid = user.uid, username = %user.username, "Skipping user with reserved uid");
            }
        }
        info!(users = manager.users().len(), "User registry loaded");

        Self {
            manager: Arc::new(manager),
            config,
        }
    }
}

/// Why a join was refused.
#[derive(Debug, Error)]
enum JoinError {
    #[error("Expected a join frame, got {0:?}")]
    NotJoin(FrameType),

    #[error("Protocol version {client} is not compatible with {server}")]
    IncompatibleVersion { client: Version, server: Version },

    #[error("Unknown user {0}")]
    UnknownUser(u32),

    #[error("Server is at its limit of {0} connections")]
    TooManyConnections(usize),

    #[error("Server is shutting down")]
    ShuttingDown,
}

impl JoinError {
    fn code(&self) -> u16 {
        match self {
            JoinError::NotJoin(_) => error_codes::UNEXPECTED_FRAME,
            JoinError::IncompatibleVersion { .. } => error_codes::INCOMPATIBLE_VERSION,
            JoinError::UnknownUser(_) => error_codes::UNKNOWN_USER,
            JoinError::TooManyConnections(_) => error_codes::TOO_MANY_CONNECTIONS,
            JoinError::ShuttingDown => error_codes::SHUTTING_DOWN,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            JoinError::NotJoin(_) => "unexpected_frame",
            JoinError::IncompatibleVersion { .. } => "incompatible_version",
            JoinError::UnknownUser(_) => "unknown_user",
            JoinError::TooManyConnections(_) => "too_many_connections",
            JoinError::ShuttingDown => "shutting_down",
        }
    }
}

/// Run the collab server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));
    state.manager.start()?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        metrics::spawn_sampler(Arc::clone(&state.manager), Duration::from_secs(1));
    }

    if config.admin.enabled {
        let addr = config.admin_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Admin endpoint: http://{}", addr);
        tokio::spawn(crate::admin::serve(listener, Arc::clone(&state)));
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Collab server listening on {}", addr);

    serve(listener, state, shutdown_signal()).await;
    Ok(())
}

/// Accept connections until `shutdown` resolves, then stop the manager.
pub async fn serve(listener: TcpListener, state: Arc<AppState>, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(handle_connection(stream, peer, state));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    metrics::record_error("accept");
                }
            },
            () = &mut shutdown => break,
        }
    }

    info!("Shutting down");
    state.manager.terminate();
    state.manager.wait_stopped().await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Handle one TCP connection.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(peer = %peer, "Connection accepted");

    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    if let Err(e) = serve_client(stream, peer, &state).await {
        debug!(peer = %peer, error = %e, "Connection closed with error");
    }
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, state: &AppState) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new(state.config.limits.max_message_size);

    let join_timeout = Duration::from_millis(state.config.limits.join_timeout_ms);
    let first = match tokio::time::timeout(join_timeout, read_frame(&mut reader, &mut decoder)).await
    {
        Ok(frame) => frame?,
        Err(_) => {
            debug!(peer = %peer, "No join frame before timeout");
            metrics::record_error("join_timeout");
            return Ok(());
        }
    };
    let Some(first) = first else {
        return Ok(());
    };

    let (handle, outbox) = match admit(first, peer, state) {
        Ok(admitted) => admitted,
        Err(e) => {
            info!(peer = %peer, error = %e, "Join refused");
            metrics::record_error(e.kind());
            send_frame(&mut writer, &Frame::error(e.code(), e.to_string())).await?;
            return Ok(());
        }
    };
    let handle = Arc::new(handle);
    let id = handle.id();

    // Members must be in the directory before they learn they have joined.
    state.manager.projects().add_client(handle.clone());
    let joined = Frame::joined(id.as_u64(), handle.publish_mask(), handle.subscribe_mask());
    if let Err(e) = send_frame(&mut writer, &joined).await {
        state.manager.remove(id);
        return Err(e);
    }
    info!(
        client = %id,
        peer = %peer,
        uid = handle.uid(),
        project = handle.pid(),
        "Client joined"
    );

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_outbox(writer, outbox, control_rx, id));

    let result = read_updates(&mut reader, &mut decoder, &handle, &state.manager, &control_tx).await;

    state.manager.remove(id);
    handle.terminate();
    drop(control_tx);
    if let Err(e) = writer_task.await {
        warn!(client = %id, error = %e, "Writer task failed");
    }
    info!(client = %id, "Client left");
    result
}

/// Validate a join frame and build the client's handle.
fn admit(
    frame: Frame,
    peer: SocketAddr,
    state: &AppState,
) -> Result<(ClientHandle, ClientOutbox), JoinError> {
    let frame_type = frame.frame_type();
    let Frame::Join {
        version,
        uid,
        project,
        publish,
        subscribe,
    } = frame
    else {
        return Err(JoinError::NotJoin(frame_type));
    };

    if state.manager.is_done() {
        return Err(JoinError::ShuttingDown);
    }
    PROTOCOL_VERSION
        .negotiate(&version)
        .ok_or(JoinError::IncompatibleVersion {
            client: version,
            server: PROTOCOL_VERSION,
        })?;

    let user = state.manager.get_user_info(uid);
    if !user.is_valid() {
        return Err(JoinError::UnknownUser(uid));
    }

    let limit = state.config.limits.max_connections;
    if state.manager.projects().client_count() >= limit {
        return Err(JoinError::TooManyConnections(limit));
    }

    Ok(ClientHandle::new(
        user,
        project,
        peer,
        publish.unwrap_or(ALL_PERMISSIONS),
        subscribe.unwrap_or(ALL_PERMISSIONS),
    ))
}

/// Read until one complete frame is buffered; `None` on a clean EOF.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Option<Frame>> {
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(Some(frame));
        }
        if reader.read_buf(decoder.buffer_mut()).await? == 0 {
            return Ok(None);
        }
    }
}

/// Feed inbound frames to the manager until the peer leaves or the client is terminated.
async fn read_updates(
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    handle: &Arc<ClientHandle>,
    manager: &ConnectionManager,
    control: &mpsc::UnboundedSender<Frame>,
) -> Result<()> {
    loop {
        while let Some(frame) = decoder.next_frame()? {
            handle.record_received();
            handle_frame(frame, handle, manager, control)?;
        }

        tokio::select! {
            read = reader.read_buf(decoder.buffer_mut()) => {
                let read = read?;
                if read == 0 {
                    debug!(client = %handle.id(), "Peer closed connection");
                    return Ok(());
                }
                metrics::record_message(read, "inbound");
            }
            () = handle.terminated() => {
                debug!(client = %handle.id(), "Reader stopped by terminate");
                return Ok(());
            }
        }
    }
}

/// Handle a decoded frame from a joined client.
fn handle_frame(
    frame: Frame,
    handle: &Arc<ClientHandle>,
    manager: &ConnectionManager,
    control: &mpsc::UnboundedSender<Frame>,
) -> Result<()> {
    match frame {
        Frame::Update {
            cmd,
            payload,
            permission,
        } => {
            let permission = permission.unwrap_or(ALL_PERMISSIONS);
            if handle.publish_mask() & permission == 0 {
                warn!(
                    client = %handle.id(),
                    cmd = %cmd,
                    permission = format_args!("{:#x}", permission),
                    "Publish denied"
                );
                metrics::record_error("publish_denied");
                let _ = control.send(Frame::error(
                    error_codes::PUBLISH_DENIED,
                    format!("Publish mask does not allow permission {permission:#x}"),
                ));
                return Ok(());
            }

            match manager.post_update(handle.as_ref(), cmd, Payload::from(payload), permission) {
                Ok(_) => metrics::record_update(),
                Err(e) => {
                    let _ = control.send(Frame::error(error_codes::SHUTTING_DOWN, e.to_string()));
                    return Err(e.into());
                }
            }
        }

        Frame::Ping { timestamp } => {
            let _ = control.send(Frame::pong(timestamp));
        }

        Frame::Pong { .. } => {}

        other => {
            warn!(client = %handle.id(), frame_type = ?other.frame_type(), "Unexpected frame type");
            metrics::record_error("unexpected_frame");
            let _ = control.send(Frame::error(
                error_codes::UNEXPECTED_FRAME,
                format!("Unexpected {:?} frame", other.frame_type()),
            ));
        }
    }

    Ok(())
}

/// Drain the outbox and control frames onto the socket, coalescing writes.
///
/// When the client is terminated a shutdown message is sent and the socket
/// is closed for writing.
async fn write_outbox(
    mut writer: OwnedWriteHalf,
    mut outbox: ClientOutbox,
    mut control: mpsc::UnboundedReceiver<Frame>,
    id: ClientId,
) {
    let mut buf = BytesMut::with_capacity(MAX_BATCH_BYTES);

    loop {
        let first = tokio::select! {
            item = outbox.next() => match item {
                Some(item) => outbound_frame(item),
                None => break,
            },
            Some(frame) = control.recv() => frame,
        };

        if let Err(e) = codec::encode_into(&first, &mut buf) {
            warn!(client = %id, error = %e, "Failed to encode frame");
            metrics::record_error("encode");
        }

        // Drain everything else ready
        while buf.len() < MAX_BATCH_BYTES {
            let next = match outbox.try_next() {
                Some(item) => outbound_frame(item),
                None => match control.try_recv() {
                    Ok(frame) => frame,
                    Err(_) => break,
                },
            };
            if let Err(e) = codec::encode_into(&next, &mut buf) {
                warn!(client = %id, error = %e, "Failed to encode frame");
                metrics::record_error("encode");
            }
        }

        if buf.is_empty() {
            continue;
        }
        if let Err(e) = writer.write_all(&buf).await {
            debug!(client = %id, error = %e, "Write failed");
            return;
        }
        metrics::record_message(buf.len(), "outbound");
        buf.clear();
    }

    while let Ok(frame) = control.try_recv() {
        if send_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }

    if outbox.is_terminated() {
        let shutdown = Frame::message(MessageKind::Shutdown, Map::new());
        if send_frame(&mut writer, &shutdown).await.is_err() {
            debug!(client = %id, "Peer gone before shutdown message");
        }
    }
    let _ = writer.shutdown().await;
}

/// Turn an outbox item into its wire frame.
fn outbound_frame(item: Outbound) -> Frame {
    match item {
        Outbound::Update { cmd, payload } => Frame::Update {
            cmd,
            payload: into_map(payload),
            permission: None,
        },
        Outbound::Message { kind, payload } => Frame::message(kind, payload.into_map()),
    }
}

/// Take the map out of the last reference, or copy it while others remain.
fn into_map(payload: SharedPayload) -> Map<String, Value> {
    Arc::try_unwrap(payload)
        .map(Payload::into_map)
        .unwrap_or_else(|shared| shared.as_map().clone())
}

/// Send a single frame.
async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    writer.write_all(&data).await?;
    metrics::record_message(data.len(), "outbound");
    Ok(())
}

//! Adapter for the Jupyter wire protocol over ZeroMQ.
//!
//! Five dedicated sockets connect the gateway to a kernel subprocess: shell
//! and control are DEALER (request/reply, matched by `msg_id`), iopub is SUB
//! (broadcast, fanned out to every attached bridge), stdin is DEALER, and
//! heartbeat is REQ (liveness only, never exposed to clients).
//!
//! iopub fans out to many subscribers via a `tokio::sync::broadcast` channel
//! rather than a single consumer, since a gateway kernel may have several
//! attached WebSocket bridges at once.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, warn};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use super::{signing, Header, Message, Reply};
use crate::error::GatewayError;

const DELIMITER: &[u8] = b"<IDS|MSG>";

fn to_zmq_payload(msg: &Message, key: &[u8]) -> Option<ZmqMessage> {
    let header = Bytes::from(serde_json::to_vec(&msg.header).ok()?);
    let parent_header = Bytes::from(serde_json::to_vec(&msg.parent_header).ok()?);
    let metadata = Bytes::from(serde_json::to_vec(&msg.metadata).ok()?);
    let content = Bytes::from(serde_json::to_vec(&msg.content).ok()?);

    let mut payload = vec![header, parent_header, metadata, content];
    payload.extend(msg.buffers.iter().cloned());

    let signature = signing::sign(key, &payload);
    payload.insert(0, Bytes::from(signature));
    payload.insert(0, Bytes::from_static(DELIMITER));

    ZmqMessage::try_from(payload).ok()
}

/// Parse a raw multipart ZeroMQ frame into a [`Message`], verifying its
/// signature. Returns `None` if the frame is malformed or the signature does
/// not verify; the caller is expected to log and drop it.
fn from_zmq_payload(payload: ZmqMessage, key: &[u8]) -> Option<Message> {
    let payload = payload.into_vec();
    let delim_idx = payload.iter().position(|b| *b == DELIMITER)?;
    let signature = std::str::from_utf8(&payload[delim_idx + 1]).ok()?;
    let parts: Vec<Bytes> = payload[delim_idx + 2..].to_vec();
    if parts.len() < 4 {
        return None;
    }
    if !signing::verify(key, &parts[..], signature) {
        return None;
    }

    let header = serde_json::from_slice(&parts[0]).ok()?;
    let parent_header = serde_json::from_slice(&parts[1]).ok()?;
    let metadata = serde_json::from_slice(&parts[2]).ok()?;
    let content = serde_json::from_slice(&parts[3]).ok()?;
    let buffers = parts[4..].to_vec();

    Some(Message {
        header,
        parent_header,
        metadata,
        content,
        buffers,
    })
}

/// A live connection to a kernel subprocess's four request/reply/broadcast
/// channels. Cloning shares the same underlying sockets and reply map.
#[derive(Clone)]
pub struct KernelConnection {
    shell_tx: async_channel::Sender<Message>,
    control_tx: async_channel::Sender<Message>,
    stdin_tx: async_channel::Sender<Message>,
    iopub_rx: broadcast::Sender<Message>,
    stdin_rx: broadcast::Sender<Message>,
    reply_tx_map: Arc<DashMap<String, oneshot::Sender<Message>>>,
    signal: CancellationToken,
    _drop_guard: Arc<DropGuard>,
}

impl KernelConnection {
    /// Send a message to the kernel over the shell channel, returning a
    /// handle that resolves to its reply.
    pub async fn call_shell<T: serde::Serialize>(
        &self,
        message: Message<T>,
    ) -> Result<PendingRequest, GatewayError> {
        self.call(&self.shell_tx, message).await
    }

    /// Send a message to the kernel over the control channel.
    pub async fn call_control<T: serde::Serialize>(
        &self,
        message: Message<T>,
    ) -> Result<PendingRequest, GatewayError> {
        self.call(&self.control_tx, message).await
    }

    /// Send a message to the kernel over the stdin channel (no reply tracked;
    /// stdin replies are unsolicited `input_reply` messages from the client).
    pub async fn send_stdin<T: serde::Serialize>(
        &self,
        message: Message<T>,
    ) -> Result<(), GatewayError> {
        self.stdin_tx
            .send(message.into_json())
            .await
            .map_err(|_| GatewayError::KernelDisconnect)
    }

    async fn call<T: serde::Serialize>(
        &self,
        tx: &async_channel::Sender<Message>,
        message: Message<T>,
    ) -> Result<PendingRequest, GatewayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg_id = message.header.msg_id.clone();
        self.reply_tx_map.insert(msg_id.clone(), reply_tx);

        tx.send(message.into_json())
            .await
            .map_err(|_| GatewayError::KernelDisconnect)?;

        Ok(PendingRequest {
            reply_tx_map: self.reply_tx_map.clone(),
            reply_rx,
            msg_id,
        })
    }

    /// Subscribe a new receiver to the kernel's iopub broadcast stream. Each
    /// subscriber sees every message published from the point of subscription
    /// onward, in order.
    pub fn subscribe_iopub(&self) -> broadcast::Receiver<Message> {
        self.iopub_rx.subscribe()
    }

    /// Subscribe to unsolicited messages from the kernel on the stdin
    /// channel (`input_request`, when running code prompts for input).
    pub fn subscribe_stdin(&self) -> broadcast::Receiver<Message> {
        self.stdin_rx.subscribe()
    }

    /// Close the connection, tearing down all per-socket tasks.
    pub fn close(&self) {
        self.signal.cancel();
    }
}

/// Receives a reply to a previous shell/control request.
pub struct PendingRequest {
    reply_tx_map: Arc<DashMap<String, oneshot::Sender<Message>>>,
    reply_rx: oneshot::Receiver<Message>,
    msg_id: String,
}

impl PendingRequest {
    /// Wait for the reply to the previous request from the kernel.
    pub async fn get_reply<U: serde::de::DeserializeOwned>(
        self,
    ) -> Result<Message<Reply<U>>, GatewayError> {
        let msg = self.reply_rx.await.map_err(|_| GatewayError::KernelDisconnect)?;
        Ok(msg.into_typed()?)
    }

    /// Wait for the reply, passed through untouched (content left as JSON).
    /// Used when the caller only relays the reply rather than inspecting
    /// its status, e.g. the WebSocket bridge.
    pub async fn get_raw_reply(self) -> Result<Message, GatewayError> {
        self.reply_rx.await.map_err(|_| GatewayError::KernelDisconnect)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.reply_tx_map.remove(&self.msg_id);
    }
}

/// Connect to a locally-spawned kernel subprocess via ZeroMQ, given the five
/// ports from its connection file and its HMAC signing key.
pub async fn connect(
    shell_port: u16,
    control_port: u16,
    iopub_port: u16,
    stdin_port: u16,
    signing_key: &[u8],
) -> Result<KernelConnection, GatewayError> {
    let (shell_tx, shell_rx) = async_channel::bounded(8);
    let (control_tx, control_rx) = async_channel::bounded(8);
    let (stdin_tx, stdin_rx) = async_channel::bounded(8);
    let (iopub_tx, _) = broadcast::channel(256);
    let (stdin_broadcast_tx, _) = broadcast::channel(16);
    let reply_tx_map = Arc::new(DashMap::new());
    let signal = CancellationToken::new();

    let conn = KernelConnection {
        shell_tx,
        control_tx,
        stdin_tx,
        iopub_rx: iopub_tx.clone(),
        stdin_rx: stdin_broadcast_tx.clone(),
        reply_tx_map: reply_tx_map.clone(),
        signal: signal.clone(),
        _drop_guard: Arc::new(signal.clone().drop_guard()),
    };

    let mut shell = zeromq::DealerSocket::new();
    shell.connect(&format!("tcp://127.0.0.1:{shell_port}")).await?;
    let mut control = zeromq::DealerSocket::new();
    control.connect(&format!("tcp://127.0.0.1:{control_port}")).await?;
    let mut iopub = zeromq::SubSocket::new();
    iopub.connect(&format!("tcp://127.0.0.1:{iopub_port}")).await?;
    iopub.subscribe("").await?;
    let mut stdin = zeromq::DealerSocket::new();
    stdin.connect(&format!("tcp://127.0.0.1:{stdin_port}")).await?;

    let key = signing_key.to_vec();
    let tx_map = reply_tx_map.clone();
    let shell_fut = async move {
        loop {
            tokio::select! {
                Ok(msg) = shell_rx.recv() => {
                    let Some(payload) = to_zmq_payload(&msg, &key) else {
                        error!("error converting shell message to zmq payload");
                        continue;
                    };
                    if let Err(err) = shell.send(payload).await {
                        warn!(%err, "error sending zmq shell message");
                    }
                }
                Ok(payload) = shell.recv() => {
                    match from_zmq_payload(payload, &key) {
                        Some(msg) => reply_to_waiter(&tx_map, msg),
                        None => warn!("dropped unsigned or malformed shell reply"),
                    }
                }
                else => break,
            }
        }
    };

    let key = signing_key.to_vec();
    let tx_map = reply_tx_map.clone();
    let control_fut = async move {
        loop {
            tokio::select! {
                Ok(msg) = control_rx.recv() => {
                    let Some(payload) = to_zmq_payload(&msg, &key) else {
                        error!("error converting control message to zmq payload");
                        continue;
                    };
                    if let Err(err) = control.send(payload).await {
                        warn!(%err, "error sending zmq control message");
                    }
                }
                Ok(payload) = control.recv() => {
                    match from_zmq_payload(payload, &key) {
                        Some(msg) => reply_to_waiter(&tx_map, msg),
                        None => warn!("dropped unsigned or malformed control reply"),
                    }
                }
                else => break,
            }
        }
    };

    let key = signing_key.to_vec();
    let stdin_fut = async move {
        loop {
            tokio::select! {
                Ok(msg) = stdin_rx.recv() => {
                    let Some(payload) = to_zmq_payload(&msg, &key) else {
                        error!("error converting stdin message to zmq payload");
                        continue;
                    };
                    if let Err(err) = stdin.send(payload).await {
                        warn!(%err, "error sending zmq stdin message");
                    }
                }
                Ok(payload) = stdin.recv() => {
                    match from_zmq_payload(payload, &key) {
                        // No receivers is normal (no bridge attached); ignore.
                        Some(msg) => { let _ = stdin_broadcast_tx.send(msg); }
                        None => warn!("dropped unsigned or malformed stdin message"),
                    }
                }
                else => break,
            }
        }
    };

    let key = signing_key.to_vec();
    let iopub_fut = async move {
        while let Ok(payload) = iopub.recv().await {
            match from_zmq_payload(payload, &key) {
                Some(msg) => {
                    // No receivers is normal (no bridge attached yet); ignore.
                    let _ = iopub_tx.send(msg);
                }
                None => warn!("dropped unsigned or malformed iopub message"),
            }
        }
    };

    tokio::spawn(async move {
        tokio::select! {
            _ = async { tokio::join!(shell_fut, control_fut, stdin_fut, iopub_fut) } => {}
            _ = signal.cancelled() => {}
        }
    });

    Ok(conn)
}

fn reply_to_waiter(tx_map: &DashMap<String, oneshot::Sender<Message>>, msg: Message) {
    if let Some(Header { msg_id, .. }) = &msg.parent_header {
        if let Some((_, reply_tx)) = tx_map.remove(msg_id) {
            let _ = reply_tx.send(msg);
        }
    }
}

/// Ping the kernel's heartbeat socket once, returning whether the echo was
/// received within `timeout`. Used by [`crate::kernel::Kernel`]'s liveness
/// loop, which marks the kernel dead after three consecutive failures.
pub async fn heartbeat_once(heartbeat_port: u16, timeout: Duration) -> bool {
    let mut sock = zeromq::ReqSocket::new();
    if sock
        .connect(&format!("tcp://127.0.0.1:{heartbeat_port}"))
        .await
        .is_err()
    {
        return false;
    }
    let attempt = async {
        sock.send(ZmqMessage::from(b"ping".to_vec())).await.ok()?;
        sock.recv().await.ok()
    };
    matches!(tokio::time::timeout(timeout, attempt).await, Ok(Some(_)))
}

//! Splices one client WebSocket to one kernel's four logical channels.
//!
//! The gateway sits on the server side of this framing: client-bound and
//! kernel-bound traffic swap roles relative to a plain Jupyter client, and
//! every channel (not just iopub) must fan out, since several bridges can
//! share one kernel's iopub and stdin streams.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::warn;

use crate::kernel::{Kernel, KernelState};
use crate::wire::{Channel, Header, Message};

/// The JSON text envelope a WS client sends/receives for each channel
/// message. Buffers travel over binary frames instead, via
/// [`crate::wire::ws_frame`].
#[derive(Serialize, Deserialize)]
struct Envelope {
    channel: String,
    header: Header,
    parent_header: Option<Header>,
    #[serde(default)]
    metadata: serde_json::Value,
    content: serde_json::Value,
}

/// A message ready to be written out to the client on a given channel.
struct Outbound {
    channel: Channel,
    message: Message,
}

/// Run the bridge for the lifetime of one WebSocket connection, until the
/// client disconnects or the kernel dies.
pub async fn run(socket: WebSocket, kernel: Arc<Kernel>, ws_ping_interval_secs: u64) {
    kernel.add_connection();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut iopub_rx = kernel.conn().subscribe_iopub();
    let mut stdin_broadcast_rx = kernel.conn().subscribe_stdin();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Outbound>(32);

    let mut ping_timer = if ws_ping_interval_secs > 0 {
        Some(interval(Duration::from_secs(ws_ping_interval_secs)))
    } else {
        None
    };

    loop {
        let ping_tick = async {
            match &mut ping_timer {
                Some(timer) => {
                    timer.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            inbound = ws_rx.next() => {
                let Some(Ok(frame)) = inbound else { break };
                handle_inbound(frame, &kernel, reply_tx.clone()).await;
            }
            Ok(msg) = iopub_rx.recv() => {
                kernel.touch();
                if send_outbound(&mut ws_tx, &msg, Channel::IoPub).await.is_err() {
                    break;
                }
            }
            Ok(msg) = stdin_broadcast_rx.recv() => {
                if send_outbound(&mut ws_tx, &msg, Channel::Stdin).await.is_err() {
                    break;
                }
            }
            Some(outbound) = reply_rx.recv() => {
                if send_outbound(&mut ws_tx, &outbound.message, outbound.channel).await.is_err() {
                    break;
                }
            }
            _ = ping_tick => {
                if ws_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }

        if kernel.state().await == KernelState::Dead {
            let _ = ws_tx.send(WsMessage::Close(None)).await;
            break;
        }
    }

    kernel.remove_connection();
}

async fn handle_inbound(frame: WsMessage, kernel: &Arc<Kernel>, reply_tx: mpsc::Sender<Outbound>) {
    let (msg, channel) = match frame {
        WsMessage::Text(text) => match parse_envelope(&text) {
            Some(parsed) => parsed,
            None => {
                warn!("dropped malformed WS text envelope");
                return;
            }
        },
        WsMessage::Binary(bytes) => match crate::wire::ws_frame::decode(&bytes) {
            Some((msg, channel)) => (msg, channel),
            None => {
                warn!("dropped malformed WS binary frame");
                return;
            }
        },
        _ => return,
    };

    let Some(channel) = Channel::from_name(&channel) else {
        warn!(%channel, "dropped WS message on unknown channel");
        return;
    };

    kernel.touch();

    match channel {
        Channel::Shell | Channel::Control => {
            // The send to the kernel happens inline, in the order inbound
            // frames arrive off the WebSocket: two shell requests sent back
            // to back must reach the kernel in that order. Only the reply
            // wait is spawned off, since it may take arbitrarily long and
            // must not block the next inbound frame.
            let pending = match channel {
                Channel::Shell => kernel.conn().call_shell(msg).await,
                Channel::Control => kernel.conn().call_control(msg).await,
                _ => unreachable!(),
            };
            match pending {
                Ok(pending) => {
                    tokio::spawn(relay_reply(pending, channel, reply_tx));
                }
                Err(err) => warn!(%err, ?channel, "kernel disconnected before request could be sent"),
            }
        }
        Channel::Stdin => {
            if let Err(err) = kernel.conn().send_stdin(msg).await {
                warn!(%err, "failed to forward stdin message to kernel");
            }
        }
        Channel::IoPub | Channel::Heartbeat => {
            warn!(?channel, "rejected inbound message on a server-only channel");
        }
    }
}

async fn relay_reply(
    pending: crate::wire::zeromq::PendingRequest,
    channel: Channel,
    reply_tx: mpsc::Sender<Outbound>,
) {
    match pending.get_raw_reply().await {
        Ok(reply) => {
            let _ = reply_tx.send(Outbound { channel, message: reply }).await;
        }
        Err(err) => warn!(%err, ?channel, "kernel reply dropped or malformed"),
    }
}

fn parse_envelope(text: &str) -> Option<(Message, String)> {
    let envelope: Envelope = serde_json::from_str(text).ok()?;
    Some((
        Message {
            header: envelope.header,
            parent_header: envelope.parent_header,
            metadata: envelope.metadata,
            content: envelope.content,
            buffers: Vec::new(),
        },
        envelope.channel,
    ))
}

async fn send_outbound(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    msg: &Message,
    channel: Channel,
) -> Result<(), axum::Error> {
    if msg.buffers.is_empty() {
        let envelope = Envelope {
            channel: channel.as_name().to_string(),
            header: msg.header.clone(),
            parent_header: msg.parent_header.clone(),
            metadata: msg.metadata.clone(),
            content: msg.content.clone(),
        };
        let text = serde_json::to_string(&envelope).unwrap_or_default();
        ws_tx.send(WsMessage::Text(text)).await
    } else {
        match crate::wire::ws_frame::encode(msg, channel.as_name()) {
            Some(payload) => ws_tx.send(WsMessage::Binary(payload)).await,
            None => Ok(()),
        }
    }
}

//! The Jupyter kernel wire message shapes.
//!
//! See the [Messaging in Jupyter](https://jupyter-client.readthedocs.io/en/stable/messaging.html)
//! page for documentation about how this works. A message is a
//! `{header, parent_header, metadata, content, buffers}` 5-tuple, carried
//! over ZeroMQ between the gateway and a kernel subprocess, and over
//! WebSocket between a client and the gateway.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub mod signing;
pub mod ws_frame;
pub mod zeromq;

/// Type of a kernel wire protocol message, either request or reply.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageType {
    /// Execute a block of code.
    ExecuteRequest,
    /// Return execution results.
    ExecuteReply,
    /// Request kernel information.
    KernelInfoRequest,
    /// Reply with kernel information.
    KernelInfoReply,
    /// Request to check if code is complete.
    IsCompleteRequest,
    /// Reply indicating if code is complete.
    IsCompleteReply,
    /// Request kernel shutdown.
    ShutdownRequest,
    /// Reply to confirm kernel shutdown.
    ShutdownReply,
    /// Request to interrupt kernel execution.
    InterruptRequest,
    /// Reply to confirm kernel interruption.
    InterruptReply,
    /// Streams of output (stdout, stderr) from the kernel.
    Stream,
    /// Bring back data to be displayed in frontends.
    DisplayData,
    /// Re-broadcast of code in ExecuteRequest.
    ExecuteInput,
    /// Results of a code execution.
    ExecuteResult,
    /// When an error occurs during code execution.
    Error,
    /// Updates about kernel status.
    Status,
    /// A comm message, unused by the gateway core but passed through.
    CommMsg,
    /// Another kernel message type that is unrecognized.
    Other(String),
}

impl MessageType {
    fn as_wire_str(&self) -> &str {
        match self {
            MessageType::ExecuteRequest => "execute_request",
            MessageType::ExecuteReply => "execute_reply",
            MessageType::KernelInfoRequest => "kernel_info_request",
            MessageType::KernelInfoReply => "kernel_info_reply",
            MessageType::IsCompleteRequest => "is_complete_request",
            MessageType::IsCompleteReply => "is_complete_reply",
            MessageType::ShutdownRequest => "shutdown_request",
            MessageType::ShutdownReply => "shutdown_reply",
            MessageType::InterruptRequest => "interrupt_request",
            MessageType::InterruptReply => "interrupt_reply",
            MessageType::Stream => "stream",
            MessageType::DisplayData => "display_data",
            MessageType::ExecuteInput => "execute_input",
            MessageType::ExecuteResult => "execute_result",
            MessageType::Error => "error",
            MessageType::Status => "status",
            MessageType::CommMsg => "comm_msg",
            MessageType::Other(s) => s,
        }
    }

    fn from_wire_str(s: &str) -> Self {
        match s {
            "execute_request" => MessageType::ExecuteRequest,
            "execute_reply" => MessageType::ExecuteReply,
            "kernel_info_request" => MessageType::KernelInfoRequest,
            "kernel_info_reply" => MessageType::KernelInfoReply,
            "is_complete_request" => MessageType::IsCompleteRequest,
            "is_complete_reply" => MessageType::IsCompleteReply,
            "shutdown_request" => MessageType::ShutdownRequest,
            "shutdown_reply" => MessageType::ShutdownReply,
            "interrupt_request" => MessageType::InterruptRequest,
            "interrupt_reply" => MessageType::InterruptReply,
            "stream" => MessageType::Stream,
            "display_data" => MessageType::DisplayData,
            "execute_input" => MessageType::ExecuteInput,
            "execute_result" => MessageType::ExecuteResult,
            "error" => MessageType::Error,
            "status" => MessageType::Status,
            "comm_msg" => MessageType::CommMsg,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageType::from_wire_str(&s))
    }
}

/// Header of a message, generally part of the `{header, parent_header,
/// metadata, content, buffers}` 5-tuple.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Typically UUID, must be unique per message.
    pub msg_id: String,
    /// Typically UUID, should be unique per session.
    pub session: String,
    /// The username of the user sending the message.
    pub username: String,
    /// ISO 8601 timestamp for when the message is created.
    #[serde(with = "time::serde::iso8601")]
    pub date: OffsetDateTime,
    /// The message type.
    pub msg_type: MessageType,
    /// Message protocol version.
    pub version: String,
}

/// A message sent to or received from a kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct Message<T = serde_json::Value> {
    /// The message header.
    pub header: Header,
    /// The parent message header, if any.
    pub parent_header: Option<Header>,
    /// The message metadata (free-form, rarely used by this gateway).
    pub metadata: serde_json::Value,
    /// The content of the message.
    pub content: T,
    /// Buffers for large binary data, if any.
    pub buffers: Vec<Bytes>,
}

impl<T> Message<T> {
    /// Create a basic kernel message with the given header and content,
    /// optionally as a reply to `parent`.
    pub fn new(msg_type: MessageType, session: &str, content: T) -> Self {
        Self {
            header: Header {
                msg_id: Uuid::new_v4().to_string(),
                session: session.to_string(),
                username: "kernel-gateway".to_string(),
                date: OffsetDateTime::now_utc(),
                msg_type,
                version: "5.3".into(),
            },
            parent_header: None,
            metadata: serde_json::json!({}),
            content,
            buffers: Vec::new(),
        }
    }

    /// Mark this message as a reply to `parent`, inheriting its session.
    pub fn as_reply_to(mut self, parent: &Header) -> Self {
        self.header.session = parent.session.clone();
        self.parent_header = Some(parent.clone());
        self
    }
}

impl<T: Serialize> Message<T> {
    /// Produce a variant of the message with content erased to JSON.
    pub fn into_json(self) -> Message {
        Message {
            header: self.header,
            parent_header: self.parent_header,
            metadata: self.metadata,
            content: serde_json::to_value(&self.content).expect("message content serialization"),
            buffers: self.buffers,
        }
    }
}

impl Message {
    /// Deserialize the content of the message into a specific type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<Message<T>, serde_json::Error> {
        Ok(Message {
            content: serde_json::from_value(self.content)?,
            header: self.header,
            parent_header: self.parent_header,
            metadata: self.metadata,
            buffers: self.buffers,
        })
    }
}

/// The content of a reply to a kernel message, with status attached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply<T> {
    /// The request was processed successfully.
    Ok(T),
    /// The request failed due to an error.
    Error(ErrorReply),
    /// Same as `status = "error"` but with no information about the error.
    #[serde(alias = "aborted")]
    Abort,
}

/// Content of an error response message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorReply {
    /// The error name, such as `NameError`.
    pub ename: String,
    /// The error message, such as `NameError: name 'x' is not defined`.
    pub evalue: String,
    /// The traceback frames of the error.
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Execute code on behalf of the user (shell channel).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecuteRequest {
    /// Source code to be executed by the kernel.
    pub code: String,
    /// If true, signals the kernel to execute the code as quietly as possible.
    #[serde(default)]
    pub silent: bool,
    /// If true, signals the kernel to populate its history.
    #[serde(default = "default_true")]
    pub store_history: bool,
    /// Expressions to evaluate in the user's namespace after execution.
    #[serde(default)]
    pub user_expressions: BTreeMap<String, String>,
    /// If true, code may prompt for input via `input_request` messages.
    #[serde(default)]
    pub allow_stdin: bool,
    /// If true, abort the execution queue on exception.
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

fn default_true() -> bool {
    true
}

impl ExecuteRequest {
    /// An execute request with the defaults the gateway uses for both
    /// seed-cell execution and endpoint-cell dispatch: silent history is
    /// recorded, stdin is never allowed (there is no interactive user on the
    /// other end of an HTTP request).
    pub fn silent_or_not(code: impl Into<String>, silent: bool) -> Self {
        ExecuteRequest {
            code: code.into(),
            silent,
            store_history: !silent,
            user_expressions: BTreeMap::new(),
            allow_stdin: false,
            stop_on_error: true,
        }
    }
}

/// Represents a reply to an execute request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecuteReply {
    /// The execution count, which increments with each request that stores history.
    pub execution_count: i32,
}

/// Request for information about the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KernelInfoRequest {}

/// Represents a reply to a `kernel_info` request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KernelInfoReply {
    /// Version of the messaging protocol used by the kernel.
    pub protocol_version: String,
    /// The name of the kernel implementation (e.g. `ipython`).
    pub implementation: String,
    /// The version number of the kernel's implementation.
    pub implementation_version: String,
    /// Detailed information about the kernel's programming language.
    pub language_info: LanguageInfo,
    /// Banner of information about the kernel.
    #[serde(default)]
    pub banner: String,
}

/// Detailed information about the programming language of the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LanguageInfo {
    /// Name of the programming language.
    pub name: String,
    /// Version number of the language.
    #[serde(default)]
    pub version: String,
    /// MIME type for script files in this language.
    #[serde(default)]
    pub mimetype: String,
}

/// Request to shut down the kernel, possibly to prepare for a restart.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// Indicates whether the shutdown is final or precedes a restart.
    pub restart: bool,
}

/// Represents a reply to a shutdown request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReply {
    /// Matches the restart flag from the request.
    pub restart: bool,
}

/// Streams of output from the kernel, such as stdout and stderr.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    /// The name of the stream, one of `stdout` or `stderr`.
    pub name: String,
    /// The text to be displayed in the stream.
    pub text: String,
}

/// Results of a code execution, such as the output of the last expression.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecuteResult {
    /// The execution count, which increments with each request that stores history.
    pub execution_count: i32,
    /// The data to be displayed, keyed by MIME type.
    pub data: BTreeMap<String, serde_json::Value>,
    /// Metadata associated with the data.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Used by frontends to monitor the status of the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// Current status of the kernel.
    pub execution_state: KernelStatus,
}

/// Possible execution states of the kernel's current request, published on iopub.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// The kernel is starting up.
    Starting,
    /// The kernel is ready to execute code.
    Idle,
    /// The kernel is currently executing code.
    Busy,
}

/// The four logical channels a kernel exposes, plus heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Main channel for code execution and info requests.
    Shell,
    /// Broadcast channel for side effects and status.
    IoPub,
    /// Requests from the kernel to the client for standard input.
    Stdin,
    /// Like shell, but separated to avoid queueing behind long-running requests.
    Control,
    /// Periodic ping/pong liveness channel. Never exposed to WS clients.
    Heartbeat,
}

impl Channel {
    /// Parse a channel name as used in the client-facing WS envelope.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "shell" => Some(Channel::Shell),
            "iopub" => Some(Channel::IoPub),
            "stdin" => Some(Channel::Stdin),
            "control" => Some(Channel::Control),
            "hb" | "heartbeat" => Some(Channel::Heartbeat),
            _ => None,
        }
    }

    /// The channel name as used in the client-facing WS envelope.
    pub fn as_name(self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::IoPub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
            Channel::Heartbeat => "hb",
        }
    }
}

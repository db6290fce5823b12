//! A single spawned kernel subprocess: transport sockets, heartbeat,
//! liveness, shutdown (C2).
//!
//! Spawns a subprocess from a connection file and an argv template, tracked
//! through an explicit state machine, a heartbeat liveness loop, and a
//! SIGTERM-then-SIGKILL shutdown escalation.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use tokio::fs;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::kernelspec::KernelSpec;
use crate::wire::zeromq::{self, KernelConnection};

/// The lifecycle state of a kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    /// Subprocess spawned, connection file written, heartbeat not yet acked.
    Starting,
    /// Ready to execute code.
    Idle,
    /// Currently executing a request.
    Busy,
    /// Shutting down to be relaunched (seeding/pool lifecycle use only).
    Restarting,
    /// Sockets closed, subprocess reaped; must be removed from any map.
    Dead,
}

/// The five TCP ports and signing key a kernel's connection file describes.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// Loopback address the kernel's sockets are bound to.
    pub ip: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    /// Hex-encoded signing key, written verbatim into the connection file.
    /// The kernel reads this same string and HMACs with its ASCII bytes, so
    /// every signer/verifier in this process must key off `key.as_bytes()`
    /// rather than decoding it back to raw bytes.
    pub key: String,
}

impl ConnectionInfo {
    fn to_json(&self, kernel_name: &str) -> serde_json::Value {
        json!({
            "shell_port": self.shell_port,
            "iopub_port": self.iopub_port,
            "stdin_port": self.stdin_port,
            "control_port": self.control_port,
            "hb_port": self.hb_port,
            "ip": self.ip,
            "key": self.key,
            "transport": "tcp",
            "signature_scheme": "hmac-sha256",
            "kernel_name": kernel_name,
        })
    }
}

/// A live kernel subprocess and its transport connection.
pub struct Kernel {
    id: Uuid,
    spec_name: String,
    conn_info: ConnectionInfo,
    connection_file: std::path::PathBuf,
    child: tokio::process::Child,
    conn: KernelConnection,
    state: RwLock<KernelState>,
    last_activity: AtomicU64,
    connections: AtomicU32,
    env_overrides: BTreeMap<String, String>,
    heartbeat_secs: u64,
}

impl Kernel {
    /// Launch a kernel subprocess from its spec, writing a connection file
    /// with restrictive permissions and connecting to its ZeroMQ sockets.
    ///
    /// `env_overrides` must already be filtered against `env_whitelist`;
    /// this function never consults the whitelist itself.
    pub async fn launch(
        id: Uuid,
        spec: &KernelSpec,
        env_overrides: BTreeMap<String, String>,
        env_whitelist: &[String],
        runtime_dir: &std::path::Path,
        heartbeat_secs: u64,
    ) -> Result<Self, GatewayError> {
        let (shell_port, iopub_port, stdin_port, control_port, hb_port) = tokio::try_join!(
            available_port(),
            available_port(),
            available_port(),
            available_port(),
            available_port(),
        )?;

        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let key = hex::encode(key_bytes);
        let conn_info = ConnectionInfo {
            ip: "127.0.0.1".to_string(),
            shell_port,
            iopub_port,
            stdin_port,
            control_port,
            hb_port,
            key,
        };

        fs::create_dir_all(runtime_dir).await?;
        let connection_file = runtime_dir.join(format!("kernel-{id}.json"));
        write_connection_file(&connection_file, &conn_info, &spec.name).await?;

        if spec.argv.is_empty() {
            return Err(GatewayError::LaunchFailed(format!(
                "kernel spec {} has no argv",
                spec.name
            )));
        }
        let argv: Vec<String> = spec
            .argv
            .iter()
            .map(|s| s.replace("{connection_file}", &connection_file.to_string_lossy()))
            .collect();

        // Secret hygiene: the child only ever sees variables named in
        // env_whitelist from our own environment, never KG_AUTH_TOKEN or
        // anything else we happen to have been started with.
        let whitelisted = env_whitelist.iter().filter_map(|name| {
            std::env::var(name).ok().map(|value| (name.clone(), value))
        });

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .kill_on_drop(false)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env_clear()
            .envs(whitelisted)
            .envs(&spec.env)
            .envs(&env_overrides)
            .env("KERNEL_GATEWAY", "1");

        let child = command
            .spawn()
            .map_err(|err| GatewayError::LaunchFailed(err.to_string()))?;

        let conn = zeromq::connect(
            shell_port,
            control_port,
            iopub_port,
            stdin_port,
            conn_info.key.as_bytes(),
        )
        .await?;

        Ok(Self {
            id,
            spec_name: spec.name.clone(),
            conn_info,
            connection_file,
            child,
            conn,
            state: RwLock::new(KernelState::Starting),
            last_activity: AtomicU64::new(now_millis()),
            connections: AtomicU32::new(0),
            env_overrides,
            heartbeat_secs,
        })
    }

    /// The kernel's assigned id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The spec name this kernel was launched from.
    pub fn spec_name(&self) -> &str {
        &self.spec_name
    }

    /// The live transport connection, for sending execute/shutdown requests.
    pub fn conn(&self) -> &KernelConnection {
        &self.conn
    }

    /// Environment overrides this kernel was created with.
    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env_overrides
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> KernelState {
        *self.state.read().await
    }

    /// Move to a new lifecycle state.
    pub async fn set_state(&self, state: KernelState) {
        *self.state.write().await = state;
    }

    /// Milliseconds-since-epoch timestamp of the last observed activity.
    pub fn last_activity_millis(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Record that activity happened now.
    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Number of attached WebSocket bridges.
    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Increment the attached-bridge count.
    pub fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the attached-bridge count; called exactly once per bridge
    /// disconnect. Saturates at zero rather than underflowing.
    pub fn remove_connection(&self) {
        self.connections.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        }).ok();
    }

    /// Wait for the kernel's first heartbeat ack and transition to `Idle`
    /// once it arrives. A kernel stays `Starting` (never observably `Idle`)
    /// until it has actually proven it can service requests. Returns `false`
    /// if no ack arrives within `timeout`, leaving the state as `Starting`
    /// so the caller can treat the launch as failed.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        let alive = zeromq::heartbeat_once(self.conn_info.hb_port, timeout).await;
        if alive {
            self.set_state(KernelState::Idle).await;
        }
        alive
    }

    /// Run the heartbeat liveness loop until either the kernel dies or the
    /// returned future is dropped. Three consecutive failures mark the
    /// kernel `Dead` and trigger shutdown.
    pub async fn run_heartbeat_loop(self: &Arc<Self>) {
        if self.heartbeat_secs == 0 {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(self.heartbeat_secs));
        let mut consecutive_failures = 0u32;
        loop {
            interval.tick().await;
            if self.state().await == KernelState::Dead {
                return;
            }
            let alive = zeromq::heartbeat_once(
                self.conn_info.hb_port,
                Duration::from_secs(self.heartbeat_secs),
            )
            .await;
            if alive {
                consecutive_failures = 0;
                continue;
            }
            consecutive_failures += 1;
            warn!(kernel_id = %self.id, consecutive_failures, "heartbeat failed");
            if consecutive_failures >= 3 {
                warn!(kernel_id = %self.id, "heartbeat lost, marking kernel dead");
                self.set_state(KernelState::Dead).await;
                if let Err(err) = self.shutdown(Duration::from_secs(5)).await {
                    warn!(kernel_id = %self.id, %err, "error shutting down unresponsive kernel");
                }
                return;
            }
        }
    }

    /// Send `shutdown_request` on the control channel, wait up to `grace`
    /// for the process to exit on its own, then SIGTERM, then SIGKILL.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), GatewayError> {
        use crate::wire::{Message, MessageType, Reply, ShutdownReply, ShutdownRequest};

        self.conn.close();

        let request = Message::new(
            MessageType::ShutdownRequest,
            &self.id.to_string(),
            ShutdownRequest { restart: false },
        );
        if let Ok(pending) = self.conn.call_control(request).await {
            let _ = tokio::time::timeout(grace, pending.get_reply::<Reply<ShutdownReply>>()).await;
        }

        self.wait_or_escalate(grace).await;
        self.set_state(KernelState::Dead).await;
        let _ = fs::remove_file(&self.connection_file).await;
        Ok(())
    }

    async fn wait_or_escalate(&self, grace: Duration) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !process_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!(kernel_id = %self.id, pid, "grace period elapsed, sending SIGTERM");
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !process_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        warn!(kernel_id = %self.id, pid, "kernel did not exit after SIGTERM, sending SIGKILL");
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }

    /// Non-blocking check of whether the subprocess has exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

fn process_alive(pid: u32) -> bool {
    matches!(
        signal::kill(Pid::from_raw(pid as i32), None),
        Ok(()) | Err(nix::errno::Errno::EPERM)
    )
}

async fn write_connection_file(
    path: &std::path::Path,
    conn_info: &ConnectionInfo,
    kernel_name: &str,
) -> Result<(), GatewayError> {
    let body = conn_info.to_json(kernel_name).to_string();
    fs::write(path, &body).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

async fn available_port() -> Result<u16, GatewayError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_info_round_trips_through_json() {
        let info = ConnectionInfo {
            ip: "127.0.0.1".into(),
            shell_port: 1,
            iopub_port: 2,
            stdin_port: 3,
            control_port: 4,
            hb_port: 5,
            key: "abcd".to_string(),
        };
        let value = info.to_json("python3");
        assert_eq!(value["key"], "abcd");
        assert_eq!(value["kernel_name"], "python3");
        assert_eq!(value["signature_scheme"], "hmac-sha256");
    }
}

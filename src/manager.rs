//! Mapping from kernel id to live kernel process; create/list/get/shutdown,
//! capacity enforcement, and seed-notebook execution on create (C3).
//!
//! A plain id→kernel map extended with "run the seed notebook's cells on
//! the first kernel that matches its language" behavior. The map is guarded
//! by a short-held lock rather than a lock-free structure, since create and
//! shutdown must be strictly ordered per kernel id.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::kernel::{Kernel, KernelState};
use crate::kernelspec::KernelSpecRegistry;
use crate::notebook::cellparser::{CellKind, ParsedNotebook};
use crate::wire::{ExecuteReply, ExecuteRequest, Message, MessageType, Reply};

/// A minimal JSON-serializable view of a kernel, returned by the raw surface.
#[derive(Clone, Debug, serde::Serialize)]
pub struct KernelDescriptor {
    pub id: Uuid,
    pub name: String,
    pub last_activity: String,
    pub connections: u32,
    pub execution_state: KernelState,
}

/// Seed configuration the manager consults on every create.
pub struct SeedConfig {
    pub kernelspec_name: String,
    pub notebook: Arc<ParsedNotebook>,
}

/// Owns every live kernel and enforces capacity / seeding policy on create.
pub struct KernelManager {
    specs: Arc<KernelSpecRegistry>,
    kernels: Mutex<BTreeMap<Uuid, Arc<Kernel>>>,
    max_kernels: Option<usize>,
    force_kernel_name: String,
    default_kernel_name: String,
    env_whitelist: Vec<String>,
    runtime_dir: PathBuf,
    heartbeat_secs: u64,
    shutdown_grace: Duration,
    startup_timeout: Duration,
    seed: Option<SeedConfig>,
}

impl KernelManager {
    /// Construct an empty manager over a kernel spec registry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        specs: Arc<KernelSpecRegistry>,
        max_kernels: Option<usize>,
        force_kernel_name: String,
        default_kernel_name: String,
        env_whitelist: Vec<String>,
        runtime_dir: PathBuf,
        heartbeat_secs: u64,
        seed: Option<SeedConfig>,
    ) -> Self {
        Self {
            specs,
            kernels: Mutex::new(BTreeMap::new()),
            max_kernels,
            force_kernel_name,
            default_kernel_name,
            env_whitelist,
            runtime_dir,
            heartbeat_secs,
            shutdown_grace: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(10),
            seed,
        }
    }

    /// Create a new kernel, honoring capacity limits, name overrides, and
    /// seed-notebook execution.
    pub async fn create(
        &self,
        requested_name: Option<&str>,
        env_overrides: BTreeMap<String, String>,
        requested_id: Option<Uuid>,
    ) -> Result<Arc<Kernel>, GatewayError> {
        // Hold the map lock across the capacity check and slot reservation so
        // that concurrent creates for an explicit id are strictly serialised
        // and only one observes success.
        let id = requested_id.unwrap_or_else(Uuid::new_v4);
        {
            let kernels = self.kernels.lock().await;
            if let Some(max) = self.max_kernels {
                if kernels.len() >= max {
                    return Err(GatewayError::CapacityExceeded);
                }
            }
            if kernels.contains_key(&id) {
                return Err(GatewayError::LaunchFailed(format!(
                    "kernel id {id} already exists"
                )));
            }
        }

        let spec = self
            .specs
            .resolve(requested_name, &self.force_kernel_name, &self.default_kernel_name)?
            .clone();

        let kernel = Kernel::launch(
            id,
            &spec,
            env_overrides,
            &self.env_whitelist,
            &self.runtime_dir,
            self.heartbeat_secs,
        )
        .await?;
        let kernel = Arc::new(kernel);

        {
            let mut kernels = self.kernels.lock().await;
            kernels.insert(id, kernel.clone());
        }

        if !kernel.await_ready(self.startup_timeout).await {
            warn!(kernel_id = %id, "kernel did not ack a heartbeat before starting, shutting down");
            self.kernels.lock().await.remove(&id);
            let _ = kernel.shutdown(self.shutdown_grace).await;
            return Err(GatewayError::LaunchFailed(format!(
                "kernel {id} did not become ready within {:?}",
                self.startup_timeout
            )));
        }

        let heartbeat_kernel = kernel.clone();
        tokio::spawn(async move {
            heartbeat_kernel.run_heartbeat_loop().await;
        });

        info!(kernel_id = %id, spec = %spec.name, "kernel started");

        if let Some(seed) = &self.seed {
            if seed.kernelspec_name == spec.name {
                if let Err(err) = self.run_seed_cells(&kernel, seed).await {
                    warn!(kernel_id = %id, %err, "seeding failed, shutting kernel down");
                    self.shutdown(id).await.ok();
                    return Err(err);
                }
            }
        }

        Ok(kernel)
    }

    async fn run_seed_cells(
        &self,
        kernel: &Arc<Kernel>,
        seed: &SeedConfig,
    ) -> Result<(), GatewayError> {
        let session = kernel.id().to_string();
        for cell in &seed.notebook.cells {
            if !matches!(cell.kind, CellKind::Seed) {
                continue;
            }
            let request = Message::new(
                MessageType::ExecuteRequest,
                &session,
                ExecuteRequest::silent_or_not(cell.source.clone(), true),
            );
            let pending = kernel.conn().call_shell(request).await?;
            let reply: Message<Reply<ExecuteReply>> = pending.get_reply().await?;
            if let Reply::Error(err) = reply.content {
                return Err(GatewayError::SeedFailed {
                    ename: err.ename,
                    evalue: err.evalue,
                    traceback: err.traceback,
                });
            }
        }
        Ok(())
    }

    /// Resolve a spec name to its full [`KernelSpec`], honoring the same
    /// `force_kernel_name`/`default_kernel_name` overrides as [`create`](Self::create).
    /// Used by the notebook-HTTP personality to spawn its pool against the
    /// seed notebook's declared kernelspec before any HTTP request arrives.
    pub fn resolve_spec(
        &self,
        requested_name: &str,
    ) -> Result<crate::kernelspec::KernelSpec, GatewayError> {
        self.specs
            .resolve(Some(requested_name), &self.force_kernel_name, &self.default_kernel_name)
            .cloned()
    }

    /// Look up a kernel by id.
    pub async fn get(&self, id: Uuid) -> Result<Arc<Kernel>, GatewayError> {
        self.kernels
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(GatewayError::NotFound("kernel"))
    }

    /// List every live kernel as a descriptor. Callers must enforce
    /// `list_kernels` themselves.
    pub async fn list(&self) -> Vec<KernelDescriptor> {
        let kernels = self.kernels.lock().await;
        let mut descriptors = Vec::with_capacity(kernels.len());
        for kernel in kernels.values() {
            descriptors.push(KernelDescriptor {
                id: kernel.id(),
                name: kernel.spec_name().to_string(),
                last_activity: millis_to_iso8601(kernel.last_activity_millis()),
                connections: kernel.connections(),
                execution_state: kernel.state().await,
            });
        }
        descriptors
    }

    /// Shut down a kernel. Idempotent: a second call after removal returns
    /// `NotFound` rather than re-running shutdown.
    pub async fn shutdown(&self, id: Uuid) -> Result<(), GatewayError> {
        let kernel = {
            let mut kernels = self.kernels.lock().await;
            kernels.remove(&id)
        };
        let Some(kernel) = kernel else {
            return Err(GatewayError::NotFound("kernel"));
        };
        kernel.shutdown(self.shutdown_grace).await
    }

    /// Restart a kernel in place: shut down the subprocess, then launch a
    /// fresh one under the same id and spec, re-running seed cells if
    /// configured.
    pub async fn restart(&self, id: Uuid) -> Result<Arc<Kernel>, GatewayError> {
        let (spec_name, env_overrides) = {
            let kernels = self.kernels.lock().await;
            let kernel = kernels.get(&id).ok_or(GatewayError::NotFound("kernel"))?;
            (kernel.spec_name().to_string(), kernel.env_overrides().clone())
        };

        self.shutdown(id).await?;
        self.create(Some(&spec_name), env_overrides, Some(id)).await
    }

    /// Shut every live kernel down in parallel, used on server stop.
    pub async fn shutdown_all(&self) {
        let kernels: Vec<_> = self.kernels.lock().await.values().cloned().collect();
        let grace = self.shutdown_grace;
        futures_util::future::join_all(
            kernels.into_iter().map(|kernel| async move {
                let _ = kernel.shutdown(grace).await;
            }),
        )
        .await;
        self.kernels.lock().await.clear();
    }

    /// Number of currently live kernels.
    pub async fn len(&self) -> usize {
        self.kernels.lock().await.len()
    }
}

fn millis_to_iso8601(millis: u64) -> String {
    let dt = time::OffsetDateTime::UNIX_EPOCH + Duration::from_millis(millis);
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

//! A bounded pool of interchangeable, identically-seeded kernels, used by
//! the notebook-HTTP dispatcher (C6).
//!
//! A semaphore sized to the pool bounds concurrent borrows, and a FIFO
//! free-list decides which kernel a waiter gets next. Acquiring blocks
//! until a kernel is free; releasing returns it to the back of the list and
//! wakes one waiter.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::kernel::Kernel;
use crate::kernelspec::KernelSpec;
use crate::manager::KernelManager;

/// A kernel on loan from the pool. Dropping without calling
/// [`KernelPool::release`] leaks the permit; callers must always release.
pub struct Borrowed {
    pub kernel_id: Uuid,
    pub kernel: Arc<Kernel>,
}

/// Semaphore-guarded FIFO pool of kernels, all spawned from the same spec.
pub struct KernelPool {
    semaphore: Semaphore,
    free_list: Mutex<VecDeque<Uuid>>,
}

impl KernelPool {
    /// Spawn `prespawn_count` (at least 1) seeded kernels against `spec`
    /// through `manager`, and build the pool around them.
    pub async fn initialize(
        manager: &KernelManager,
        spec: &KernelSpec,
        prespawn_count: usize,
    ) -> Result<Self, GatewayError> {
        let count = prespawn_count.max(1);
        let mut free_list = VecDeque::with_capacity(count);
        for _ in 0..count {
            let kernel = manager.create(Some(&spec.name), Default::default(), None).await?;
            free_list.push_back(kernel.id());
        }
        Ok(Self {
            semaphore: Semaphore::new(count),
            free_list: Mutex::new(free_list),
        })
    }

    /// Block until a kernel is free, then remove it from the free list.
    pub async fn acquire(&self, manager: &KernelManager) -> Result<Borrowed, GatewayError> {
        let permit = self.semaphore.acquire().await.expect("semaphore is never closed");
        permit.forget();
        let kernel_id = {
            let mut free_list = self.free_list.lock().await;
            free_list.pop_front().expect("semaphore guarantees availability")
        };
        let kernel = manager.get(kernel_id).await?;
        Ok(Borrowed { kernel_id, kernel })
    }

    /// Return a kernel to the back of the free list and wake one waiter.
    pub async fn release(&self, kernel_id: Uuid) {
        self.free_list.lock().await.push_back(kernel_id);
        self.semaphore.add_permits(1);
    }

    /// Number of kernels currently available without blocking.
    pub async fn available(&self) -> usize {
        self.free_list.lock().await.len()
    }
}


//! Binds a client-chosen session id and document path to a kernel id (C5).
//!
//! `GET /api/sessions` is gated behind the same `list_kernels` flag the
//! kernel manager uses for `GET /api/kernels`. A session's lifecycle is
//! independent of its kernel's by design: sessions are NOT deleted
//! automatically when their kernel dies, only when a client asks or a
//! kernel's own removal sweeps its bound sessions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::GatewayError;

/// A client-visible session binding a document path and name to a kernel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub name: String,
    pub kernel_id: Uuid,
    #[serde(rename = "type", default = "default_session_type")]
    pub session_type: String,
}

fn default_session_type() -> String {
    "notebook".to_string()
}

/// The id→Session map. Many sessions may point at the same kernel id, though
/// the common case is a 1:1 binding.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl SessionRegistry {
    /// Create or replace a session binding. If `id` is omitted, a fresh
    /// UUID is assigned.
    pub async fn create(
        &self,
        id: Option<String>,
        path: String,
        name: String,
        session_type: String,
        kernel_id: Uuid,
    ) -> Session {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Session {
            id: id.clone(),
            path,
            name,
            kernel_id,
            session_type,
        };
        self.sessions.lock().await.insert(id, session.clone());
        session
    }

    /// Fetch a session by id.
    pub async fn get(&self, id: &str) -> Result<Session, GatewayError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or(GatewayError::NotFound("session"))
    }

    /// List every known session. Callers must enforce `list_kernels`
    /// themselves, same as the kernel manager's `list`.
    pub async fn list(&self) -> Vec<Session> {
        self.sessions.lock().await.values().cloned().collect()
    }

    /// Update a session's path/name/kernel binding, keeping its id.
    pub async fn patch(
        &self,
        id: &str,
        path: Option<String>,
        name: Option<String>,
        kernel_id: Option<Uuid>,
    ) -> Result<Session, GatewayError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id).ok_or(GatewayError::NotFound("session"))?;
        if let Some(path) = path {
            session.path = path;
        }
        if let Some(name) = name {
            session.name = name;
        }
        if let Some(kernel_id) = kernel_id {
            session.kernel_id = kernel_id;
        }
        Ok(session.clone())
    }

    /// Delete a session explicitly. Deleting a session never shuts down its
    /// kernel: the two lifecycles are independent by design.
    pub async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        self.sessions
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or(GatewayError::NotFound("session"))
    }

    /// Remove every session bound to a kernel that just died, without
    /// touching any kernel state itself.
    pub async fn remove_for_kernel(&self, kernel_id: Uuid) {
        self.sessions.lock().await.retain(|_, s| s.kernel_id != kernel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let registry = SessionRegistry::default();
        let kernel_id = Uuid::new_v4();
        let created = registry
            .create(None, "/notebook.ipynb".into(), "".into(), "notebook".into(), kernel_id)
            .await;
        let fetched = registry.get(&created.id).await.unwrap();
        assert_eq!(fetched.kernel_id, kernel_id);
    }

    #[tokio::test]
    async fn delete_is_independent_of_kernel_lifecycle() {
        let registry = SessionRegistry::default();
        let kernel_id = Uuid::new_v4();
        let created = registry
            .create(Some("s1".into()), "/a.ipynb".into(), "".into(), "notebook".into(), kernel_id)
            .await;
        registry.delete(&created.id).await.unwrap();
        assert!(registry.get("s1").await.is_err());
    }

    #[tokio::test]
    async fn remove_for_kernel_only_affects_matching_sessions() {
        let registry = SessionRegistry::default();
        let dead = Uuid::new_v4();
        let alive = Uuid::new_v4();
        registry
            .create(Some("dead-session".into()), "/a".into(), "".into(), "notebook".into(), dead)
            .await;
        registry
            .create(Some("alive-session".into()), "/b".into(), "".into(), "notebook".into(), alive)
            .await;
        registry.remove_for_kernel(dead).await;
        assert!(registry.get("dead-session").await.is_err());
        assert!(registry.get("alive-session").await.is_ok());
    }
}

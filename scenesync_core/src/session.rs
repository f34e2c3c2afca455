//! Per-session shared state.
//!
//! One [`SessionContext`] is built when a participant starts and is handed
//! (behind an `Arc`) to everything that needs to know who "we" are, who
//! the master is, or how synchronization is tuned.

use scenesync_env::SessionId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Synchronization tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often each entity's pose is sampled for local changes (default: 0.5s)
    pub pose_monitor_interval: Duration,

    /// How long an incoming pose takes to ease in (default: 0.1s)
    pub pose_snap_duration: Duration,

    /// Name of the child node every entity keeps its annotations under
    pub annotation_container: String,

    /// Name of the scene graph root
    pub scene_root: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pose_monitor_interval: Duration::from_millis(500),
            pose_snap_duration: Duration::from_millis(100),
            annotation_container: "Annotations".to_string(),
            scene_root: "Scene".to_string(),
        }
    }
}

/// What is known about another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub audible: bool,
}

impl Default for UserInfo {
    fn default() -> Self {
        Self {
            name: "Unnamed".to_string(),
            audible: false,
        }
    }
}

/// Identity, configuration and roster of one participant.
#[derive(Debug)]
pub struct SessionContext {
    local: SessionId,
    master: RwLock<SessionId>,
    config: SyncConfig,
    users: RwLock<HashMap<SessionId, UserInfo>>,
}

impl SessionContext {
    /// A session that is its own master until told otherwise.
    pub fn new(local: SessionId, config: SyncConfig) -> Self {
        Self {
            local,
            master: RwLock::new(local),
            config,
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared(local: SessionId, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self::new(local, config))
    }

    pub fn local_id(&self) -> SessionId {
        self.local
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn master_id(&self) -> SessionId {
        *self.master.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_master(&self, master: SessionId) {
        *self.master.write().unwrap_or_else(|e| e.into_inner()) = master;
    }

    pub fn is_master(&self) -> bool {
        self.master_id() == self.local
    }

    pub fn add_user(&self, session: SessionId, info: UserInfo) {
        self.users
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session, info);
    }

    pub fn remove_user(&self, session: SessionId) -> Option<UserInfo> {
        self.users
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session)
    }

    pub fn user(&self, session: SessionId) -> Option<UserInfo> {
        self.users
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session)
            .cloned()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

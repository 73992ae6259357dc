//! Application context: the explicitly constructed service bundle handed
//! to HTTP handlers and background tasks.

use std::sync::Arc;
use std::time::Duration;

use crate::model::EnqueueOptions;
use crate::monitor::MonitorGroup;
use crate::push::PushRegistry;
use crate::store::{CredentialStore, LibSqlBackend, QueueStore, SettingsStore};

#[derive(Clone)]
pub struct AppContext {
    pub queue: Arc<dyn QueueStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub credentials: Arc<dyn CredentialStore>,
    /// One registry per process.
    pub push: Arc<PushRegistry>,
    pub monitors: Arc<MonitorGroup>,
    /// Defaults applied when an enqueue request leaves options unset.
    pub enqueue_defaults: EnqueueOptions,
    /// Per-item visibility timeouts must outlast this.
    pub transform_timeout: Duration,
}

impl AppContext {
    /// Context with every store backed by one libSQL database.
    pub fn from_backend(
        db: Arc<LibSqlBackend>,
        push: Arc<PushRegistry>,
        monitors: Arc<MonitorGroup>,
        enqueue_defaults: EnqueueOptions,
        transform_timeout: Duration,
    ) -> Self {
        Self {
            queue: db.clone(),
            settings: db.clone(),
            credentials: db,
            push,
            monitors,
            enqueue_defaults,
            transform_timeout,
        }
    }
}

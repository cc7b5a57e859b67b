//! Typed publish/subscribe bus for model lifecycle events.

use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PostCreated { id: i64, slug: String },
    PostUpdated { id: i64, slug: String },
    PostDeleted { slug: String },
    TagCreated { id: i64, slug: String },
    TagUpdated { id: i64, slug: String },
    TagDeleted { slug: String },
    UserCreated { id: i64, slug: String },
    UserUpdated { id: i64, slug: String },
    UserDeleted { slug: String, posts_reassigned_to: i64 },
    UploadCreated { id: i64, filename: String },
    UploadUpdated { id: i64 },
    UploadDeleted { id: i64 },
    HistoryFlushed { post: i64, removed: usize },
    SettingsUpdated { names: Vec<String> },
    PluginEnabled { dir: String },
    PluginDisabled { dir: String },
    BackupCreated { filename: String },
    BackupRestored { filename: String },
    LoggedIn { username: String },
    LoggedOut { username: String },
}

impl Event {
    /// Dotted name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Event::PostCreated { .. } => "post.created",
            Event::PostUpdated { .. } => "post.updated",
            Event::PostDeleted { .. } => "post.deleted",
            Event::TagCreated { .. } => "tag.created",
            Event::TagUpdated { .. } => "tag.updated",
            Event::TagDeleted { .. } => "tag.deleted",
            Event::UserCreated { .. } => "user.created",
            Event::UserUpdated { .. } => "user.updated",
            Event::UserDeleted { .. } => "user.deleted",
            Event::UploadCreated { .. } => "upload.created",
            Event::UploadUpdated { .. } => "upload.updated",
            Event::UploadDeleted { .. } => "upload.deleted",
            Event::HistoryFlushed { .. } => "history.flushed",
            Event::SettingsUpdated { .. } => "settings.updated",
            Event::PluginEnabled { .. } => "plugin.enabled",
            Event::PluginDisabled { .. } => "plugin.disabled",
            Event::BackupCreated { .. } => "backup.created",
            Event::BackupRestored { .. } => "backup.restored",
            Event::LoggedIn { .. } => "session.login",
            Event::LoggedOut { .. } => "session.logout",
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handlers run synchronously, in subscription order, on the publishing
/// thread.
#[derive(Default, Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<(u64, Handler)>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

/// Returned by `subscribe`; pass to `unsubscribe` to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != subscription.0);
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(event = event.name(), "Publishing event");
        // Clone the list so handlers may subscribe without deadlocking
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }
}

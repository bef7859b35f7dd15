//! Best-effort collaborators the workers call out to
//!
//! None of these may fail a ticket: callers log errors and move on.

pub mod backup;
pub mod broadcast;
pub mod notify;

pub use backup::{BackupService, NoopBackup, ZipBackupService};
pub use broadcast::{Broadcaster, HttpBroadcaster, NoopBroadcaster};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};

use std::sync::Arc;

use crate::config::ServicesConfig;

/// The set of collaborators shared by every worker.
#[derive(Clone)]
pub struct Services {
    pub backup: Arc<dyn BackupService>,
    pub notifier: Arc<dyn Notifier>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

impl Services {
    pub fn from_config(config: &ServicesConfig) -> Self {
        let backup: Arc<dyn BackupService> = match &config.backup_dir {
            Some(dir) => Arc::new(ZipBackupService::new(dir.clone(), config.max_backups)),
            None => Arc::new(NoopBackup),
        };
        let notifier: Arc<dyn Notifier> = match &config.alert_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone(), config.alert_recipient.clone())),
            None => Arc::new(LogNotifier),
        };
        let broadcaster: Arc<dyn Broadcaster> = match &config.broadcast_url {
            Some(url) => Arc::new(HttpBroadcaster::new(url.clone())),
            None => Arc::new(NoopBroadcaster),
        };
        Self {
            backup,
            notifier,
            broadcaster,
        }
    }

    /// Everything disabled; used by `recover`/`status` and tests.
    pub fn disabled() -> Self {
        Self {
            backup: Arc::new(NoopBackup),
            notifier: Arc::new(LogNotifier),
            broadcaster: Arc::new(NoopBroadcaster),
        }
    }
}

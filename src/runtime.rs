use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::protocol;
use crate::storage::memory::MemoryStore;
use crate::storage::{AcceptAll, DeliverFilter};
use crate::utils::config::Config;

/// Shared server context: configuration, the mailbox store, the deliver
/// filter, and the shutdown signal fanned out to every session.
pub struct Runtime {
    pub config: Arc<Config>,
    pub store: Arc<MemoryStore>,
    pub filter: Arc<dyn DeliverFilter>,
    shutdown: watch::Sender<bool>,
}

impl Runtime {
    pub fn new(config: Arc<Config>) -> Self {
        let user = config.get_value("auth", "user").unwrap_or("demo").to_string();
        let password = config.get_value("auth", "password").unwrap_or("demopass").to_string();
        let quota = match config.get_int("auth", "max_messages", 0) {
            n if n > 0 => Some(n as u32),
            _ => None,
        };
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store: Arc::new(MemoryStore::new(user, password).with_quota(quota)),
            filter: Arc::new(AcceptAll),
            shutdown,
        }
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal every listener and session to wind down.
    pub fn begin_shutdown(&self) {
        info!("shutdown requested");
        let _ = self.shutdown.send(true);
    }

    pub async fn run(
        self: Arc<Self>,
        tasks: &mut Vec<tokio::task::JoinHandle<()>>,
    ) -> anyhow::Result<()> {
        if self.config.is_section_exists("imap") {
            let rt = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = protocol::imap::run_imap(rt).await {
                    tracing::error!("IMAP service stopped: {}", e);
                }
            }));
        } else {
            anyhow::bail!("config has no [imap] section; nothing to serve");
        }

        Ok(())
    }
}

//! Shared relay components built from configuration.

use broadmail_dispatcher::{BroadmailApi, Dispatcher, DispatcherConfig, SystemClock};
use delivery_queue_database::{AsyncDatabase, SqliteQueueStore};
use relay_config_and_utils::{Config, Paths};
use retry_scheduler::{
    EscalationNotifier, LogMailer, Mailer, OperatorContact, RetryScheduler, RetrySchedulerConfig,
    SpoolMailer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a command needs, wired once at startup.
pub struct RelayState {
    pub config: Config,
    pub paths: Paths,
    pub store: Arc<SqliteQueueStore>,
    pub dispatcher: Arc<Dispatcher>,
}

impl RelayState {
    /// Open the queue database and build the dispatcher.
    ///
    /// `database` overrides the default `<base>/queue.sqlite`.
    pub async fn open(
        config: Config,
        paths: Paths,
        database: Option<PathBuf>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        paths.ensure_dirs()?;

        let database = database.unwrap_or_else(|| paths.database_file());
        let store = Arc::new(SqliteQueueStore::new(AsyncDatabase::open(&database).await?));
        store.health_check().await?;
        info!(database = %store.path(), "Queue database opened");

        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig::from_config(&config),
            store.clone(),
            Arc::new(SystemClock),
        )?);

        debug!(config = ?config, "Relay state ready");

        Ok(Self {
            config,
            paths,
            store,
            dispatcher,
        })
    }

    /// Flush and close the queue database. Commands must not use the store
    /// afterwards.
    pub async fn close(&self) {
        match self.store.close().await {
            Ok(()) => debug!("Queue database closed"),
            Err(e) => warn!(error = %e, "Failed to close queue database"),
        }
    }

    pub fn api(&self) -> BroadmailApi {
        BroadmailApi::new(
            self.dispatcher.clone(),
            self.config.credential().map(str::to_string),
        )
    }

    /// Alerts are spooled for the local MTA when an operator address is set,
    /// otherwise only logged.
    pub fn scheduler(&self) -> RetryScheduler {
        let contact = OperatorContact::from_config(&self.config.operator);
        let mailer: Arc<dyn Mailer> = if contact.address.is_some() {
            Arc::new(SpoolMailer::new(
                self.paths.mail_spool_dir(),
                self.dispatcher.clock().clone(),
            ))
        } else {
            Arc::new(LogMailer)
        };

        RetryScheduler::new(
            self.dispatcher.clone(),
            EscalationNotifier::new(contact, mailer),
            RetrySchedulerConfig::from_config(&self.config),
        )
    }
}

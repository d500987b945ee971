pub mod config;
pub mod error;
pub mod model;
pub mod server;
pub mod storage;
pub mod store;
pub mod sync;

use std::sync::Arc;

pub use config::Settings;
pub use error::{Error, Result};
pub use model::{Draft, Payload, QueueStatus, Response, StoreStats, SyncOperation, SyncPayload, SyncQueueEntry};
pub use storage::Database;
pub use store::LocalStore;
pub use sync::monitor::{Connectivity, ConnectivityMonitor, QueueTrigger, SyncTrigger};
pub use sync::processor::Processor;
pub use sync::remote::{HttpEndpoint, RemoteEndpoint};
pub use sync::{NoopProgress, ProcessSummary, SyncProgress, SyncStatus, TriggerReason};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::SyncRun;

use storage::repository;

/// One client session: the local store, its settings, and the processor that
/// drains its queue. Build one per store file and pass it around.
pub struct FormSync {
    store: LocalStore,
    settings: Settings,
    processor: Arc<Processor>,
}

impl FormSync {
    /// Load settings from the database and run orphan recovery, so anything a
    /// crash left unqueued is back in line before the first sync.
    pub async fn open(db: Database) -> Result<Self> {
        let settings = Settings::load(&db).await?;
        Self::with_settings(db, settings).await
    }

    pub async fn with_settings(db: Database, settings: Settings) -> Result<Self> {
        let store = LocalStore::new(db);
        store.recover_orphans().await?;
        let processor = Arc::new(Processor::new(store.clone(), settings.max_retries));
        Ok(Self {
            store,
            settings,
            processor,
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn processor(&self) -> Arc<Processor> {
        self.processor.clone()
    }

    // ── Responses & Drafts ───────────────────────────────────────

    pub async fn save_response(&self, response: Response) -> Result<String> {
        self.store.save_response(response).await
    }

    pub async fn save_responses(&self, responses: Vec<Response>) -> Result<Vec<String>> {
        self.store.save_responses(responses).await
    }

    pub async fn save_draft(
        &self,
        session_id: &str,
        survey_id: Option<&str>,
        answers: Payload,
    ) -> Result<String> {
        self.store.save_draft(session_id, survey_id, answers).await
    }

    pub async fn get_draft(&self, session_id: &str) -> Result<Option<Draft>> {
        self.store.get_draft(session_id).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    // ── Sync ─────────────────────────────────────────────────────

    /// HTTP client for the configured endpoint.
    pub fn remote(&self) -> Result<HttpEndpoint> {
        let endpoint = self.settings.require_endpoint()?.clone();
        HttpEndpoint::new(endpoint, self.settings.request_timeout)
    }

    pub async fn process_queue(
        &self,
        remote: &dyn RemoteEndpoint,
        trigger: TriggerReason,
        progress: &dyn SyncProgress,
    ) -> Result<ProcessSummary> {
        self.processor.process_queue(remote, trigger, progress).await
    }

    /// One manual run against the configured endpoint.
    pub async fn sync_now(&self, progress: &dyn SyncProgress) -> Result<ProcessSummary> {
        let remote = self.remote()?;
        self.process_queue(&remote, TriggerReason::Manual, progress)
            .await
    }

    /// A monitor wired to this session's processor, with the configured
    /// interval and backoff cap.
    pub fn monitor(
        &self,
        remote: Arc<dyn RemoteEndpoint>,
        progress: Arc<dyn SyncProgress>,
    ) -> ConnectivityMonitor {
        let trigger = QueueTrigger::new(self.processor.clone(), remote, progress);
        ConnectivityMonitor::new(Arc::new(trigger))
            .with_interval(self.settings.sync_interval, self.settings.max_backoff)
    }

    // ── Config ───────────────────────────────────────────────────

    /// Validate and persist a setting. Takes effect for the next session.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        config::validate(key, value)?;
        let key = key.to_string();
        let value = value.trim().to_string();
        self.store
            .db()
            .writer()
            .call(move |conn| repository::set_config(conn, &key, &value))
            .await?;
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        Ok(self
            .store
            .db()
            .reader()
            .call(move |conn| repository::get_config(conn, &key))
            .await?)
    }

    pub async fn unset_config(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        Ok(self
            .store
            .db()
            .writer()
            .call(move |conn| repository::unset_config(conn, &key))
            .await?)
    }

    pub async fn list_config(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .store
            .db()
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?)
    }
}

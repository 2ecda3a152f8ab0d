use crate::config::Config;
use crate::db_types::Practice;
use crate::records::RecordsClient;
use crate::store::Store;
use crate::tasks::SyncQueue;
use crate::tools::ToolContext;
use crate::voice::VoiceClient;

use std::sync::Arc;

/// Shared state handed to every handler and to the sync worker.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub records: RecordsClient,
    pub voice: VoiceClient,
    // jobs for the background sync worker
    pub sync: SyncQueue,
}

impl AppState {
    /// The tenant-scoped context the assistant's tools run in.
    pub fn tool_context<'a>(
        &'a self,
        practice: &'a Practice,
        call_id: Option<&'a str>,
        caller_phone: Option<&'a str>,
    ) -> ToolContext<'a> {
        ToolContext {
            store: self.store.as_ref(),
            records: &self.records,
            practice,
            call_id,
            caller_phone,
        }
    }
}

#[cfg(test)]
impl AppState {
    pub fn for_tests(
        store: Arc<dyn Store>,
        records_api_base: &str,
        voice_api_base: &str,
    ) -> (Arc<Self>, tokio::sync::mpsc::Receiver<crate::tasks::SyncJob>) {
        let config = Config::for_tests(records_api_base, voice_api_base);
        let http = reqwest::Client::new();
        let records = RecordsClient::new(http.clone(), &config);
        let voice = VoiceClient::new(http, &config);
        let (sync, rx) = SyncQueue::new(config.sync_queue_capacity);
        let app_state = Arc::new(Self {
            config,
            store,
            records,
            voice,
            sync,
        });
        (app_state, rx)
    }
}

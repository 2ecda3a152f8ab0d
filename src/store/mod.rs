//! Persistence for practices, service mappings and call logs.
//!
//! Request handlers, the reconciler and the sync worker only ever talk to [`Store`], so the
//! Postgres backend can be swapped for the in-memory one in tests.

#[cfg(test)]
pub mod memory;
pub mod postgres;

use crate::db_types::{
    CallLog, CallLogFilter, NewServiceMapping, Page, Practice, PracticeInput, ServiceMapping,
};
use crate::error::AppError;

use async_trait::async_trait;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, AppError>;

#[async_trait]
pub trait Store: Send + Sync {
    // practices (tenant directory)

    async fn list_practices(&self) -> StoreResult<Vec<Practice>>;
    async fn get_practice(&self, id: Uuid) -> StoreResult<Option<Practice>>;
    async fn find_practice_by_subdomain(&self, subdomain: &str) -> StoreResult<Option<Practice>>;
    async fn find_practice_by_assistant_id(
        &self,
        assistant_id: &str,
    ) -> StoreResult<Option<Practice>>;
    /// Fails with [`AppError::Conflict`] when the subdomain or assistant id is taken.
    async fn insert_practice(&self, input: PracticeInput) -> StoreResult<Practice>;
    async fn update_practice(&self, id: Uuid, input: PracticeInput)
        -> StoreResult<Option<Practice>>;
    async fn set_voice_assistant_id(&self, id: Uuid, assistant_id: &str) -> StoreResult<()>;
    async fn delete_practice(&self, id: Uuid) -> StoreResult<bool>;

    // service mappings

    async fn list_service_mappings(&self, practice_id: Uuid) -> StoreResult<Vec<ServiceMapping>>;
    /// Case-insensitive match on the trimmed spoken name.
    async fn find_service_mapping(
        &self,
        practice_id: Uuid,
        spoken_name: &str,
    ) -> StoreResult<Option<ServiceMapping>>;
    async fn insert_service_mapping(
        &self,
        practice_id: Uuid,
        mapping: NewServiceMapping,
    ) -> StoreResult<ServiceMapping>;
    async fn delete_service_mapping(&self, practice_id: Uuid, mapping_id: Uuid)
        -> StoreResult<bool>;

    // call logs (interaction store)

    async fn get_call_log(&self, practice_id: Uuid, id: Uuid) -> StoreResult<Option<CallLog>>;
    async fn find_call_log_by_call_id(&self, external_call_id: &str)
        -> StoreResult<Option<CallLog>>;
    /// Always scoped by practice: appointment ids are only unique within one records subdomain.
    async fn find_call_log_by_appointment(
        &self,
        practice_id: Uuid,
        appointment_id: i64,
    ) -> StoreResult<Option<CallLog>>;
    /// Upsert keyed by external call id. A row owned by another practice is never overwritten;
    /// that case yields [`AppError::Conflict`]. The stored status only moves forward, and
    /// start/end times and caller number already recorded are not cleared by a stale write.
    async fn save_call_log(&self, log: &CallLog) -> StoreResult<CallLog>;
    /// Newest first, with the total number of matching rows.
    async fn list_call_logs(
        &self,
        practice_id: Uuid,
        filter: &CallLogFilter,
        page: Page,
    ) -> StoreResult<(Vec<CallLog>, i64)>;
}

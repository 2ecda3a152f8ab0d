use super::{Store, StoreResult};
use crate::db_types::{
    CallLog, CallLogFilter, CallStatus, NewServiceMapping, Page, Practice, PracticeInput,
    ServiceMapping,
};
use crate::error::AppError;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    practices: HashMap<Uuid, Practice>,
    mappings: HashMap<Uuid, ServiceMapping>,
    // external call id => call log
    call_logs: HashMap<String, CallLog>,
}

impl Tables {
    fn check_practice_unique(&self, candidate: &Practice) -> StoreResult<()> {
        for other in self.practices.values().filter(|p| p.id != candidate.id) {
            if other.records_subdomain == candidate.records_subdomain {
                return Err(AppError::Conflict(format!(
                    "subdomain {} already configured",
                    candidate.records_subdomain
                )));
            }
            if candidate.voice_assistant_id.is_some()
                && other.voice_assistant_id == candidate.voice_assistant_id
            {
                return Err(AppError::Conflict("assistant already assigned".to_string()));
            }
        }
        Ok(())
    }
}

/// In-process [`Store`] with the same uniqueness rules as the Postgres schema.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    failing_saves: AtomicBool,
    stale_lookups: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later `save_call_log` fails as if the database were down.
    pub fn fail_call_log_saves(&self) {
        self.failing_saves.store(true, Ordering::SeqCst);
    }

    /// Lookups by call id miss, as if another writer committed right after the read.
    pub fn serve_stale_call_lookups(&self) {
        self.stale_lookups.store(true, Ordering::SeqCst);
    }

    pub async fn call_log_count(&self) -> usize {
        self.tables.read().await.call_logs.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_practices(&self) -> StoreResult<Vec<Practice>> {
        let tables = self.tables.read().await;
        let mut practices: Vec<Practice> = tables.practices.values().cloned().collect();
        practices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(practices)
    }

    async fn get_practice(&self, id: Uuid) -> StoreResult<Option<Practice>> {
        Ok(self.tables.read().await.practices.get(&id).cloned())
    }

    async fn find_practice_by_subdomain(&self, subdomain: &str) -> StoreResult<Option<Practice>> {
        let tables = self.tables.read().await;
        Ok(tables
            .practices
            .values()
            .find(|p| p.records_subdomain == subdomain)
            .cloned())
    }

    async fn find_practice_by_assistant_id(
        &self,
        assistant_id: &str,
    ) -> StoreResult<Option<Practice>> {
        let tables = self.tables.read().await;
        Ok(tables
            .practices
            .values()
            .find(|p| p.voice_assistant_id.as_deref() == Some(assistant_id))
            .cloned())
    }

    async fn insert_practice(&self, input: PracticeInput) -> StoreResult<Practice> {
        let mut tables = self.tables.write().await;
        let practice = Practice::from_input(input, OffsetDateTime::now_utc());
        tables.check_practice_unique(&practice)?;
        tables.practices.insert(practice.id, practice.clone());
        Ok(practice)
    }

    async fn update_practice(
        &self,
        id: Uuid,
        input: PracticeInput,
    ) -> StoreResult<Option<Practice>> {
        let mut tables = self.tables.write().await;
        let Some(mut practice) = tables.practices.get(&id).cloned() else {
            return Ok(None);
        };
        practice.apply(input, OffsetDateTime::now_utc());
        tables.check_practice_unique(&practice)?;
        tables.practices.insert(id, practice.clone());
        Ok(Some(practice))
    }

    async fn set_voice_assistant_id(&self, id: Uuid, assistant_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let Some(mut practice) = tables.practices.get(&id).cloned() else {
            return Ok(());
        };
        practice.voice_assistant_id = Some(assistant_id.to_string());
        tables.check_practice_unique(&practice)?;
        tables.practices.insert(id, practice);
        Ok(())
    }

    async fn delete_practice(&self, id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let removed = tables.practices.remove(&id).is_some();
        tables.mappings.retain(|_, m| m.practice_id != id);
        tables.call_logs.retain(|_, c| c.practice_id != id);
        Ok(removed)
    }

    async fn list_service_mappings(&self, practice_id: Uuid) -> StoreResult<Vec<ServiceMapping>> {
        let tables = self.tables.read().await;
        let mut mappings: Vec<ServiceMapping> = tables
            .mappings
            .values()
            .filter(|m| m.practice_id == practice_id)
            .cloned()
            .collect();
        mappings.sort_by(|a, b| a.spoken_name.cmp(&b.spoken_name));
        Ok(mappings)
    }

    async fn find_service_mapping(
        &self,
        practice_id: Uuid,
        spoken_name: &str,
    ) -> StoreResult<Option<ServiceMapping>> {
        let wanted = spoken_name.trim().to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables
            .mappings
            .values()
            .find(|m| m.practice_id == practice_id && m.spoken_name.to_lowercase() == wanted)
            .cloned())
    }

    async fn insert_service_mapping(
        &self,
        practice_id: Uuid,
        mapping: NewServiceMapping,
    ) -> StoreResult<ServiceMapping> {
        let mut tables = self.tables.write().await;
        let spoken_name = mapping.spoken_name.trim().to_string();
        let taken = tables.mappings.values().any(|m| {
            m.practice_id == practice_id && m.spoken_name.to_lowercase() == spoken_name.to_lowercase()
        });
        if taken {
            return Err(AppError::Conflict(format!(
                "service {spoken_name} already mapped"
            )));
        }
        let mapping = ServiceMapping {
            id: Uuid::new_v4(),
            practice_id,
            spoken_name,
            appointment_type_id: mapping.appointment_type_id,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.mappings.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    async fn delete_service_mapping(
        &self,
        practice_id: Uuid,
        mapping_id: Uuid,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let owned = tables
            .mappings
            .get(&mapping_id)
            .map(|m| m.practice_id == practice_id)
            .unwrap_or(false);
        if owned {
            tables.mappings.remove(&mapping_id);
        }
        Ok(owned)
    }

    async fn get_call_log(&self, practice_id: Uuid, id: Uuid) -> StoreResult<Option<CallLog>> {
        let tables = self.tables.read().await;
        Ok(tables
            .call_logs
            .values()
            .find(|c| c.id == id && c.practice_id == practice_id)
            .cloned())
    }

    async fn find_call_log_by_call_id(
        &self,
        external_call_id: &str,
    ) -> StoreResult<Option<CallLog>> {
        if self.stale_lookups.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self
            .tables
            .read()
            .await
            .call_logs
            .get(external_call_id)
            .cloned())
    }

    async fn find_call_log_by_appointment(
        &self,
        practice_id: Uuid,
        appointment_id: i64,
    ) -> StoreResult<Option<CallLog>> {
        let tables = self.tables.read().await;
        Ok(tables
            .call_logs
            .values()
            .filter(|c| {
                c.practice_id == practice_id && c.external_appointment_id() == Some(appointment_id)
            })
            .max_by_key(|c| c.updated_at)
            .cloned())
    }

    async fn save_call_log(&self, log: &CallLog) -> StoreResult<CallLog> {
        if self.failing_saves.load(Ordering::SeqCst) {
            return Err(AppError::Internal("call log store unavailable".to_string()));
        }
        let mut tables = self.tables.write().await;
        let saved = match tables.call_logs.get(&log.external_call_id) {
            Some(existing) if existing.practice_id != log.practice_id => {
                return Err(AppError::Conflict(format!(
                    "call {} belongs to another practice",
                    log.external_call_id
                )));
            }
            // merged the way the `on conflict do update` in the Postgres store merges
            Some(existing) => CallLog {
                id: existing.id,
                status: existing.status.advance(log.status),
                started_at: existing.started_at.or(log.started_at),
                ended_at: log.ended_at.or(existing.ended_at),
                caller_phone: existing.caller_phone.clone().or_else(|| log.caller_phone.clone()),
                created_at: existing.created_at,
                ..log.clone()
            },
            None => log.clone(),
        };
        tables
            .call_logs
            .insert(saved.external_call_id.clone(), saved.clone());
        Ok(saved)
    }

    async fn list_call_logs(
        &self,
        practice_id: Uuid,
        filter: &CallLogFilter,
        page: Page,
    ) -> StoreResult<(Vec<CallLog>, i64)> {
        let tables = self.tables.read().await;
        let mut matching: Vec<&CallLog> = tables
            .call_logs
            .values()
            .filter(|c| c.practice_id == practice_id)
            .filter(|c| filter.patient_id.is_none() || c.patient_id() == filter.patient_id)
            .filter(|c| !filter.booked_only || c.appointment.is_some())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as i64;
        let page_rows = matching
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok((page_rows, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(subdomain: &str, assistant: Option<&str>) -> PracticeInput {
        PracticeInput {
            name: format!("Practice {subdomain}"),
            records_subdomain: subdomain.to_string(),
            records_location_id: 1,
            provider_ids: vec![10],
            default_operatory_id: Some(5),
            voice_assistant_id: assistant.map(str::to_string),
            timezone: "America/New_York".to_string(),
            greeting: None,
        }
    }

    #[tokio::test]
    async fn subdomains_and_assistants_are_unique() {
        let store = MemoryStore::new();
        store.insert_practice(input("alpha", Some("asst-1"))).await.unwrap();
        assert!(matches!(
            store.insert_practice(input("alpha", None)).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            store.insert_practice(input("beta", Some("asst-1"))).await,
            Err(AppError::Conflict(_))
        ));
        assert!(store.insert_practice(input("beta", None)).await.is_ok());
    }

    #[tokio::test]
    async fn call_log_upsert_keeps_identity_and_refuses_foreign_tenants() {
        let store = MemoryStore::new();
        let a = store.insert_practice(input("alpha", None)).await.unwrap();
        let b = store.insert_practice(input("beta", None)).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let first = store.save_call_log(&CallLog::new(a.id, "call_1", now)).await.unwrap();
        let second = store.save_call_log(&CallLog::new(a.id, "call_1", now)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.call_log_count().await, 1);

        let foreign = store.save_call_log(&CallLog::new(b.id, "call_1", now)).await;
        assert!(matches!(foreign, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn stale_write_does_not_regress_call() {
        let store = MemoryStore::new();
        let a = store.insert_practice(input("alpha", None)).await.unwrap();
        let now = OffsetDateTime::now_utc();
        let read_early = CallLog::new(a.id, "call_1", now);

        // two deliveries read the same row; the end-of-call write lands first
        let mut ended = read_early.clone();
        ended.advance_status(CallStatus::Ended);
        ended.ended_at = Some(now);
        ended.caller_phone = Some("+15550001111".to_string());
        store.save_call_log(&ended).await.unwrap();

        let mut in_progress = read_early;
        in_progress.advance_status(CallStatus::InProgress);
        let saved = store.save_call_log(&in_progress).await.unwrap();
        assert_eq!(saved.status, CallStatus::Ended);
        assert_eq!(saved.ended_at, Some(now));
        assert_eq!(saved.caller_phone.as_deref(), Some("+15550001111"));
    }

    #[tokio::test]
    async fn service_mapping_lookup_ignores_case() {
        let store = MemoryStore::new();
        let p = store.insert_practice(input("alpha", None)).await.unwrap();
        store
            .insert_service_mapping(
                p.id,
                NewServiceMapping {
                    spoken_name: "Cleaning".into(),
                    appointment_type_id: 3,
                },
            )
            .await
            .unwrap();
        let found = store.find_service_mapping(p.id, "  cleaning ").await.unwrap();
        assert_eq!(found.map(|m| m.appointment_type_id), Some(3));
        let dup = store
            .insert_service_mapping(
                p.id,
                NewServiceMapping {
                    spoken_name: "CLEANING".into(),
                    appointment_type_id: 4,
                },
            )
            .await;
        assert!(matches!(dup, Err(AppError::Conflict(_))));
    }
}

use super::{Store, StoreResult};
use crate::db_types::{
    BookedAppointment, CallLog, CallLogFilter, NewServiceMapping, Page, Practice, PracticeInput,
    ServiceMapping,
};
use crate::error::AppError;

use async_trait::async_trait;
use sqlx::{types::time::OffsetDateTime, FromRow, Pool, Postgres};
use tracing::warn;
use uuid::Uuid;

pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct CallLogRow {
    id: Uuid,
    practice_id: Uuid,
    external_call_id: String,
    status: String,
    started_at: Option<OffsetDateTime>,
    ended_at: Option<OffsetDateTime>,
    caller_phone: Option<String>,
    transcript: Option<String>,
    summary: Option<String>,
    recording_url: Option<String>,
    ended_reason: Option<String>,
    external_appointment_id: Option<i64>,
    patient_id: Option<i64>,
    provider_id: Option<i64>,
    operatory_id: Option<i64>,
    appointment_type_id: Option<i64>,
    appointment_start: Option<OffsetDateTime>,
    appointment_end: Option<OffsetDateTime>,
    appointment_note: Option<String>,
    sync_message: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CallLogRow> for CallLog {
    type Error = AppError;

    fn try_from(row: CallLogRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(AppError::Internal)?;
        let appointment = match row.external_appointment_id {
            Some(external_appointment_id) => Some(BookedAppointment {
                external_appointment_id,
                patient_id: row.patient_id.unwrap_or_default(),
                provider_id: row.provider_id.unwrap_or_default(),
                operatory_id: row.operatory_id,
                appointment_type_id: row.appointment_type_id.unwrap_or_default(),
                start: row.appointment_start,
                end: row.appointment_end,
                note: row.appointment_note,
            }),
            None => None,
        };
        Ok(CallLog {
            id: row.id,
            practice_id: row.practice_id,
            external_call_id: row.external_call_id,
            status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            caller_phone: row.caller_phone,
            transcript: row.transcript,
            summary: row.summary,
            recording_url: row.recording_url,
            ended_reason: row.ended_reason,
            appointment,
            sync_message: row.sync_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_call_logs(rows: Vec<CallLogRow>) -> StoreResult<Vec<CallLog>> {
    rows.into_iter().map(CallLog::try_from).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn list_practices(&self) -> StoreResult<Vec<Practice>> {
        let practices = sqlx::query_as::<_, Practice>(
            "
            select *
            from practices
            order by name
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(practices)
    }

    async fn get_practice(&self, id: Uuid) -> StoreResult<Option<Practice>> {
        let practice = sqlx::query_as::<_, Practice>(
            "
            select *
            from practices
            where id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(practice)
    }

    async fn find_practice_by_subdomain(&self, subdomain: &str) -> StoreResult<Option<Practice>> {
        let practice = sqlx::query_as::<_, Practice>(
            "
            select *
            from practices
            where records_subdomain = $1
            ",
        )
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(practice)
    }

    async fn find_practice_by_assistant_id(
        &self,
        assistant_id: &str,
    ) -> StoreResult<Option<Practice>> {
        let practice = sqlx::query_as::<_, Practice>(
            "
            select *
            from practices
            where voice_assistant_id = $1
            ",
        )
        .bind(assistant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(practice)
    }

    async fn insert_practice(&self, input: PracticeInput) -> StoreResult<Practice> {
        let practice = Practice::from_input(input, OffsetDateTime::now_utc());
        let practice = sqlx::query_as::<_, Practice>(
            "
            insert into practices (
              id,
              name,
              records_subdomain,
              records_location_id,
              provider_ids,
              default_operatory_id,
              voice_assistant_id,
              timezone,
              greeting,
              created_at,
              updated_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
            )
            returning *
            ",
        )
        .bind(practice.id)
        .bind(&practice.name)
        .bind(&practice.records_subdomain)
        .bind(practice.records_location_id)
        .bind(&practice.provider_ids)
        .bind(practice.default_operatory_id)
        .bind(&practice.voice_assistant_id)
        .bind(&practice.timezone)
        .bind(&practice.greeting)
        .bind(practice.created_at)
        .bind(practice.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(practice)
    }

    async fn update_practice(
        &self,
        id: Uuid,
        input: PracticeInput,
    ) -> StoreResult<Option<Practice>> {
        let Some(mut practice) = self.get_practice(id).await? else {
            return Ok(None);
        };
        practice.apply(input, OffsetDateTime::now_utc());
        let practice = sqlx::query_as::<_, Practice>(
            "
            update practices set
              name = $2,
              records_subdomain = $3,
              records_location_id = $4,
              provider_ids = $5,
              default_operatory_id = $6,
              voice_assistant_id = $7,
              timezone = $8,
              greeting = $9,
              updated_at = $10
            where id = $1
            returning *
            ",
        )
        .bind(practice.id)
        .bind(&practice.name)
        .bind(&practice.records_subdomain)
        .bind(practice.records_location_id)
        .bind(&practice.provider_ids)
        .bind(practice.default_operatory_id)
        .bind(&practice.voice_assistant_id)
        .bind(&practice.timezone)
        .bind(&practice.greeting)
        .bind(practice.updated_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(practice)
    }

    async fn set_voice_assistant_id(&self, id: Uuid, assistant_id: &str) -> StoreResult<()> {
        sqlx::query(
            "
            update practices
            set voice_assistant_id = $2, updated_at = now()
            where id = $1
            ",
        )
        .bind(id)
        .bind(assistant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_practice(&self, id: Uuid) -> StoreResult<bool> {
        let res = sqlx::query("delete from practices where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_service_mappings(&self, practice_id: Uuid) -> StoreResult<Vec<ServiceMapping>> {
        let mappings = sqlx::query_as::<_, ServiceMapping>(
            "
            select *
            from service_mappings
            where practice_id = $1
            order by spoken_name
            ",
        )
        .bind(practice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(mappings)
    }

    async fn find_service_mapping(
        &self,
        practice_id: Uuid,
        spoken_name: &str,
    ) -> StoreResult<Option<ServiceMapping>> {
        let mapping = sqlx::query_as::<_, ServiceMapping>(
            "
            select *
            from service_mappings
            where practice_id = $1 and lower(spoken_name) = lower($2)
            ",
        )
        .bind(practice_id)
        .bind(spoken_name.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(mapping)
    }

    async fn insert_service_mapping(
        &self,
        practice_id: Uuid,
        mapping: NewServiceMapping,
    ) -> StoreResult<ServiceMapping> {
        let mapping = sqlx::query_as::<_, ServiceMapping>(
            "
            insert into service_mappings (
              id,
              practice_id,
              spoken_name,
              appointment_type_id,
              created_at
            ) values (
              $1, $2, $3, $4, $5
            )
            returning *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(practice_id)
        .bind(mapping.spoken_name.trim())
        .bind(mapping.appointment_type_id)
        .bind(OffsetDateTime::now_utc())
        .fetch_one(&self.pool)
        .await?;
        Ok(mapping)
    }

    async fn delete_service_mapping(
        &self,
        practice_id: Uuid,
        mapping_id: Uuid,
    ) -> StoreResult<bool> {
        let res = sqlx::query("delete from service_mappings where id = $1 and practice_id = $2")
            .bind(mapping_id)
            .bind(practice_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn get_call_log(&self, practice_id: Uuid, id: Uuid) -> StoreResult<Option<CallLog>> {
        sqlx::query_as::<_, CallLogRow>(
            "
            select *
            from call_logs
            where id = $1 and practice_id = $2
            ",
        )
        .bind(id)
        .bind(practice_id)
        .fetch_optional(&self.pool)
        .await?
        .map(CallLog::try_from)
        .transpose()
    }

    async fn find_call_log_by_call_id(
        &self,
        external_call_id: &str,
    ) -> StoreResult<Option<CallLog>> {
        sqlx::query_as::<_, CallLogRow>(
            "
            select *
            from call_logs
            where external_call_id = $1
            ",
        )
        .bind(external_call_id)
        .fetch_optional(&self.pool)
        .await?
        .map(CallLog::try_from)
        .transpose()
    }

    async fn find_call_log_by_appointment(
        &self,
        practice_id: Uuid,
        appointment_id: i64,
    ) -> StoreResult<Option<CallLog>> {
        sqlx::query_as::<_, CallLogRow>(
            "
            select *
            from call_logs
            where practice_id = $1 and external_appointment_id = $2
            order by updated_at desc
            limit 1
            ",
        )
        .bind(practice_id)
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?
        .map(CallLog::try_from)
        .transpose()
    }

    async fn save_call_log(&self, log: &CallLog) -> StoreResult<CallLog> {
        let appt = log.appointment.as_ref();
        let row = sqlx::query_as::<_, CallLogRow>(
            "
            insert into call_logs (
              id,
              practice_id,
              external_call_id,
              status,
              started_at,
              ended_at,
              caller_phone,
              transcript,
              summary,
              recording_url,
              ended_reason,
              external_appointment_id,
              patient_id,
              provider_id,
              operatory_id,
              appointment_type_id,
              appointment_start,
              appointment_end,
              appointment_note,
              sync_message,
              created_at,
              updated_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
              $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22
            )
            on conflict (external_call_id) do update set
              status = call_status_advance(call_logs.status, excluded.status),
              started_at = coalesce(call_logs.started_at, excluded.started_at),
              ended_at = coalesce(excluded.ended_at, call_logs.ended_at),
              caller_phone = coalesce(call_logs.caller_phone, excluded.caller_phone),
              transcript = excluded.transcript,
              summary = excluded.summary,
              recording_url = excluded.recording_url,
              ended_reason = excluded.ended_reason,
              external_appointment_id = excluded.external_appointment_id,
              patient_id = excluded.patient_id,
              provider_id = excluded.provider_id,
              operatory_id = excluded.operatory_id,
              appointment_type_id = excluded.appointment_type_id,
              appointment_start = excluded.appointment_start,
              appointment_end = excluded.appointment_end,
              appointment_note = excluded.appointment_note,
              sync_message = excluded.sync_message,
              updated_at = excluded.updated_at
            where call_logs.practice_id = excluded.practice_id
            returning *
            ",
        )
        .bind(log.id)
        .bind(log.practice_id)
        .bind(&log.external_call_id)
        .bind(log.status.as_str())
        .bind(log.started_at)
        .bind(log.ended_at)
        .bind(&log.caller_phone)
        .bind(&log.transcript)
        .bind(&log.summary)
        .bind(&log.recording_url)
        .bind(&log.ended_reason)
        .bind(appt.map(|a| a.external_appointment_id))
        .bind(appt.map(|a| a.patient_id))
        .bind(appt.map(|a| a.provider_id))
        .bind(appt.and_then(|a| a.operatory_id))
        .bind(appt.map(|a| a.appointment_type_id))
        .bind(appt.and_then(|a| a.start))
        .bind(appt.and_then(|a| a.end))
        .bind(appt.and_then(|a| a.note.clone()))
        .bind(&log.sync_message)
        .bind(log.created_at)
        .bind(log.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                warn!(call_id = %log.external_call_id, practice = %log.practice_id, "call id already owned by another practice");
                Err(AppError::Conflict(format!(
                    "call {} belongs to another practice",
                    log.external_call_id
                )))
            }
        }
    }

    async fn list_call_logs(
        &self,
        practice_id: Uuid,
        filter: &CallLogFilter,
        page: Page,
    ) -> StoreResult<(Vec<CallLog>, i64)> {
        let rows = sqlx::query_as::<_, CallLogRow>(
            "
            select *
            from call_logs
            where practice_id = $1
              and ($2::bigint is null or patient_id = $2)
              and (not $3 or external_appointment_id is not null)
            order by created_at desc
            limit $4 offset $5
            ",
        )
        .bind(practice_id)
        .bind(filter.patient_id)
        .bind(filter.booked_only)
        .bind(i64::from(page.limit))
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            "
            select count(*)
            from call_logs
            where practice_id = $1
              and ($2::bigint is null or patient_id = $2)
              and (not $3 or external_appointment_id is not null)
            ",
        )
        .bind(practice_id)
        .bind(filter.patient_id)
        .bind(filter.booked_only)
        .fetch_one(&self.pool)
        .await?;

        Ok((into_call_logs(rows)?, total))
    }
}

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use shared_config::AppConfig;
use shared_database::supabase::{prefer_headers, SupabaseClient, PREFER_REPRESENTATION};

use crate::error::ScheduleError;
use crate::models::{
    BlockedSlot, DoctorBranch, DoctorLeave, NewBlockedSlot, NewDoctorLeave, NewReleaseRule,
    NewSlot, NewWeeklySchedule, Slot, SlotPurge, SlotReleaseRule, SlotStatus, WeeklySchedule,
};

use super::{ScheduleStore, StoreResult};

const SLOT_NATURAL_KEY: &str = "doctor_branch_id,slot_date,start_time,end_time";

/// PostgREST-backed store. All calls use the service key; tenancy is
/// enforced by the API layer.
pub struct SupabaseScheduleStore {
    supabase: SupabaseClient,
}

impl SupabaseScheduleStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
        }
    }

    async fn select<T: DeserializeOwned>(&self, path: &str) -> StoreResult<Vec<T>> {
        Ok(self.supabase.request(Method::GET, path, None, None).await?)
    }

    async fn select_one<T: DeserializeOwned>(&self, path: &str) -> StoreResult<Option<T>> {
        let mut rows: Vec<T> = self.select(path).await?;
        Ok(if rows.is_empty() { None } else { Some(rows.swap_remove(0)) })
    }

    async fn write<T: DeserializeOwned>(&self, method: Method, path: &str, body: Value) -> StoreResult<Vec<T>> {
        Ok(self
            .supabase
            .request_with_headers(
                method,
                path,
                None,
                Some(body),
                Some(prefer_headers(&[PREFER_REPRESENTATION])),
            )
            .await?)
    }

    async fn write_one<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Value,
        what: String,
    ) -> StoreResult<T> {
        let mut rows: Vec<T> = self.write(method, path, body).await?;
        if rows.is_empty() {
            return Err(ScheduleError::NotFound(what));
        }
        Ok(rows.swap_remove(0))
    }

    async fn delete_rows(&self, path: &str) -> StoreResult<usize> {
        let rows: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::DELETE,
                path,
                None,
                None,
                Some(prefer_headers(&[PREFER_REPRESENTATION])),
            )
            .await?;
        Ok(rows.len())
    }
}

fn encode_date(date: NaiveDate) -> String {
    urlencoding::encode(&date.format("%Y-%m-%d").to_string()).into_owned()
}

fn encode_timestamp(at: NaiveDateTime) -> String {
    urlencoding::encode(&at.format("%Y-%m-%dT%H:%M:%S").to_string()).into_owned()
}

fn encode_time(time: chrono::NaiveTime) -> String {
    urlencoding::encode(&time.format("%H:%M:%S").to_string()).into_owned()
}

fn in_list<T: ToString>(values: &[T]) -> String {
    let joined = values.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
    format!("in.({})", joined)
}

fn purge_filter(doctor_branch_id: i64, purge: &SlotPurge) -> String {
    let mut filter = format!("doctor_branch_id=eq.{}&booked_count=eq.0", doctor_branch_id);
    if let Some(from) = purge.from {
        filter.push_str(&format!("&slot_date=gte.{}", encode_date(from)));
    }
    if let Some(to) = purge.to {
        filter.push_str(&format!("&slot_date=lt.{}", encode_date(to)));
    }
    if let Some(ids) = &purge.time_range_ids {
        filter.push_str(&format!("&time_range_id={}", in_list(ids)));
    }
    if let Some(window) = purge.window {
        filter.push_str(&format!(
            "&start_time=lt.{}&end_time=gt.{}",
            encode_time(window.end_time),
            encode_time(window.start_time)
        ));
    }
    if let Some(statuses) = &purge.statuses {
        let names: Vec<&str> = statuses.iter().map(SlotStatus::as_str).collect();
        filter.push_str(&format!("&status={}", in_list(&names)));
    }
    filter
}

fn rule_body(rule: &NewReleaseRule) -> Value {
    json!({
        "doctor_branch_id": rule.doctor_branch_id,
        "scope": rule.scope,
        "weekday": rule.weekday,
        "time_range_id": rule.time_range_id,
        "release_days_before": rule.release_days_before,
        "release_time": rule.release_time,
        "release_minutes_before_slot": rule.release_minutes_before_slot,
        "is_active": rule.is_active,
        "updated_at": chrono::Utc::now(),
    })
}

#[async_trait]
impl ScheduleStore for SupabaseScheduleStore {
    async fn get_doctor_branch(&self, id: i64) -> StoreResult<Option<DoctorBranch>> {
        self.select_one(&format!("/rest/v1/doctor_branches?id=eq.{}", id)).await
    }

    async fn list_doctor_branches_for_doctor(&self, doctor_id: i64) -> StoreResult<Vec<DoctorBranch>> {
        self.select(&format!("/rest/v1/doctor_branches?doctor_id=eq.{}&order=id.asc", doctor_id))
            .await
    }

    async fn list_weekly_schedules(&self, doctor_branch_id: i64) -> StoreResult<Vec<WeeklySchedule>> {
        self.select(&format!(
            "/rest/v1/weekly_schedules?select=*,time_ranges(*)&doctor_branch_id=eq.{}&order=weekday.asc",
            doctor_branch_id
        ))
        .await
    }

    async fn get_weekly_schedule(&self, id: i64) -> StoreResult<Option<WeeklySchedule>> {
        self.select_one(&format!("/rest/v1/weekly_schedules?select=*,time_ranges(*)&id=eq.{}", id))
            .await
    }

    async fn replace_weekly_schedules(
        &self,
        doctor_branch_id: i64,
        schedules: &[NewWeeklySchedule],
    ) -> StoreResult<Vec<WeeklySchedule>> {
        debug!(
            "Replacing weekly schedule of doctor-branch {} ({} weekdays)",
            doctor_branch_id,
            schedules.len()
        );

        // Delete and insert run inside one database function so readers never see a half-written week.
        let _: Value = self
            .supabase
            .request(
                Method::POST,
                "/rest/v1/rpc/replace_weekly_schedule",
                None,
                Some(json!({
                    "p_doctor_branch_id": doctor_branch_id,
                    "p_schedules": serde_json::to_value(schedules)?,
                })),
            )
            .await?;

        self.list_weekly_schedules(doctor_branch_id).await
    }

    async fn delete_weekly_schedule(&self, id: i64) -> StoreResult<bool> {
        Ok(self.delete_rows(&format!("/rest/v1/weekly_schedules?id=eq.{}", id)).await? > 0)
    }

    async fn list_release_rules(&self, doctor_branch_id: i64) -> StoreResult<Vec<SlotReleaseRule>> {
        self.select(&format!(
            "/rest/v1/slot_release_rules?doctor_branch_id=eq.{}&order=id.asc",
            doctor_branch_id
        ))
        .await
    }

    async fn get_release_rule(&self, id: i64) -> StoreResult<Option<SlotReleaseRule>> {
        self.select_one(&format!("/rest/v1/slot_release_rules?id=eq.{}", id)).await
    }

    async fn insert_release_rule(&self, rule: &NewReleaseRule) -> StoreResult<SlotReleaseRule> {
        self.write_one(
            Method::POST,
            "/rest/v1/slot_release_rules",
            rule_body(rule),
            "Created release rule".to_string(),
        )
        .await
    }

    async fn update_release_rule(&self, id: i64, rule: &NewReleaseRule) -> StoreResult<SlotReleaseRule> {
        self.write_one(
            Method::PATCH,
            &format!("/rest/v1/slot_release_rules?id=eq.{}", id),
            rule_body(rule),
            format!("Release rule {}", id),
        )
        .await
    }

    async fn delete_release_rule(&self, id: i64) -> StoreResult<bool> {
        Ok(self.delete_rows(&format!("/rest/v1/slot_release_rules?id=eq.{}", id)).await? > 0)
    }

    async fn list_blocked_slots(
        &self,
        doctor_id: i64,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> StoreResult<Vec<BlockedSlot>> {
        let mut path = format!("/rest/v1/blocked_slots?doctor_id=eq.{}", doctor_id);
        if let Some(from) = from {
            path.push_str(&format!("&slot_date=gte.{}", encode_date(from)));
        }
        if let Some(to) = to {
            path.push_str(&format!("&slot_date=lt.{}", encode_date(to)));
        }
        path.push_str("&order=slot_date.asc,start_time.asc");
        self.select(&path).await
    }

    async fn get_blocked_slot(&self, id: i64) -> StoreResult<Option<BlockedSlot>> {
        self.select_one(&format!("/rest/v1/blocked_slots?id=eq.{}", id)).await
    }

    async fn insert_blocked_slot(&self, blocked: &NewBlockedSlot) -> StoreResult<BlockedSlot> {
        self.write_one(
            Method::POST,
            "/rest/v1/blocked_slots",
            serde_json::to_value(blocked)?,
            "Created blocked slot".to_string(),
        )
        .await
    }

    async fn update_blocked_slot(&self, id: i64, blocked: &NewBlockedSlot) -> StoreResult<BlockedSlot> {
        self.write_one(
            Method::PATCH,
            &format!("/rest/v1/blocked_slots?id=eq.{}", id),
            serde_json::to_value(blocked)?,
            format!("Blocked slot {}", id),
        )
        .await
    }

    async fn delete_blocked_slot(&self, id: i64) -> StoreResult<bool> {
        Ok(self.delete_rows(&format!("/rest/v1/blocked_slots?id=eq.{}", id)).await? > 0)
    }

    async fn list_leaves(&self, doctor_branch_id: i64) -> StoreResult<Vec<DoctorLeave>> {
        self.select(&format!(
            "/rest/v1/doctor_leaves?doctor_branch_id=eq.{}&order=leave_start.asc",
            doctor_branch_id
        ))
        .await
    }

    async fn get_leave(&self, id: i64) -> StoreResult<Option<DoctorLeave>> {
        self.select_one(&format!("/rest/v1/doctor_leaves?id=eq.{}", id)).await
    }

    async fn insert_leave(&self, leave: &NewDoctorLeave) -> StoreResult<DoctorLeave> {
        self.write_one(
            Method::POST,
            "/rest/v1/doctor_leaves",
            serde_json::to_value(leave)?,
            "Created leave".to_string(),
        )
        .await
    }

    async fn update_leave(&self, id: i64, leave: &NewDoctorLeave) -> StoreResult<DoctorLeave> {
        self.write_one(
            Method::PATCH,
            &format!("/rest/v1/doctor_leaves?id=eq.{}", id),
            serde_json::to_value(leave)?,
            format!("Leave {}", id),
        )
        .await
    }

    async fn delete_leave(&self, id: i64) -> StoreResult<bool> {
        Ok(self.delete_rows(&format!("/rest/v1/doctor_leaves?id=eq.{}", id)).await? > 0)
    }

    async fn list_slots(
        &self,
        doctor_branch_id: i64,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> StoreResult<Vec<Slot>> {
        let mut path = format!(
            "/rest/v1/slots?doctor_branch_id=eq.{}&slot_date=gte.{}",
            doctor_branch_id,
            encode_date(from)
        );
        if let Some(to) = to {
            path.push_str(&format!("&slot_date=lt.{}", encode_date(to)));
        }
        path.push_str("&order=slot_date.asc,start_time.asc");
        self.select(&path).await
    }

    async fn insert_slots(&self, slots: &[NewSlot]) -> StoreResult<usize> {
        if slots.is_empty() {
            return Ok(0);
        }

        let inserted: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::POST,
                &format!("/rest/v1/slots?on_conflict={}", SLOT_NATURAL_KEY),
                None,
                Some(serde_json::to_value(slots)?),
                Some(prefer_headers(&[PREFER_REPRESENTATION, "resolution=ignore-duplicates"])),
            )
            .await?;

        Ok(inserted.len())
    }

    async fn refresh_slots(&self, slots: &[Slot]) -> StoreResult<usize> {
        let mut updated = 0;
        for slot in slots {
            let rows: Vec<Value> = self
                .write(
                    Method::PATCH,
                    &format!(
                        "/rest/v1/slots?id=eq.{}&booked_count=eq.0&status=in.(PENDING_RELEASE,OPEN)",
                        slot.id
                    ),
                    json!({
                        "time_range_id": slot.time_range_id,
                        "capacity": slot.capacity,
                        "release_at": slot.release_at,
                        "status": slot.status,
                    }),
                )
                .await?;
            updated += rows.len();
        }
        Ok(updated)
    }

    async fn block_slots(&self, slot_ids: &[i64]) -> StoreResult<usize> {
        if slot_ids.is_empty() {
            return Ok(0);
        }

        let ids = slot_ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
        let rows: Vec<Value> = self
            .write(
                Method::PATCH,
                &format!("/rest/v1/slots?id=in.({})&status=not.in.(BLOCKED,EXPIRED)", ids),
                json!({ "status": SlotStatus::Blocked }),
            )
            .await?;
        Ok(rows.len())
    }

    async fn delete_unbooked_slots(&self, doctor_branch_id: i64, purge: &SlotPurge) -> StoreResult<usize> {
        self.delete_rows(&format!("/rest/v1/slots?{}", purge_filter(doctor_branch_id, purge)))
            .await
    }

    async fn release_due_slots(&self, as_of: NaiveDateTime) -> StoreResult<Vec<Slot>> {
        self.write(
            Method::PATCH,
            &format!(
                "/rest/v1/slots?status=eq.PENDING_RELEASE&release_at=lte.{}",
                encode_timestamp(as_of)
            ),
            json!({ "status": SlotStatus::Open }),
        )
        .await
    }

    async fn expire_slots(&self, as_of: NaiveDateTime) -> StoreResult<Vec<Slot>> {
        let date = encode_date(as_of.date());
        let started = format!(
            "or=(slot_date.lt.{date},and(slot_date.eq.{date},start_time.lte.{time}))",
            date = date,
            time = encode_time(as_of.time())
        );
        self.write(
            Method::PATCH,
            &format!(
                "/rest/v1/slots?status=in.(PENDING_RELEASE,OPEN)&booked_count=eq.0&{}",
                started
            ),
            json!({ "status": SlotStatus::Expired }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SlotWindow;
    use chrono::NaiveTime;

    #[test]
    fn purge_filter_includes_every_constraint() {
        let purge = SlotPurge {
            from: NaiveDate::from_ymd_opt(2024, 1, 8),
            to: None,
            time_range_ids: Some(vec![3, 4]),
            window: Some(SlotWindow::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            )),
            statuses: Some(vec![SlotStatus::Blocked]),
        };

        let filter = purge_filter(5, &purge);
        assert!(filter.starts_with("doctor_branch_id=eq.5&booked_count=eq.0"));
        assert!(filter.contains("slot_date=gte.2024-01-08"));
        assert!(filter.contains("time_range_id=in.(3,4)"));
        assert!(filter.contains("start_time=lt.10%3A00%3A00&end_time=gt.09%3A00%3A00"));
        assert!(filter.contains("status=in.(BLOCKED)"));
    }
}

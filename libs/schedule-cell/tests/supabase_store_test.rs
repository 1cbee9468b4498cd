mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;
use schedule_cell::services::{GenerationLock, SlotGenerator, SlotService};
use schedule_cell::{ClinicClock, ScheduleError, ScheduleState, ScheduleStore, Slot, SupabaseScheduleStore};
use shared_utils::test_utils::{MockSupabaseResponses, TestConfig};

fn store_for(server: &MockServer) -> SupabaseScheduleStore {
    SupabaseScheduleStore::new(&TestConfig::with_supabase_url(server.uri()).to_app_config())
}

fn state_for(server: &MockServer) -> ScheduleState {
    let config = Arc::new(TestConfig::with_supabase_url(server.uri()).to_app_config());
    let store: Arc<dyn ScheduleStore> = Arc::new(SupabaseScheduleStore::new(&config));
    ScheduleState::new(config, store, GenerationLock::local()).with_clock(ClinicClock::fixed(sunday_morning()))
}

async fn mount_get(server: &MockServer, table: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/rest/v1/{}", table)))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn reads_doctor_branch_and_week() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/doctor_branches"))
        .and(query_param("id", "eq.5"))
        .and(header("apikey", "test-anon-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([MockSupabaseResponses::doctor_branch_response(5, 3, true)])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/doctor_branches"))
        .and(query_param("id", "eq.6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let ranges = json!([MockSupabaseResponses::time_range_response(11, 1, "09:00:00", "12:00:00", 20, 2)]);
    mount_get(
        &server,
        "weekly_schedules",
        json!([MockSupabaseResponses::weekly_schedule_response(1, 5, 1, ranges)]),
    )
    .await;

    let store = store_for(&server);

    let branch = store.get_doctor_branch(5).await.unwrap().unwrap();
    assert_eq!(branch.doctor_id, 3);
    assert!(branch.is_active);
    assert!(store.get_doctor_branch(6).await.unwrap().is_none());

    let week = store.list_weekly_schedules(5).await.unwrap();
    assert_eq!(week.len(), 1);
    assert_eq!(week[0].time_ranges[0].start_time, time(9, 0));
    assert_eq!(week[0].time_ranges[0].slot_quantity, 2);
}

#[tokio::test]
async fn backend_errors_become_persistence_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/slot_release_rules"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_json(MockSupabaseResponses::error_response("boom", "XX000")),
        )
        .mount(&server)
        .await;

    let result = store_for(&server).list_release_rules(5).await;
    assert_matches!(result, Err(ScheduleError::Persistence(msg)) if msg.contains("500"));
}

#[tokio::test]
async fn generation_keeps_dates_committed_before_a_failure() {
    let server = MockServer::start().await;

    mount_get(
        &server,
        "doctor_branches",
        json!([MockSupabaseResponses::doctor_branch_response(DOCTOR_BRANCH, DOCTOR, true)]),
    )
    .await;
    mount_get(
        &server,
        "weekly_schedules",
        json!([
            MockSupabaseResponses::weekly_schedule_response(
                1,
                DOCTOR_BRANCH,
                1,
                json!([MockSupabaseResponses::time_range_response(11, 1, "09:00:00", "09:30:00", 15, 1)]),
            ),
            MockSupabaseResponses::weekly_schedule_response(
                2,
                DOCTOR_BRANCH,
                2,
                json!([MockSupabaseResponses::time_range_response(12, 2, "09:00:00", "09:30:00", 15, 1)]),
            ),
        ]),
    )
    .await;
    mount_get(
        &server,
        "slot_release_rules",
        json!([MockSupabaseResponses::release_rule_response(1, DOCTOR_BRANCH, 1)]),
    )
    .await;
    mount_get(&server, "blocked_slots", json!([])).await;
    mount_get(&server, "doctor_leaves", json!([])).await;
    mount_get(&server, "slots", json!([])).await;

    // Monday commits, Tuesday fails.
    Mock::given(method("POST"))
        .and(path("/rest/v1/slots"))
        .and(query_param("on_conflict", "doctor_branch_id,slot_date,start_time,end_time"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            MockSupabaseResponses::slot_response(1, DOCTOR_BRANCH, "2024-01-08", "09:00:00", "09:15:00", 0),
            MockSupabaseResponses::slot_response(2, DOCTOR_BRANCH, "2024-01-08", "09:15:00", "09:30:00", 0),
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/slots"))
        .respond_with(ResponseTemplate::new(500).set_body_string("connection reset"))
        .mount(&server)
        .await;

    let state = state_for(&server);
    let result = SlotGenerator::new(&state).generate(DOCTOR_BRANCH, 7).await;
    assert_matches!(result, Err(ScheduleError::Persistence(_)));

    let requests = server.received_requests().await.unwrap();
    let inserts: Vec<_> = requests
        .iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path() == "/rest/v1/slots")
        .collect();
    assert_eq!(inserts.len(), 2);

    let first: serde_json::Value = serde_json::from_slice(&inserts[0].body).unwrap();
    assert_eq!(first.as_array().unwrap().len(), 2);
    assert_eq!(first[0]["slot_date"], "2024-01-08");
    assert_eq!(first[0]["status"], "OPEN");

    // The lock is released after the failure.
    assert!(state.locks.try_acquire(DOCTOR_BRANCH).await.unwrap().is_some());
}

#[tokio::test]
async fn cancelled_generation_frees_the_doctor_branch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/doctor_branches"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([MockSupabaseResponses::doctor_branch_response(DOCTOR_BRANCH, DOCTOR, true)]))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let state = state_for(&server);
    let generator = SlotGenerator::new(&state);
    let cancelled = tokio::time::timeout(Duration::from_millis(50), generator.generate(DOCTOR_BRANCH, 7)).await;
    assert!(cancelled.is_err());

    assert!(state.locks.try_acquire(DOCTOR_BRANCH).await.unwrap().is_some());
}

#[tokio::test]
async fn expiry_patches_started_unbooked_slots() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slots"))
        .and(query_param("status", "in.(PENDING_RELEASE,OPEN)"))
        .and(query_param("booked_count", "eq.0"))
        .and(query_param(
            "or",
            "(slot_date.lt.2024-01-08,and(slot_date.eq.2024-01-08,start_time.lte.09:30:00))",
        ))
        .and(body_partial_json(json!({ "status": "EXPIRED" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::slot_response(1, DOCTOR_BRANCH, "2024-01-08", "09:00:00", "09:15:00", 0),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let state = state_for(&server);
    let expired = SlotService::new(&state)
        .mark_expired(Some(monday().and_time(time(9, 30))))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].doctor_branch_id, DOCTOR_BRANCH);
}

#[tokio::test]
async fn refresh_only_patches_unbooked_open_rows() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slots"))
        .and(query_param("id", "eq.1"))
        .and(query_param("booked_count", "eq.0"))
        .and(query_param("status", "in.(PENDING_RELEASE,OPEN)"))
        .and(body_partial_json(json!({ "capacity": 1, "status": "OPEN" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slots"))
        .and(query_param("id", "in.(1,2)"))
        .and(query_param("status", "not.in.(BLOCKED,EXPIRED)"))
        .and(body_partial_json(json!({ "status": "BLOCKED" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::slot_response(1, DOCTOR_BRANCH, "2024-01-08", "09:00:00", "09:15:00", 2),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let mut stale: Slot = serde_json::from_value(MockSupabaseResponses::slot_response(
        1,
        DOCTOR_BRANCH,
        "2024-01-08",
        "09:00:00",
        "09:15:00",
        0,
    ))
    .unwrap();
    stale.capacity = 1;

    // The row was booked after it was read, so nothing matches.
    assert_eq!(store.refresh_slots(&[stale]).await.unwrap(), 0);
    assert_eq!(store.block_slots(&[1, 2]).await.unwrap(), 1);
}

#[tokio::test]
async fn release_opens_due_pending_slots() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slots"))
        .and(query_param("status", "eq.PENDING_RELEASE"))
        .and(query_param("release_at", "lte.2024-01-07T08:00:00"))
        .and(body_partial_json(json!({ "status": "OPEN" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let state = state_for(&server);
    let released = SlotService::new(&state).release_due(None).await.unwrap();
    assert!(released.is_empty());
}

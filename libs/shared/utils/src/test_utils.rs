use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::{User, DEFAULT_TENANT};

pub struct TestConfig {
    pub jwt_secret: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
        }
    }
}

impl TestConfig {
    pub fn with_supabase_url(url: impl Into<String>) -> Self {
        Self {
            supabase_url: url.into(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_service_role_key: String::new(),
            supabase_jwt_secret: self.jwt_secret.clone(),
            redis_url: None,
            default_horizon_days: 14,
            max_horizon_days: 90,
            generation_timeout_seconds: 30,
            cache_ttl_seconds: 300,
            sweep_interval_seconds: 60,
            clinic_utc_offset_minutes: 0,
            port: 3000,
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: String,
    pub email: String,
    pub role: String,
    pub tenant_id: String,
}

impl Default for TestUser {
    fn default() -> Self {
        Self::new("test@example.com", "staff")
    }
}

impl TestUser {
    pub fn new(email: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            role: role.to_string(),
            tenant_id: DEFAULT_TENANT.to_string(),
        }
    }

    pub fn doctor(email: &str) -> Self {
        Self::new(email, "doctor")
    }

    pub fn staff(email: &str) -> Self {
        Self::new(email, "staff")
    }

    pub fn admin(email: &str) -> Self {
        Self::new(email, "admin")
    }

    pub fn with_tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = tenant_id.to_string();
        self
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id.clone(),
            email: Some(self.email.clone()),
            role: Some(self.role.clone()),
            tenant_id: self.tenant_id.clone(),
            metadata: None,
            created_at: Some(Utc::now()),
        }
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        let header = json!({
            "alg": "HS256",
            "typ": "JWT"
        });

        let payload = json!({
            "sub": user.id,
            "email": user.email,
            "role": user.role,
            "app_metadata": { "tenant_id": user.tenant_id },
            "iat": now.timestamp(),
            "exp": exp.timestamp()
        });

        let header_encoded = general_purpose::URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_encoded = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());

        let signing_input = format!("{}.{}", header_encoded, payload_encoded);

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_encoded = general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{}.{}", signing_input, signature_encoded)
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn create_invalid_signature_token(user: &TestUser) -> String {
        Self::create_test_token(user, "wrong-secret", Some(24))
    }

    pub fn create_malformed_token() -> String {
        "invalid.token.format".to_string()
    }
}

/// PostgREST rows shaped like the scheduling tables.
pub struct MockSupabaseResponses;

impl MockSupabaseResponses {
    pub fn doctor_branch_response(id: i64, doctor_id: i64, is_active: bool) -> serde_json::Value {
        json!({
            "id": id,
            "doctor_id": doctor_id,
            "branch_id": 1,
            "is_active": is_active
        })
    }

    pub fn weekly_schedule_response(
        id: i64,
        doctor_branch_id: i64,
        weekday: i32,
        time_ranges: serde_json::Value,
    ) -> serde_json::Value {
        json!({
            "id": id,
            "doctor_branch_id": doctor_branch_id,
            "weekday": weekday,
            "time_ranges": time_ranges
        })
    }

    pub fn time_range_response(
        id: i64,
        weekly_schedule_id: i64,
        start_time: &str,
        end_time: &str,
        slot_duration_minutes: i32,
        slot_quantity: i32,
    ) -> serde_json::Value {
        json!({
            "id": id,
            "weekly_schedule_id": weekly_schedule_id,
            "start_time": start_time,
            "end_time": end_time,
            "slot_duration_minutes": slot_duration_minutes,
            "slot_quantity": slot_quantity
        })
    }

    pub fn release_rule_response(id: i64, doctor_branch_id: i64, days_before: i32) -> serde_json::Value {
        json!({
            "id": id,
            "doctor_branch_id": doctor_branch_id,
            "scope": "DEFAULT",
            "weekday": null,
            "time_range_id": null,
            "release_days_before": days_before,
            "release_time": "06:00:00",
            "release_minutes_before_slot": null,
            "is_active": true,
            "updated_at": "2024-01-01T00:00:00Z"
        })
    }

    pub fn slot_response(
        id: i64,
        doctor_branch_id: i64,
        slot_date: &str,
        start_time: &str,
        end_time: &str,
        booked_count: i32,
    ) -> serde_json::Value {
        json!({
            "id": id,
            "doctor_branch_id": doctor_branch_id,
            "time_range_id": null,
            "slot_date": slot_date,
            "start_time": start_time,
            "end_time": end_time,
            "capacity": 2,
            "booked_count": booked_count,
            "release_at": format!("{}T06:00:00", slot_date),
            "status": if booked_count > 0 { "FULL" } else { "OPEN" }
        })
    }

    pub fn error_response(message: &str, code: &str) -> serde_json::Value {
        json!({
            "message": message,
            "code": code,
            "details": null,
            "hint": null
        })
    }
}

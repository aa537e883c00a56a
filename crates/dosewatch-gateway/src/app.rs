use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use dosewatch_core::DosewatchConfig;
use dosewatch_scheduler::{AdherenceTracker, ExecutionRunner, ReminderStore};

use crate::http::{adherence, health, reminders};

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: DosewatchConfig,
    pub store: Arc<ReminderStore>,
    pub tracker: AdherenceTracker,
    /// Shared with the engine; exposes delivery counters to `/health`.
    pub runner: Arc<ExecutionRunner>,
    pub worker_id: String,
}

impl AppState {
    pub fn new(
        config: DosewatchConfig,
        store: Arc<ReminderStore>,
        tracker: AdherenceTracker,
        runner: Arc<ExecutionRunner>,
        worker_id: String,
    ) -> Self {
        Self {
            config,
            store,
            tracker,
            runner,
            worker_id,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/users/{owner_id}/reminders",
            post(reminders::create_reminder).get(reminders::list_reminders),
        )
        .route(
            "/users/{owner_id}/reminders/missed",
            get(reminders::missed_reminders),
        )
        .route(
            "/users/{owner_id}/reminders/{id}",
            put(reminders::update_reminder).delete(reminders::delete_reminder),
        )
        .route(
            "/users/{owner_id}/reminders/{id}/history",
            get(reminders::reminder_history),
        )
        .route(
            "/users/{owner_id}/adherence/{record_id}/taken",
            post(adherence::mark_taken),
        )
        .route(
            "/users/{owner_id}/adherence/{record_id}/skipped",
            post(adherence::mark_skipped),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use dosewatch_scheduler::LogNotifier;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        _dir: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.db");
        let store = Arc::new(ReminderStore::open(&path).unwrap());
        let tracker = AdherenceTracker::open(&path).unwrap();
        let runner = Arc::new(ExecutionRunner::new(
            store.clone(),
            Arc::new(LogNotifier),
            1_000,
        ));
        let state = Arc::new(AppState::new(
            DosewatchConfig::default(),
            store,
            tracker,
            runner,
            "test-worker".into(),
        ));
        TestApp {
            router: build_router(state),
            _dir: dir,
        }
    }

    async fn call(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .router
            .clone()
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn amoxicillin() -> Value {
        json!({
            "medicine_name": "Amoxicillin",
            "dosage": "500mg",
            "frequency": { "kind": "N_TIMES_DAILY", "times": ["08:00", "20:00"] },
            "course": { "kind": "FOR_N_DAYS", "n": 3 },
            "start_date": "2030-01-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn health_reports_worker() {
        let app = test_app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["worker_id"], "test-worker");
    }

    #[tokio::test]
    async fn create_returns_end_date() {
        let app = test_app();
        let (status, body) =
            call(&app, Method::POST, "/users/u1/reminders", Some(amoxicillin())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["end_date"], "2030-01-04T00:00:00Z");
        assert_eq!(body["next_due_at"], "2030-01-01T08:00:00Z");
        assert_eq!(body["owner_id"], "u1");
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let app = test_app();
        let bad = json!({
            "medicine_name": "Amoxicillin",
            "dosage": "500mg",
            "frequency": { "kind": "EVERY_N_HOURS", "n": 0 }
        });
        let (status, body) = call(&app, Method::POST, "/users/u1/reminders", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_SPEC");

        let unknown = json!({
            "medicine_name": "Amoxicillin",
            "dosage": "500mg",
            "frequency": { "kind": "HOURLY-ISH" }
        });
        let (status, _) = call(&app, Method::POST, "/users/u1/reminders", Some(unknown)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_is_paginated_per_owner() {
        let app = test_app();
        for _ in 0..3 {
            call(&app, Method::POST, "/users/u1/reminders", Some(amoxicillin())).await;
        }
        call(&app, Method::POST, "/users/u2/reminders", Some(amoxicillin())).await;

        let (status, body) =
            call(&app, Method::GET, "/users/u1/reminders?page=2&limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reminders"].as_array().unwrap().len(), 1);
        assert_eq!(body["pagination"]["total"], 3);
        assert_eq!(body["pagination"]["total_pages"], 2);
    }

    #[tokio::test]
    async fn foreign_reminders_are_not_found() {
        let app = test_app();
        let (_, created) =
            call(&app, Method::POST, "/users/u1/reminders", Some(amoxicillin())).await;
        let id = created["id"].as_str().unwrap();

        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/users/u2/reminders/{id}"),
            Some(amoxicillin()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, _) =
            call(&app, Method::DELETE, &format!("/users/u2/reminders/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_then_delete() {
        let app = test_app();
        let (_, created) =
            call(&app, Method::POST, "/users/u1/reminders", Some(amoxicillin())).await;
        let id = created["id"].as_str().unwrap();

        let mut changed = amoxicillin();
        changed["dosage"] = json!("250mg");
        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/users/u1/reminders/{id}"),
            Some(changed),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dosage"], "250mg");
        assert_eq!(body["id"], id);

        let (status, body) =
            call(&app, Method::DELETE, &format!("/users/u1/reminders/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());

        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/users/u1/reminders/{id}/history"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missed_route_is_not_an_id() {
        let app = test_app();
        let (status, body) = call(&app, Method::GET, "/users/u1/reminders/missed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn unknown_adherence_record_is_not_found() {
        let app = test_app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/users/u1/adherence/nope/taken",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

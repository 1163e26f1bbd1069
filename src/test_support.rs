use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub query: HashMap<String, String>,
    pub user_id: Option<String>,
}

impl RecordedRequest {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

type Responder = Arc<dyn Fn(&RecordedRequest) -> (u16, JsonValue) + Send + Sync>;

#[derive(Clone)]
struct FakeState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    responder: Responder,
}

/// In-process HTTP backend on an ephemeral port that records every request.
pub struct FakeBackend {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle(
    State(state): State<FakeState>,
    uri: Uri,
    headers: HeaderMap,
) -> (StatusCode, Json<JsonValue>) {
    let query = uri
        .query()
        .map(|raw| url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let request = RecordedRequest {
        path: uri.path().to_string(),
        query,
        user_id: headers
            .get("userid")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };
    let (status, body) = (state.responder)(&request);
    state.requests.lock().expect("lock").push(request);
    (
        StatusCode::from_u16(status).expect("status code"),
        Json(body),
    )
}

impl FakeBackend {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&RecordedRequest) -> (u16, JsonValue) + Send + Sync + 'static,
    {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = FakeState {
            requests: requests.clone(),
            responder: Arc::new(responder),
        };
        let app = Router::new().fallback(handle).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake backend");
        });
        Self {
            base_url: format!("http://{addr}/"),
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("lock").clone()
    }

    pub fn requests_to(&self, suffix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|req| req.path.ends_with(suffix))
            .collect()
    }
}

pub fn test_config(base_url: &str) -> ClientConfig {
    let mut config = ClientConfig::new(base_url);
    config.user_id = Some("user-1".to_string());
    config.retry_max_attempts = 3;
    config.retry_base_delay_ms = 1;
    config.retry_max_delay_ms = 5;
    config.page_limit = 3;
    config.max_pages = 20;
    config.load_entity_page_size = 2;
    config.request_timeout_seconds = 5;
    config
}

/// One stored reading of the simulated device.
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    pub time: i64,
    pub sensor: &'static str,
    pub value: f64,
}

pub fn reading(time: i64, sensor: &'static str, value: f64) -> Reading {
    Reading {
        time,
        sensor,
        value,
    }
}

/// Serves the device list, device metadata and the three cursor data routes
/// for one device, with `lim` bounding the total rows per page.
pub fn series_responder(
    device_id: &'static str,
    metadata: JsonValue,
    readings: Vec<Reading>,
) -> impl Fn(&RecordedRequest) -> (u16, JsonValue) + Send + Sync + 'static {
    move |req: &RecordedRequest| {
        let path = req.path.as_str();
        if path == "/api/metaData/allDevices" {
            return (200, json!({"success": true, "data": [{"devID": device_id}]}));
        }
        if let Some(id) = path.strip_prefix("/api/metaData/device/") {
            return if id == device_id {
                (200, json!({"success": true, "data": metadata.clone()}))
            } else {
                (404, json!({"success": false, "message": "device not found"}))
            };
        }
        if !path.starts_with("/api/apiLayer/") {
            return (404, json!({}));
        }
        if req.param("device") != Some(device_id) {
            return (404, json!({"success": false, "message": "device not found"}));
        }

        let sensors: Vec<&str> = req
            .param("sensor")
            .map(|raw| raw.split(',').collect())
            .unwrap_or_default();
        let num = |key: &str| req.param(key).and_then(|v| v.parse::<i64>().ok());
        let limit = num("lim").unwrap_or(1_000) as usize;
        let mut rows: Vec<Reading> = readings
            .iter()
            .copied()
            .filter(|r| sensors.contains(&r.sensor))
            .collect();

        if path.ends_with("getFirstDataMultipleSensors") {
            let start = num("sTime").unwrap_or(i64::MIN);
            rows.retain(|r| r.time >= start);
            rows.sort_by_key(|r| r.time);
        } else if path.ends_with("getLimitedDataMultipleSensors") {
            let end = num("eTime").unwrap_or(i64::MAX);
            rows.retain(|r| r.time <= end);
            rows.sort_by_key(|r| std::cmp::Reverse(r.time));
        } else if path.ends_with("getAllData") {
            let start = num("sTime").unwrap_or(i64::MIN);
            let end = num("eTime").unwrap_or(i64::MAX);
            rows.retain(|r| r.time >= start && r.time <= end);
            rows.sort_by_key(|r| r.time);
        } else {
            return (404, json!({}));
        }

        let data: Vec<JsonValue> = rows
            .into_iter()
            .take(limit)
            .map(|r| json!({"time": r.time, "sensor": r.sensor, "value": r.value}))
            .collect();
        (200, json!({"success": true, "data": data}))
    }
}

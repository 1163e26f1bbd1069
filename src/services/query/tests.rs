use super::{DataAccess, FirstDpOptions, LastDpOptions, QueryFlags, RangeQueryOptions};
use crate::error::ErrorKind;
use crate::models::DeviceMetadata;
use crate::services::sensor_table::{SensorTable, TableTime};
use crate::test_support::{
    reading, series_responder, test_config, FakeBackend, Reading, RecordedRequest,
};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const T: i64 = 1_704_067_200_000;

fn metadata_json() -> JsonValue {
    json!({
        "devID": "DEV_1",
        "devName": "Boiler",
        "sensors": [
            {"sensorId": "D0", "sensorName": "Temperature"},
            {"sensorId": "D1", "sensorName": "Pressure"}
        ],
        "params": {
            "D0": [
                {"paramName": "m", "paramValue": 2},
                {"paramName": "c", "paramValue": "1"}
            ]
        },
        "unitSelected": {"D0": "degC"}
    })
}

fn sensors(ids: &[&str]) -> Option<Vec<String>> {
    Some(ids.iter().map(|id| id.to_string()).collect())
}

fn unix_flags() -> QueryFlags {
    QueryFlags {
        unix: true,
        ..Default::default()
    }
}

async fn backend(readings: Vec<Reading>) -> FakeBackend {
    FakeBackend::start(series_responder("DEV_1", metadata_json(), readings)).await
}

fn client(backend: &FakeBackend) -> DataAccess {
    DataAccess::new(test_config(&backend.base_url)).expect("client")
}

fn times(table: &SensorTable) -> Vec<i64> {
    table
        .as_flat()
        .expect("flat table")
        .iter()
        .map(|record| match record.time {
            TableTime::Unix(ms) => ms,
            TableTime::Iso(_) => panic!("expected unix time"),
        })
        .collect()
}

#[tokio::test]
async fn first_dp_returns_the_first_reading_after_start() {
    let backend = backend(vec![reading(T + 5_000, "D0", 1.0)]).await;
    let mut options = FirstDpOptions::new("DEV_1", T);
    options.sensors = sensors(&["D0"]);
    options.flags = unix_flags();

    let table = client(&backend).get_first_dp(&options).await.expect("first dp");
    assert_eq!(times(&table), vec![T + 5_000]);

    let data = backend.requests_to("getFirstDataMultipleSensors");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].param("sTime"), Some(T.to_string().as_str()));
    assert_eq!(data[0].param("cursor"), Some("true"));
    assert_eq!(data[0].user_id.as_deref(), Some("user-1"));
    assert!(backend.requests_to("/api/metaData/device/DEV_1").is_empty());
}

#[tokio::test]
async fn first_dp_rejects_non_positive_n_before_any_request() {
    let backend = backend(Vec::new()).await;
    let access = client(&backend);
    for n in [0, -3] {
        let mut options = FirstDpOptions::new("DEV_1", T);
        options.n = n;
        let err = access.get_first_dp(&options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn first_dp_collects_n_per_sensor_in_ascending_order() {
    let backend = backend(vec![
        reading(T + 1_000, "D0", 1.0),
        reading(T + 2_000, "D0", 2.0),
        reading(T + 3_000, "D0", 3.0),
        reading(T + 4_000, "D0", 4.0),
        reading(T + 9_000, "D1", 9.0),
    ])
    .await;
    let mut options = FirstDpOptions::new("DEV_1", T);
    options.sensors = sensors(&["D0", "D1"]);
    options.n = 2;
    options.flags = unix_flags();

    let table = client(&backend).get_first_dp(&options).await.expect("first dp");
    let records = table.as_flat().expect("flat");
    let summary: Vec<(&str, Option<f64>)> = records
        .iter()
        .map(|record| (record.sensor.as_str(), record.value))
        .collect();
    assert_eq!(
        summary,
        vec![("D0", Some(1.0)), ("D0", Some(2.0)), ("D1", Some(9.0))]
    );
    assert_eq!(times(&table), vec![T + 1_000, T + 2_000, T + 9_000]);

    // D0 is satisfied after the first page, so only D1 is asked for next.
    let data = backend.requests_to("getFirstDataMultipleSensors");
    assert_eq!(data[0].param("sensor"), Some("D0,D1"));
    assert_eq!(data.last().and_then(|req| req.param("sensor")), Some("D1"));
}

#[tokio::test]
async fn get_dp_is_descending_by_default() {
    let backend = backend(vec![
        reading(T, "D0", 0.0),
        reading(T + 1_000, "D0", 1.0),
        reading(T + 2_000, "D0", 2.0),
        reading(T + 3_000, "D0", 3.0),
    ])
    .await;
    let mut options = LastDpOptions::new("DEV_1");
    options.sensors = sensors(&["D0"]);
    options.end_time = (T + 3_000).into();
    options.n = 2;
    options.flags = unix_flags();

    let table = client(&backend).get_dp(&options).await.expect("last dp");
    assert_eq!(times(&table), vec![T + 3_000, T + 2_000]);
    let data = backend.requests_to("getLimitedDataMultipleSensors");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].param("eTime"), Some((T + 3_000).to_string().as_str()));
}

#[tokio::test]
async fn get_dp_applies_calibration_and_aliases_from_metadata() {
    let backend = backend(vec![reading(T, "D0", 10.0), reading(T, "D1", 5.0)]).await;
    let mut options = LastDpOptions::new("DEV_1");
    options.end_time = T.into();
    options.flags = QueryFlags {
        cal: true,
        alias: true,
        unix: true,
        ..Default::default()
    };

    let table = client(&backend).get_dp(&options).await.expect("last dp");
    let records = table.as_flat().expect("flat");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].sensor, "Temperature");
    assert_eq!(records[0].value, Some(21.0));
    assert_eq!(records[1].sensor, "Pressure");
    assert_eq!(records[1].value, Some(5.0));
    assert_eq!(backend.requests_to("/api/metaData/device/DEV_1").len(), 1);
}

#[tokio::test]
async fn supplied_metadata_skips_the_metadata_request() {
    let backend = backend(vec![reading(T, "D0", 10.0)]).await;
    let metadata: DeviceMetadata = serde_json::from_value(metadata_json()).expect("metadata");
    let mut options = LastDpOptions::new("DEV_1");
    options.end_time = T.into();
    options.flags = QueryFlags {
        alias: true,
        unix: true,
        metadata: Some(metadata),
        ..Default::default()
    };

    let table = client(&backend).get_dp(&options).await.expect("last dp");
    assert_eq!(table.as_flat().expect("flat")[0].sensor, "Temperature");
    assert!(backend.requests_to("/api/metaData/device/DEV_1").is_empty());
}

#[tokio::test]
async fn data_query_rejects_inverted_range_before_any_request() {
    let backend = backend(Vec::new()).await;
    let options = RangeQueryOptions::new("DEV_1", T + 1_000, T);
    let err = client(&backend).data_query(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn data_query_paginates_the_closed_range_into_a_pivot() {
    let mut readings: Vec<Reading> = (0..7)
        .map(|i| reading(T + i * 1_000, "D0", i as f64))
        .collect();
    readings.push(reading(T + 1_000, "D1", 10.0));
    readings.push(reading(T + 3_000, "D1", 30.0));
    let backend = backend(readings).await;

    let mut options = RangeQueryOptions::new("DEV_1", T + 1_000, T + 5_000);
    options.sensors = sensors(&["D0", "D1"]);
    options.flags = QueryFlags {
        unix: true,
        pivot_table: true,
        ..Default::default()
    };

    let table = client(&backend).data_query(&options).await.expect("range");
    let pivot = table.as_pivot().expect("pivot");
    assert_eq!(pivot.columns, vec!["D0".to_string(), "D1".to_string()]);
    assert_eq!(pivot.rows.len(), 5);
    assert_eq!(pivot.rows[0].time, TableTime::Unix(T + 1_000));
    assert_eq!(pivot.rows[4].time, TableTime::Unix(T + 5_000));
    assert_eq!(pivot.cell(0, "D1"), Some(Some(10.0)));
    assert_eq!(pivot.cell(1, "D1"), Some(None));
    assert_eq!(pivot.cell(2, "D1"), Some(Some(30.0)));

    let data = backend.requests_to("getAllData");
    assert!(data.len() > 1);
    assert!(data
        .iter()
        .all(|req| req.param("eTime") == Some((T + 5_000).to_string().as_str())));
    assert_eq!(data[0].param("sTime"), Some((T + 1_000).to_string().as_str()));
}

#[tokio::test]
async fn data_query_keeps_every_reading_when_one_timestamp_fills_a_page() {
    let backend = backend(vec![
        reading(T + 1_000, "D0", 1.0),
        reading(T + 1_000, "D1", 1.0),
        reading(T + 1_000, "D2", 1.0),
        reading(T + 1_000, "D3", 1.0),
        reading(T + 2_000, "D0", 2.0),
        reading(T + 3_000, "D0", 3.0),
    ])
    .await;
    let mut options = RangeQueryOptions::new("DEV_1", T, T + 5_000);
    options.sensors = sensors(&["D0", "D1", "D2", "D3"]);
    options.flags = unix_flags();

    let table = client(&backend).data_query(&options).await.expect("range");
    assert_eq!(
        times(&table),
        vec![T + 1_000, T + 1_000, T + 1_000, T + 1_000, T + 2_000, T + 3_000]
    );
    let limits: Vec<Option<String>> = backend
        .requests_to("getAllData")
        .iter()
        .map(|req| req.param("lim").map(str::to_string))
        .collect();
    assert!(limits.contains(&Some("6".to_string())));
    assert_eq!(limits.last(), Some(&Some("3".to_string())));
}

#[tokio::test]
async fn first_dp_walks_past_tied_timestamps_across_pages() {
    let ids = ["D0", "D1", "D2", "D3"];
    let mut readings = Vec::new();
    for offset in [1_000, 2_000] {
        for id in ids {
            readings.push(reading(T + offset, id, offset as f64));
        }
    }
    let backend = backend(readings).await;
    let mut options = FirstDpOptions::new("DEV_1", T);
    options.sensors = sensors(&ids);
    options.n = 2;
    options.flags = unix_flags();

    let table = client(&backend).get_first_dp(&options).await.expect("first dp");
    let records = table.as_flat().expect("flat");
    assert_eq!(records.len(), 8);
    for id in ids {
        let per_sensor: Vec<i64> = records
            .iter()
            .filter(|record| record.sensor == id)
            .map(|record| match record.time {
                TableTime::Unix(ms) => ms,
                TableTime::Iso(_) => panic!("expected unix time"),
            })
            .collect();
        assert_eq!(per_sensor, vec![T + 1_000, T + 2_000], "sensor {id}");
    }
    assert!(backend.requests_to("getFirstDataMultipleSensors").len() > 2);
}

/// Serves the first page of `route`, then fails every later page with 500.
async fn failing_after_first_page(route: &'static str, readings: Vec<Reading>) -> FakeBackend {
    let pages = Arc::new(AtomicUsize::new(0));
    let inner = series_responder("DEV_1", metadata_json(), readings);
    FakeBackend::start(move |req| {
        if req.path.ends_with(route) && pages.fetch_add(1, Ordering::SeqCst) > 0 {
            return (500, json!({"message": "backend restarting"}));
        }
        inner(req)
    })
    .await
}

#[tokio::test]
async fn data_query_fails_instead_of_returning_partial_pages() {
    let readings = (0..7).map(|i| reading(T + i * 1_000, "D0", i as f64)).collect();
    let backend = failing_after_first_page("getAllData", readings).await;
    let mut options = RangeQueryOptions::new("DEV_1", T, T + 6_000);
    options.sensors = sensors(&["D0"]);

    let err = client(&backend).data_query(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Http);
    assert_eq!(err.http_status(), Some(500));
    assert!(err.to_string().contains("data_query"));
    assert_eq!(backend.requests_to("getAllData").len(), 1 + 3);
}

#[tokio::test]
async fn get_dp_fails_instead_of_returning_partial_pages() {
    let readings = (0..7).map(|i| reading(T + i * 1_000, "D0", i as f64)).collect();
    let backend = failing_after_first_page("getLimitedDataMultipleSensors", readings).await;
    let mut options = LastDpOptions::new("DEV_1");
    options.sensors = sensors(&["D0"]);
    options.end_time = (T + 6_000).into();
    options.n = 5;

    let err = client(&backend).get_dp(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Http);
    assert_eq!(
        backend.requests_to("getLimitedDataMultipleSensors").len(),
        1 + 3
    );
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let inner = series_responder("DEV_1", metadata_json(), vec![reading(T + 1, "D0", 1.0)]);
    let backend = FakeBackend::start(move |req| {
        if req.path.ends_with("getFirstDataMultipleSensors")
            && counter.fetch_add(1, Ordering::SeqCst) == 0
        {
            return (500, json!({"message": "try again"}));
        }
        inner(req)
    })
    .await;

    let mut options = FirstDpOptions::new("DEV_1", T);
    options.sensors = sensors(&["D0"]);
    options.flags = unix_flags();
    let table = client(&backend).get_first_dp(&options).await.expect("first dp");
    assert_eq!(table.len(), 1);
    assert_eq!(backend.requests_to("getFirstDataMultipleSensors").len(), 2);
}

#[tokio::test]
async fn persistent_server_errors_surface_after_max_attempts() {
    let backend = FakeBackend::start(|_| (503, json!({"message": "down"}))).await;
    let mut options = LastDpOptions::new("DEV_1");
    options.sensors = sensors(&["D0"]);
    let err = client(&backend).get_dp(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Http);
    assert_eq!(err.http_status(), Some(503));
    assert!(err.to_string().contains("get_dp"));
    assert_eq!(backend.requests().len(), 3);
}

#[tokio::test]
async fn unknown_device_is_not_found_and_not_retried() {
    let backend = backend(Vec::new()).await;
    let options = FirstDpOptions::new("DEV_X", T);
    let err = client(&backend).get_first_dp(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(backend.requests().len(), 1);
}

#[tokio::test]
async fn device_outside_the_account_is_not_found_even_when_data_route_is_empty() {
    let inner = series_responder("DEV_1", metadata_json(), Vec::new());
    let backend = FakeBackend::start(move |req| {
        if req.path.starts_with("/api/apiLayer/") {
            return (200, json!({"data": []}));
        }
        inner(req)
    })
    .await;
    let mut options = FirstDpOptions::new("DEV_NOT_MINE", T);
    options.sensors = sensors(&["D0"]);

    let err = client(&backend).get_first_dp(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(backend.requests_to("getFirstDataMultipleSensors").is_empty());
    assert_eq!(backend.requests_to("/api/metaData/allDevices").len(), 1);
}

#[tokio::test]
async fn device_without_sensors_is_no_data() {
    let backend = FakeBackend::start(series_responder(
        "DEV_1",
        json!({"devID": "DEV_1", "sensors": []}),
        Vec::new(),
    ))
    .await;
    let options = LastDpOptions::new("DEV_1");
    let err = client(&backend).get_dp(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoData);
}

#[tokio::test]
async fn empty_window_returns_an_empty_table() {
    let backend = backend(vec![reading(T, "D0", 1.0)]).await;
    let mut options = FirstDpOptions::new("DEV_1", T + 60_000);
    options.flags = unix_flags();
    let table = client(&backend).get_first_dp(&options).await.expect("first dp");
    assert!(table.is_empty());
}

#[tokio::test]
async fn iso_start_time_is_read_in_the_query_timezone() {
    let backend = backend(vec![reading(T, "D0", 1.0)]).await;
    let mut options = FirstDpOptions::new("DEV_1", "2024-01-01T05:30:00");
    options.sensors = sensors(&["D0"]);
    options.flags = QueryFlags {
        tz: Some(chrono_tz::Asia::Kolkata),
        ..Default::default()
    };

    let table = client(&backend).get_first_dp(&options).await.expect("first dp");
    let records = table.as_flat().expect("flat");
    assert_eq!(
        records[0].time,
        TableTime::Iso("2024-01-01T05:30:00.000+05:30".to_string())
    );
    let data = backend.requests_to("getFirstDataMultipleSensors");
    assert_eq!(data[0].param("sTime"), Some(T.to_string().as_str()));
}

#[tokio::test]
async fn on_prem_without_url_is_rejected_before_any_request() {
    let backend = backend(Vec::new()).await;
    let mut options = LastDpOptions::new("DEV_1");
    options.flags.on_prem = true;
    let err = client(&backend).get_dp(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn cancelled_client_stops_before_fetching() {
    let backend = backend(vec![reading(T, "D0", 1.0)]).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let access = client(&backend).with_cancellation(cancel);
    let mut options = LastDpOptions::new("DEV_1");
    options.sensors = sensors(&["D0"]);
    let err = access.get_dp(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(backend.requests().is_empty());
}

fn cluster_backend() -> impl Fn(&RecordedRequest) -> (u16, JsonValue) + Send + Sync + 'static {
    let clusters: Vec<JsonValue> = (1..=5)
        .map(|i| {
            json!({
                "_id": format!("c{i}"),
                "name": format!("Plant {}", (b'A' + i as u8 - 1) as char),
                "devConfigs": [{"devId": "DEV_1", "percentage": 100, "sensor": "D0"}]
            })
        })
        .collect();
    move |req: &RecordedRequest| {
        let parts: Vec<&str> = req
            .path
            .trim_start_matches("/api/metaData/getAllClusterData/")
            .split('/')
            .collect();
        let (page, count) = match parts.as_slice() {
            [page, count] => (
                page.parse::<usize>().unwrap_or(1),
                count.parse::<usize>().unwrap_or(1),
            ),
            _ => return (404, json!({})),
        };
        let data: Vec<JsonValue> = clusters
            .iter()
            .skip((page - 1) * count)
            .take(count)
            .cloned()
            .collect();
        (200, json!({"data": data, "totalCount": clusters.len()}))
    }
}

#[tokio::test]
async fn load_entities_without_filter_walks_every_page() {
    let backend = FakeBackend::start(cluster_backend()).await;
    let entities = client(&backend)
        .get_load_entities(None, false)
        .await
        .expect("entities");
    assert_eq!(entities.len(), 5);
    let paths: Vec<String> = backend.requests().into_iter().map(|req| req.path).collect();
    assert_eq!(
        paths,
        vec![
            "/api/metaData/getAllClusterData/1/2",
            "/api/metaData/getAllClusterData/2/2",
            "/api/metaData/getAllClusterData/3/2",
            "/api/metaData/getAllClusterData/4/2",
        ]
    );
}

#[tokio::test]
async fn load_entities_filters_by_name_or_id() {
    let backend = FakeBackend::start(cluster_backend()).await;
    let wanted = vec!["Plant B".to_string(), "c5".to_string()];
    let entities = client(&backend)
        .get_load_entities(Some(wanted.as_slice()), false)
        .await
        .expect("entities");
    let ids: Vec<&str> = entities.iter().map(|entity| entity.id.as_str()).collect();
    assert_eq!(ids, vec!["c2", "c5"]);
}

#[tokio::test]
async fn load_entities_rejects_empty_filter() {
    let backend = FakeBackend::start(cluster_backend()).await;
    let err = client(&backend)
        .get_load_entities(Some(&[][..]), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn load_entities_follow_on_prem_routing() {
    let cloud = FakeBackend::start(cluster_backend()).await;
    let local = FakeBackend::start(cluster_backend()).await;
    let mut config = test_config(&cloud.base_url);
    config.on_prem_url = Some(local.base_url.clone());
    let access = DataAccess::new(config).expect("client");

    let entities = access
        .get_load_entities(None, true)
        .await
        .expect("entities");
    assert_eq!(entities.len(), 5);
    assert!(cloud.requests().is_empty());
    assert_eq!(local.requests().len(), 4);

    let err = client(&cloud)
        .get_load_entities(None, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(cloud.requests().is_empty());
}

//! Retry ceiling and failure classification against a fake HTTP
//! coordination service served by axum.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use lns_node::coordination::{HttpCoordinationEndpoint, UplinkDescriptor};
use lns_node::provisioning::StaticProvisioning;
use lns_node::{
    CoordinationClient, CoordinationError, DevAddr, DevEui, DeviceIdentity, LnsConfig, LnsNode,
    RadioMetadata, RetryPolicy, SessionSeed, UplinkFrame, UplinkOutcome,
};

const AUTH_CODE: &str = "function-key";

#[derive(Debug, Clone)]
struct Recorded {
    dev_eui: String,
    code: Option<String>,
    body: Value,
}

/// Fails the first `failures` calls with `failure_status`, then answers `success_body`
#[derive(Clone)]
struct FakeBundler {
    hits: Arc<AtomicU32>,
    failures: u32,
    failure_status: StatusCode,
    success_body: String,
    recorded: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeBundler {
    fn new(failures: u32, failure_status: StatusCode, success_body: &str) -> Self {
        Self {
            hits: Arc::new(AtomicU32::new(0)),
            failures,
            failure_status,
            success_body: success_body.to_string(),
            recorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn bundler(
    State(fake): State<FakeBundler>,
    Path(dev_eui): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let hit = fake.hits.fetch_add(1, Ordering::SeqCst) + 1;
    fake.recorded.lock().unwrap().push(Recorded {
        dev_eui,
        code: query.get("code").cloned(),
        body,
    });

    if hit <= fake.failures {
        return (fake.failure_status, "coordination unavailable").into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        fake.success_body.clone(),
    )
        .into_response()
}

/// Serve the fake on an ephemeral port and return its base URL
async fn serve(fake: FakeBundler) -> String {
    let app = Router::new()
        .route("/api/FunctionBundler/:dev_eui", post(bundler))
        .with_state(fake);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn success_body() -> String {
    json!({
        "dedup": { "isDuplicate": false, "winningGateway": "gw-1" },
        "nextFcntDown": 4,
        "adr": null,
        "countersReset": false
    })
    .to_string()
}

fn identity() -> DeviceIdentity {
    DeviceIdentity::new(DevEui(0x0004A30B001C0530), DevAddr(0x26011B01))
}

fn descriptor() -> UplinkDescriptor {
    UplinkDescriptor {
        fcnt_up: 12,
        gateway_id: "gw-1".to_string(),
        gateway_count: 1,
        adr_enabled: false,
        fcnt_down: 3,
        needs_fcnt_down: true,
        abp_fcnt_reset: false,
        data_rate: 5,
        snr: 7.5,
    }
}

async fn client_for(fake: &FakeBundler) -> CoordinationClient {
    let base = serve(fake.clone()).await;
    let endpoint =
        HttpCoordinationEndpoint::new(&base, Some(AUTH_CODE.to_string()), Duration::from_secs(2))
            .unwrap();
    CoordinationClient::new(Arc::new(endpoint), RetryPolicy::immediate(8), Duration::from_secs(2))
}

#[tokio::test]
async fn test_always_failing_endpoint_gets_nine_attempts() {
    let fake = FakeBundler::new(u32::MAX, StatusCode::INTERNAL_SERVER_ERROR, "");
    let client = client_for(&fake).await;

    let err = client.coordinate(identity(), descriptor()).await.unwrap_err();

    assert!(matches!(err, CoordinationError::Transient { attempts: 9, .. }));
    assert_eq!(fake.hits(), 9);
}

#[tokio::test]
async fn test_recovers_after_transient_failures() {
    let fake = FakeBundler::new(2, StatusCode::SERVICE_UNAVAILABLE, &success_body());
    let client = client_for(&fake).await;

    let result = client.coordinate(identity(), descriptor()).await.unwrap();

    assert_eq!(fake.hits(), 3);
    assert!(!result.dedup.is_duplicate);
    assert_eq!(result.next_fcnt_down, Some(4));

    let recorded = fake.recorded.lock().unwrap().clone();
    assert_eq!(recorded[0].dev_eui, "0004A30B001C0530");
    assert_eq!(recorded[0].code.as_deref(), Some(AUTH_CODE));
    assert_eq!(recorded[0].body["fcntUp"], 12);
    assert_eq!(recorded[0].body["needsFcntDown"], true);
    assert_eq!(recorded[0].body["devAddr"], "26011B01");
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let fake = FakeBundler::new(u32::MAX, StatusCode::BAD_REQUEST, "");
    let client = client_for(&fake).await;

    let err = client.coordinate(identity(), descriptor()).await.unwrap_err();

    assert!(matches!(err, CoordinationError::NonTransient { status: Some(400), .. }));
    assert_eq!(fake.hits(), 1);
}

#[tokio::test]
async fn test_malformed_response_is_not_retried() {
    let fake = FakeBundler::new(0, StatusCode::OK, "{\"dedup\": ");
    let client = client_for(&fake).await;

    let err = client.coordinate(identity(), descriptor()).await.unwrap_err();

    assert!(!err.is_transient());
    assert_eq!(fake.hits(), 1);
}

#[tokio::test]
async fn test_dispatcher_reports_transient_failure_without_mutation() {
    let fake = FakeBundler::new(u32::MAX, StatusCode::BAD_GATEWAY, "");
    let base = serve(fake.clone()).await;

    let mut config = LnsConfig::default();
    config.platform.instance_id = "lns-http".to_string();
    config.coordination.endpoint_url = Some(base);
    config.coordination.auth_code = Some(AUTH_CODE.to_string());

    let provisioning = Arc::new(StaticProvisioning::with_seeds(vec![SessionSeed::new(identity())]));
    let node = LnsNode::builder(config)
        .provisioning(provisioning)
        .retry_policy(RetryPolicy::immediate(8))
        .build()
        .unwrap();

    let outcome = node
        .dispatcher()
        .dispatch(
            UplinkFrame {
                dev_addr: identity().dev_addr,
                fcnt_up: 12,
                confirmed: true,
                adr_requested: false,
                payload: vec![0x42],
            },
            RadioMetadata {
                arrival: Utc::now(),
                frequency_mhz: 868.5,
                data_rate: 5,
                rssi: -90.0,
                snr: 4.0,
                gateway_id: "gw-1".to_string(),
            },
        )
        .wait()
        .await;

    assert!(matches!(outcome, UplinkOutcome::TransientFailure(_)));
    assert_eq!(fake.hits(), 9);

    let session = node.registry().get_or_create(identity().dev_addr).await.unwrap();
    let state = session.begin_coordination().await;
    assert_eq!(state.fcnt_up, 0);
    assert_eq!(state.fcnt_down, 0);
}

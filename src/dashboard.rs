//! Read-only HTTP dashboard.
//!
//! A thin JSON facade over the relay: every endpoint answers `GET` by
//! querying streams and heartbeat keys, never by writing. Handlers are
//! infallible at the HTTP layer; when the relay cannot be reached the
//! payload carries `"state": "error"` instead of a 5xx, so a browser
//! poller keeps rendering.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::info;

use crate::bus::{BusClient, Entry};
use crate::config::ObsConfig;
use crate::error::{BusError, Result};
use crate::protocol::{data_stream, heartbeat_key, now_ms, status_stream, StatusRecord};

/// Shared handler context.
pub struct DashContext {
    client: BusClient,
    target: String,
    sensors: Vec<String>,
    stale: Duration,
}

impl DashContext {
    pub fn from_config(config: &ObsConfig) -> Self {
        Self {
            client: BusClient::new(config.bus.clone()),
            target: config.ground.target.clone(),
            sensors: config.station.sensors.clone(),
            stale: config.dashboard.stale,
        }
    }
}

/// Bind the configured address and serve until the process exits.
pub async fn serve(config: &ObsConfig) -> Result<()> {
    let ctx = Arc::new(DashContext::from_config(config));
    let router = build_router(ctx);
    let listener = tokio::net::TcpListener::bind(&config.dashboard.addr).await?;
    info!(addr = %listener.local_addr()?, "dashboard listening");
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<DashContext>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/sensors", get(sensors))
        .route("/api/correlator", get(correlator))
        .route("/api/health", get(health))
        .with_state(ctx)
}

/// Last station answer plus the live heartbeat flag.
async fn status(State(ctx): State<Arc<DashContext>>) -> Json<Value> {
    let last = match ctx.client.last(&status_stream(&ctx.target)).await {
        Ok(last) => last,
        Err(e) => return relay_error(&e),
    };
    let alive = match ctx.client.is_alive(&heartbeat_key(&ctx.target)).await {
        Ok(alive) => alive,
        Err(e) => return relay_error(&e),
    };
    let status = last
        .as_ref()
        .and_then(|entry| StatusRecord::from_fields(&entry.fields).ok());
    Json(json!({
        "state": "ok",
        "target": ctx.target,
        "alive": alive,
        "status": status,
        "fetched_at": fetched_at(),
    }))
}

/// Latest reading per configured sensor, with staleness judged against
/// the reading's own timestamp.
async fn sensors(State(ctx): State<Arc<DashContext>>) -> Json<Value> {
    let now = now_ms();
    let mut readings = Vec::with_capacity(ctx.sensors.len());
    for sensor in &ctx.sensors {
        match ctx.client.last(&data_stream(sensor)).await {
            Ok(Some(entry)) => {
                let age_ms = reading_age_ms(&entry, now);
                readings.push(json!({
                    "sensor": sensor,
                    "value": entry.fields.get("value").and_then(|v| v.parse::<f64>().ok()),
                    "unit": entry.fields.get("unit"),
                    "age_ms": age_ms,
                    "stale": is_stale(age_ms, ctx.stale),
                }));
            }
            Ok(None) => readings.push(json!({
                "sensor": sensor,
                "value": Value::Null,
                "stale": true,
            })),
            Err(e) => return relay_error(&e),
        }
    }
    Json(json!({
        "state": "ok",
        "sensors": readings,
        "fetched_at": fetched_at(),
    }))
}

/// Correlator parameters as last applied by the station.
async fn correlator(State(ctx): State<Arc<DashContext>>) -> Json<Value> {
    match ctx.client.last(&data_stream("corr")).await {
        Ok(entry) => Json(json!({
            "state": "ok",
            "configured": entry.is_some(),
            "params": entry.map(|e| e.fields),
            "fetched_at": fetched_at(),
        })),
        Err(e) => relay_error(&e),
    }
}

/// One-word verdict for monitoring, worst condition first.
async fn health(State(ctx): State<Arc<DashContext>>) -> Json<Value> {
    let relay = ctx.client.ping().await.is_ok();
    let mut station = false;
    let mut fresh = 0usize;
    if relay {
        station = ctx
            .client
            .is_alive(&heartbeat_key(&ctx.target))
            .await
            .unwrap_or(false);
        let now = now_ms();
        for sensor in &ctx.sensors {
            if let Ok(Some(entry)) = ctx.client.last(&data_stream(sensor)).await {
                if !is_stale(reading_age_ms(&entry, now), ctx.stale) {
                    fresh += 1;
                }
            }
        }
    }
    let total = ctx.sensors.len();
    Json(json!({
        "health": aggregate_health(relay, station, fresh, total),
        "relay": relay,
        "station_alive": station,
        "sensors_fresh": fresh,
        "sensors_total": total,
        "fetched_at": fetched_at(),
    }))
}

/// `error` without the relay, `disconnected` without the station
/// heartbeat, `degraded` while any sensor is stale.
fn aggregate_health(relay: bool, station: bool, fresh: usize, total: usize) -> &'static str {
    if !relay {
        "error"
    } else if !station {
        "disconnected"
    } else if fresh < total {
        "degraded"
    } else {
        "healthy"
    }
}

fn reading_age_ms(entry: &Entry, now: u64) -> Option<u64> {
    let read_at = entry.fields.get("read_at")?.parse::<u64>().ok()?;
    Some(now.saturating_sub(read_at))
}

/// Missing or unparsable timestamps count as stale.
fn is_stale(age_ms: Option<u64>, stale: Duration) -> bool {
    match age_ms {
        Some(age) => u128::from(age) > stale.as_millis(),
        None => true,
    }
}

fn relay_error(e: &BusError) -> Json<Value> {
    Json(json!({
        "state": "error",
        "error": e.to_string(),
        "fetched_at": fetched_at(),
    }))
}

fn fetched_at() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusClientConfig, Fields, RelayServer};
    use crate::hardware::SensorReading;
    use crate::protocol::sensor_fields;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[test]
    fn health_verdict_ordering() {
        assert_eq!(aggregate_health(false, true, 2, 2), "error");
        assert_eq!(aggregate_health(true, false, 2, 2), "disconnected");
        assert_eq!(aggregate_health(true, true, 1, 2), "degraded");
        assert_eq!(aggregate_health(true, true, 2, 2), "healthy");
        assert_eq!(aggregate_health(true, true, 0, 0), "healthy");
    }

    #[test]
    fn staleness_handles_missing_timestamps() {
        assert!(is_stale(None, Duration::from_secs(30)));
        assert!(is_stale(Some(31_000), Duration::from_secs(30)));
        assert!(!is_stale(Some(2_000), Duration::from_secs(30)));
    }

    async fn rig() -> (tokio::task::JoinHandle<()>, BusClient, Arc<DashContext>) {
        let relay = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = relay.local_addr().unwrap().to_string();
        let server = tokio::spawn(relay.run());
        let cfg = BusClientConfig {
            addr,
            retries: 0,
            ..BusClientConfig::default()
        };
        let client = BusClient::new(cfg.clone());
        let ctx = Arc::new(DashContext {
            client: BusClient::new(cfg),
            target: "station".to_string(),
            sensors: vec!["therm_lna".to_string()],
            stale: Duration::from_secs(30),
        });
        (server, client, ctx)
    }

    async fn get_json(router: &Router, uri: &str) -> Value {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_reports_last_answer_and_liveness() {
        let (server, client, ctx) = rig().await;
        let mut fields = Fields::new();
        fields.insert("sequence".to_string(), "7".to_string());
        fields.insert("result".to_string(), "ok".to_string());
        client.publish("status:station", &fields).await.unwrap();
        client
            .refresh_heartbeat("heartbeat:station", Duration::from_secs(5))
            .await
            .unwrap();

        let router = build_router(ctx);
        let body = get_json(&router, "/api/status").await;
        assert_eq!(body["state"], "ok");
        assert_eq!(body["alive"], true);
        assert_eq!(body["status"]["sequence"], 7);
        server.abort();
    }

    #[tokio::test]
    async fn sensors_flag_fresh_and_missing_readings() {
        let (server, client, ctx) = rig().await;
        let reading = SensorReading {
            sensor: "therm_lna".to_string(),
            value: 28.25,
            unit: "C".to_string(),
            read_at: now_ms(),
        };
        client
            .publish("data:therm_lna", &sensor_fields(&reading))
            .await
            .unwrap();

        let router = build_router(ctx);
        let body = get_json(&router, "/api/sensors").await;
        assert_eq!(body["state"], "ok");
        let first = &body["sensors"][0];
        assert_eq!(first["sensor"], "therm_lna");
        assert_eq!(first["stale"], false);
        assert!((first["value"].as_f64().unwrap() - 28.25).abs() < 1e-6);
        server.abort();
    }

    #[tokio::test]
    async fn health_walks_the_verdicts() {
        let (server, client, ctx) = rig().await;
        let router = build_router(ctx);

        let body = get_json(&router, "/api/health").await;
        assert_eq!(body["health"], "disconnected");

        client
            .refresh_heartbeat("heartbeat:station", Duration::from_secs(5))
            .await
            .unwrap();
        let body = get_json(&router, "/api/health").await;
        assert_eq!(body["health"], "degraded");

        let reading = SensorReading {
            sensor: "therm_lna".to_string(),
            value: 28.0,
            unit: "C".to_string(),
            read_at: now_ms(),
        };
        client
            .publish("data:therm_lna", &sensor_fields(&reading))
            .await
            .unwrap();
        let body = get_json(&router, "/api/health").await;
        assert_eq!(body["health"], "healthy");
        server.abort();
    }

    #[tokio::test]
    async fn unreachable_relay_degrades_without_5xx() {
        let ctx = Arc::new(DashContext {
            client: BusClient::new(BusClientConfig {
                addr: "127.0.0.1:1".to_string(),
                retries: 0,
                timeout: Duration::from_millis(200),
                ..BusClientConfig::default()
            }),
            target: "station".to_string(),
            sensors: vec!["therm_lna".to_string()],
            stale: Duration::from_secs(30),
        });
        let router = build_router(ctx);

        let body = get_json(&router, "/api/status").await;
        assert_eq!(body["state"], "error");
        assert!(body["error"].as_str().is_some());

        let body = get_json(&router, "/api/health").await;
        assert_eq!(body["health"], "error");
        assert_eq!(body["relay"], false);
    }
}

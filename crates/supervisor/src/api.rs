//! HTTP client for the hardware backend. Every call carries its own timeout;
//! a request that exceeds it is treated as failed, never left to hang.
//! Command endpoints report through [`CommandOutcome`] so start and cancel
//! share one rollback path instead of per-call-site error branches.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::warn;

use crate::schedule::{Zone, ZoneId};
use crate::state::{RunKind, ZoneRuntime};

// ---------------------------------------------------------------------------
// Command results
// ---------------------------------------------------------------------------

/// Uniform result for start/cancel commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok,
    /// Timeout or transport failure; the backend may never have seen it.
    Transient(String),
    /// The backend saw the command and said no.
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireZoneStatus {
    active: bool,
    #[serde(default)]
    remaining: u32,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Serialize)]
struct ManualTimerBody {
    duration: u32,
}

#[derive(Debug, Serialize)]
struct ResolveTimesBody<'a> {
    codes: &'a [String],
    date: String,
    lat: f64,
    lon: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsPayload {
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    /// Legacy ordered pair, `[lon, lat]`.
    pub coords: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    /// Prefer the explicit fields; fall back to the legacy `[lon, lat]` pair.
    /// The legacy order is lon first, not lat first.
    pub fn from_settings(s: &SettingsPayload) -> Option<Self> {
        if let (Some(lat), Some(lon)) = (s.gps_lat, s.gps_lon) {
            return Some(Self { lat, lon });
        }
        match s.coords.as_deref() {
            Some([lon, lat]) => Some(Self {
                lat: *lat,
                lon: *lon,
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    /// Status/schedule/settings/resolver/log calls.
    read_timeout: Duration,
    /// Start/cancel commands.
    command_timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str, read_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_string(),
            read_timeout,
            command_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    /// Ground-truth poll target: `GET zones/status`.
    pub async fn zone_status(&self) -> Result<HashMap<ZoneId, ZoneRuntime>> {
        let raw: HashMap<String, WireZoneStatus> = self
            .http
            .get(self.url("zones/status"))
            .timeout(self.read_timeout)
            .send()
            .await
            .context("zones/status request failed")?
            .error_for_status()
            .context("zones/status returned an error")?
            .json()
            .await
            .context("zones/status body was not valid JSON")?;

        let mut out = HashMap::with_capacity(raw.len());
        for (key, ws) in raw {
            let Ok(id) = key.parse::<ZoneId>() else {
                warn!(key = %key, "zones/status: skipping non-numeric zone key");
                continue;
            };
            out.insert(
                id,
                ZoneRuntime {
                    active: ws.active,
                    remaining: ws.remaining,
                    kind: RunKind::from(ws.kind.as_deref()),
                },
            );
        }
        Ok(out)
    }

    /// Schedule definitions: `GET schedule`.
    pub async fn fetch_schedule(&self) -> Result<Vec<Zone>> {
        self.http
            .get(self.url("schedule"))
            .timeout(self.read_timeout)
            .send()
            .await
            .context("schedule request failed")?
            .error_for_status()
            .context("schedule returned an error")?
            .json()
            .await
            .context("schedule body was not valid JSON")
    }

    /// Coordinate source: `GET settings`.
    pub async fn fetch_settings(&self) -> Result<SettingsPayload> {
        self.http
            .get(self.url("settings"))
            .timeout(self.read_timeout)
            .send()
            .await
            .context("settings request failed")?
            .error_for_status()
            .context("settings returned an error")?
            .json()
            .await
            .context("settings body was not valid JSON")
    }

    /// Solar/legacy time resolution. The response is positional, aligned to
    /// the `codes` input order.
    pub async fn resolve_times(
        &self,
        codes: &[String],
        date: NaiveDate,
        coords: Coordinates,
    ) -> Result<Vec<String>> {
        let body = ResolveTimesBody {
            codes,
            date: date.format("%Y-%m-%d").to_string(),
            lat: coords.lat,
            lon: coords.lon,
        };
        self.http
            .post(self.url("resolve_times"))
            .timeout(self.read_timeout)
            .json(&body)
            .send()
            .await
            .context("resolve_times request failed")?
            .error_for_status()
            .context("resolve_times returned an error")?
            .json()
            .await
            .context("resolve_times body was not valid JSON")
    }

    /// Start command: `POST manual-timer/{zone}`.
    pub async fn start_timer(&self, zone: ZoneId, duration_secs: u32) -> CommandOutcome {
        let result = self
            .http
            .post(self.url(&format!("manual-timer/{zone}")))
            .timeout(self.command_timeout)
            .json(&ManualTimerBody {
                duration: duration_secs,
            })
            .send()
            .await;
        Self::command_outcome(result)
    }

    /// Cancel command: `DELETE manual-timer/{zone}`.
    pub async fn cancel_timer(&self, zone: ZoneId) -> CommandOutcome {
        let result = self
            .http
            .delete(self.url(&format!("manual-timer/{zone}")))
            .timeout(self.command_timeout)
            .send()
            .await;
        Self::command_outcome(result)
    }

    /// Mismatch logging sink: `POST logs/event`. Fire-and-forget; failures
    /// are swallowed after a local warning.
    pub async fn log_event(&self, event: serde_json::Value) {
        let result = self
            .http
            .post(self.url("logs/event"))
            .timeout(self.read_timeout)
            .json(&event)
            .send()
            .await;
        if let Err(e) = result {
            warn!("logs/event post failed: {e}");
        }
    }

    fn command_outcome(result: reqwest::Result<reqwest::Response>) -> CommandOutcome {
        match result {
            Ok(resp) if resp.status().is_success() => CommandOutcome::Ok,
            Ok(resp) => CommandOutcome::Rejected(format!("backend returned {}", resp.status())),
            Err(e) => CommandOutcome::Transient(e.to_string()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    /// Bind a throwaway backend on an ephemeral port and return its base URL.
    async fn spawn_backend(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: &str) -> ApiClient {
        ApiClient::new(base, Duration::from_secs(2), Duration::from_secs(2))
    }

    // -- zone_status ---------------------------------------------------------

    #[tokio::test]
    async fn zone_status_parses_ground_truth() {
        let router = Router::new().route(
            "/zones/status",
            get(|| async {
                Json(serde_json::json!({
                    "1": {"active": true, "remaining": 120, "type": "manual"},
                    "2": {"active": false, "remaining": 0},
                    "bogus": {"active": false, "remaining": 0}
                }))
            }),
        );
        let base = spawn_backend(router).await;

        let status = client(&base).zone_status().await.unwrap();
        assert_eq!(status.len(), 2);
        assert!(status[&1].active);
        assert_eq!(status[&1].remaining, 120);
        assert_eq!(status[&1].kind, RunKind::Manual);
        assert_eq!(status[&2].kind, RunKind::Unknown);
    }

    // -- commands ------------------------------------------------------------

    #[tokio::test]
    async fn start_timer_success_is_ok() {
        let router = Router::new().route(
            "/manual-timer/{id}",
            post(|Path(id): Path<u32>, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(id, 3);
                assert_eq!(body["duration"], 600);
                StatusCode::OK
            }),
        );
        let base = spawn_backend(router).await;

        assert_eq!(client(&base).start_timer(3, 600).await, CommandOutcome::Ok);
    }

    #[tokio::test]
    async fn start_timer_5xx_is_rejected() {
        let router = Router::new().route(
            "/manual-timer/{id}",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = spawn_backend(router).await;

        let outcome = client(&base).start_timer(3, 600).await;
        assert!(matches!(outcome, CommandOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn cancel_timer_unreachable_is_transient() {
        // Nothing is listening on this port.
        let c = ApiClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(300),
            Duration::from_millis(300),
        );
        let outcome = c.cancel_timer(3).await;
        assert!(matches!(outcome, CommandOutcome::Transient(_)));
    }

    #[tokio::test]
    async fn cancel_timer_success_is_ok() {
        let router = Router::new().route(
            "/manual-timer/{id}",
            delete(|Path(id): Path<u32>| async move {
                assert_eq!(id, 7);
                StatusCode::NO_CONTENT
            }),
        );
        let base = spawn_backend(router).await;

        assert_eq!(client(&base).cancel_timer(7).await, CommandOutcome::Ok);
    }

    // -- resolver ------------------------------------------------------------

    #[tokio::test]
    async fn resolve_times_round_trips_positionally() {
        let router = Router::new().route(
            "/resolve_times",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["codes"], serde_json::json!(["sunrise", "sunset"]));
                assert_eq!(body["date"], "2026-08-29");
                Json(serde_json::json!(["06:21", "19:42"]))
            }),
        );
        let base = spawn_backend(router).await;

        let codes = vec!["sunrise".to_string(), "sunset".to_string()];
        let times = client(&base)
            .resolve_times(
                &codes,
                NaiveDate::from_ymd_opt(2026, 8, 29).unwrap(),
                Coordinates {
                    lat: 37.7,
                    lon: -122.4,
                },
            )
            .await
            .unwrap();
        assert_eq!(times, vec!["06:21", "19:42"]);
    }

    // -- coordinates ---------------------------------------------------------

    #[test]
    fn coordinates_prefer_explicit_fields() {
        let s = SettingsPayload {
            gps_lat: Some(37.7),
            gps_lon: Some(-122.4),
            coords: Some(vec![1.0, 2.0]),
        };
        assert_eq!(
            Coordinates::from_settings(&s),
            Some(Coordinates {
                lat: 37.7,
                lon: -122.4
            })
        );
    }

    #[test]
    fn coordinates_legacy_pair_is_lon_first() {
        // Legacy payloads carry [lon, lat]; swapping them puts the zone in
        // the wrong hemisphere.
        let s = SettingsPayload {
            gps_lat: None,
            gps_lon: None,
            coords: Some(vec![-122.4, 37.7]),
        };
        assert_eq!(
            Coordinates::from_settings(&s),
            Some(Coordinates {
                lat: 37.7,
                lon: -122.4
            })
        );
    }

    #[test]
    fn coordinates_absent_everywhere_is_none() {
        assert_eq!(Coordinates::from_settings(&SettingsPayload::default()), None);
    }

    #[test]
    fn coordinates_malformed_legacy_pair_is_none() {
        let s = SettingsPayload {
            gps_lat: None,
            gps_lon: None,
            coords: Some(vec![-122.4]),
        };
        assert_eq!(Coordinates::from_settings(&s), None);
    }
}

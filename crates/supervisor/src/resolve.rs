//! Schedule time resolution: maps solar keywords and legacy numeric codes to
//! concrete `HH:MM` wall-clock times via the backend resolver, against a date
//! and the site's coordinates. Literal `HH:MM` codes never leave the client.
//!
//! Two cache scopes: per-zone "today" resolutions, and per-`(date, code)`
//! resolutions for future weekly/monthly occurrences. Absent = unresolved,
//! `"N/A"` = resolver had no answer, `"..."` = in flight / unknown.

use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::api::{ApiClient, Coordinates};
use crate::schedule::{literal_minutes, ZoneId};

/// Resolver had no answer for this code.
pub const NOT_AVAILABLE: &str = "N/A";
/// Resolution in flight or unknown.
pub const UNKNOWN: &str = "...";

/// False exactly for a literal `HH:MM` with valid ranges; empty codes have
/// nothing to resolve either.
pub fn needs_resolution(code: &str) -> bool {
    !code.is_empty() && literal_minutes(code).is_none()
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct TimeResolver {
    client: ApiClient,
    /// Per-zone cache of today's resolutions, raw code -> `HH:MM` / `N/A`.
    today: HashMap<ZoneId, HashMap<String, String>>,
    /// Per-date cache for future occurrences.
    by_date: HashMap<(NaiveDate, String), String>,
}

impl TimeResolver {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            today: HashMap::new(),
            by_date: HashMap::new(),
        }
    }

    /// Drop the per-zone day caches (call at local midnight rollover, or when
    /// the schedule changes under a zone).
    pub fn invalidate_today(&mut self, zone: ZoneId) {
        self.today.remove(&zone);
    }

    /// Resolve all of a zone's codes for today. Codes needing resolution are
    /// batched into one request; literals merge into the result unchanged.
    /// On resolver failure the needing codes are simply absent; downstream
    /// treats absence as `N/A`.
    pub async fn resolve_for_today(
        &mut self,
        zone: ZoneId,
        codes: &[String],
        today: NaiveDate,
        coords: Coordinates,
    ) -> HashMap<String, String> {
        let mut result: HashMap<String, String> = HashMap::new();
        let mut wanted: Vec<String> = Vec::new();
        {
            let cache = self.today.entry(zone).or_default();
            for code in codes {
                if !needs_resolution(code) {
                    if !code.is_empty() {
                        result.insert(code.clone(), code.clone());
                    }
                } else if let Some(hit) = cache.get(code) {
                    result.insert(code.clone(), hit.clone());
                } else if !wanted.contains(code) {
                    wanted.push(code.clone());
                }
            }
        }

        if wanted.is_empty() {
            return result;
        }

        match self.client.resolve_times(&wanted, today, coords).await {
            Ok(times) => {
                // Positional response, aligned to the request order. A short
                // response leaves the tail unresolved.
                let cache = self.today.entry(zone).or_default();
                for (code, time) in wanted.iter().zip(times) {
                    // Anything that is not a usable time is "no answer".
                    let time = if literal_minutes(&time).is_some() {
                        time
                    } else {
                        NOT_AVAILABLE.to_string()
                    };
                    cache.insert(code.clone(), time.clone());
                    result.insert(code.clone(), time);
                }
                debug!(zone, resolved = wanted.len(), "today codes resolved");
            }
            Err(e) => {
                warn!(zone, "resolve_times failed: {e:#}");
            }
        }

        result
    }

    /// Resolve a single code for a concrete future date (weekly/monthly
    /// occurrences). Never propagates an error: falls back through the
    /// `(date, code)` cache, then the zone's today cache, then `"..."`.
    /// A non-time answer from the resolver is recorded as `"N/A"`.
    pub async fn resolve_for_date(
        &mut self,
        zone: ZoneId,
        code: &str,
        date: NaiveDate,
        coords: Coordinates,
    ) -> String {
        if !needs_resolution(code) {
            return code.to_string();
        }

        let key = (date, code.to_string());
        if let Some(hit) = self.by_date.get(&key) {
            return hit.clone();
        }

        let codes = [code.to_string()];
        match self.client.resolve_times(&codes, date, coords).await {
            Ok(times) if !times.is_empty() => {
                let raw = times.into_iter().next().unwrap_or_default();
                let time = if literal_minutes(&raw).is_some() {
                    raw
                } else {
                    NOT_AVAILABLE.to_string()
                };
                self.by_date.insert(key, time.clone());
                time
            }
            Ok(_) => {
                warn!(zone, code, %date, "resolver returned an empty response");
                self.fallback(zone, code)
            }
            Err(e) => {
                warn!(zone, code, %date, "resolve_times failed: {e:#}");
                self.fallback(zone, code)
            }
        }
    }

    fn fallback(&self, zone: ZoneId, code: &str) -> String {
        self.today
            .get(&zone)
            .and_then(|c| c.get(code))
            .cloned()
            .unwrap_or_else(|| UNKNOWN.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::Duration;

    const SITE: Coordinates = Coordinates {
        lat: 37.7,
        lon: -122.4,
    };

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 29).unwrap()
    }

    async fn spawn_backend(router: Router) -> ApiClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        ApiClient::new(
            &format!("http://{addr}"),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
    }

    /// Resolver that answers every code with "07:11" and counts requests.
    async fn counting_resolver(hits: Arc<AtomicUsize>) -> ApiClient {
        let router = Router::new().route(
            "/resolve_times",
            post(move |Json(body): Json<serde_json::Value>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let n = body["codes"].as_array().map(|a| a.len()).unwrap_or(0);
                    Json(serde_json::json!(vec!["07:11"; n]))
                }
            }),
        );
        spawn_backend(router).await
    }

    // -- needs_resolution ----------------------------------------------------

    #[test]
    fn literal_needs_no_resolution() {
        assert!(!needs_resolution("06:30"));
        assert!(!needs_resolution("23:59"));
    }

    #[test]
    fn solar_and_legacy_codes_need_resolution() {
        assert!(needs_resolution("sunrise"));
        assert!(needs_resolution("sunset"));
        assert!(needs_resolution("063000"));
        assert!(needs_resolution("25:00"));
    }

    #[test]
    fn empty_code_needs_no_resolution() {
        assert!(!needs_resolution(""));
    }

    // -- resolve_for_today ---------------------------------------------------

    #[tokio::test]
    async fn today_literal_passes_through_unchanged() {
        // No backend needed: a literal resolves to itself even with the
        // resolver unreachable.
        let client = ApiClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let mut r = TimeResolver::new(client);
        let map = r
            .resolve_for_today(1, &["06:30".to_string()], day(), SITE)
            .await;
        assert_eq!(map.get("06:30").map(String::as_str), Some("06:30"));
    }

    #[tokio::test]
    async fn today_batches_and_merges() {
        let hits = Arc::new(AtomicUsize::new(0));
        let client = counting_resolver(hits.clone()).await;
        let mut r = TimeResolver::new(client);

        let codes = vec![
            "06:30".to_string(),
            "sunrise".to_string(),
            "sunset".to_string(),
        ];
        let map = r.resolve_for_today(1, &codes, day(), SITE).await;

        // One request for the two non-literal codes.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(map.get("06:30").map(String::as_str), Some("06:30"));
        assert_eq!(map.get("sunrise").map(String::as_str), Some("07:11"));
        assert_eq!(map.get("sunset").map(String::as_str), Some("07:11"));
    }

    #[tokio::test]
    async fn today_cache_avoids_second_request() {
        let hits = Arc::new(AtomicUsize::new(0));
        let client = counting_resolver(hits.clone()).await;
        let mut r = TimeResolver::new(client);

        let codes = vec!["sunrise".to_string()];
        r.resolve_for_today(1, &codes, day(), SITE).await;
        let map = r.resolve_for_today(1, &codes, day(), SITE).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(map.get("sunrise").map(String::as_str), Some("07:11"));
    }

    #[tokio::test]
    async fn today_failure_leaves_codes_absent() {
        let router = Router::new().route(
            "/resolve_times",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let client = spawn_backend(router).await;
        let mut r = TimeResolver::new(client);

        let codes = vec!["06:30".to_string(), "sunset".to_string()];
        let map = r.resolve_for_today(1, &codes, day(), SITE).await;

        assert_eq!(map.get("06:30").map(String::as_str), Some("06:30"));
        assert!(!map.contains_key("sunset"));
    }

    #[tokio::test]
    async fn today_na_answer_is_kept() {
        let router = Router::new().route(
            "/resolve_times",
            post(|| async { Json(serde_json::json!(["N/A"])) }),
        );
        let client = spawn_backend(router).await;
        let mut r = TimeResolver::new(client);

        let map = r
            .resolve_for_today(1, &["sunset".to_string()], day(), SITE)
            .await;
        assert_eq!(map.get("sunset").map(String::as_str), Some(NOT_AVAILABLE));
    }

    // -- resolve_for_date ----------------------------------------------------

    #[tokio::test]
    async fn date_resolution_cached_per_date_and_code() {
        let hits = Arc::new(AtomicUsize::new(0));
        let client = counting_resolver(hits.clone()).await;
        let mut r = TimeResolver::new(client);

        let d1 = day();
        let d2 = day() + chrono::Duration::days(7);

        assert_eq!(r.resolve_for_date(1, "sunrise", d1, SITE).await, "07:11");
        assert_eq!(r.resolve_for_date(1, "sunrise", d1, SITE).await, "07:11");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A different date is a different key.
        assert_eq!(r.resolve_for_date(1, "sunrise", d2, SITE).await, "07:11");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn date_non_time_answer_normalized() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let router = Router::new().route(
            "/resolve_times",
            post(move |_: Json<serde_json::Value>| {
                let hits = hits2.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!(["soon"]))
                }
            }),
        );
        let client = spawn_backend(router).await;
        let mut r = TimeResolver::new(client);

        let got = r.resolve_for_date(2, "sunset", day(), SITE).await;
        assert_eq!(got, NOT_AVAILABLE);

        // The sanitized answer is what got cached.
        assert_eq!(r.resolve_for_date(2, "sunset", day(), SITE).await, NOT_AVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn date_failure_falls_back_to_today_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let client = counting_resolver(hits.clone()).await;
        let mut r = TimeResolver::new(client);

        // Seed the today cache, then point at a dead backend.
        r.resolve_for_today(1, &["sunset".to_string()], day(), SITE)
            .await;
        r.client = ApiClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(200),
            Duration::from_millis(200),
        );

        let got = r
            .resolve_for_date(1, "sunset", day() + chrono::Duration::days(3), SITE)
            .await;
        assert_eq!(got, "07:11");
    }

    #[tokio::test]
    async fn date_failure_with_no_cache_is_unknown() {
        let client = ApiClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let mut r = TimeResolver::new(client);

        let got = r.resolve_for_date(9, "sunrise", day(), SITE).await;
        assert_eq!(got, UNKNOWN);
    }

    #[tokio::test]
    async fn date_literal_passes_through() {
        let client = ApiClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let mut r = TimeResolver::new(client);

        // Regardless of resolver availability, "06:30" resolves to itself.
        assert_eq!(r.resolve_for_date(1, "06:30", day(), SITE).await, "06:30");
    }
}

//! Periodic tasks. Each is `tokio::spawn`-ed from main and owns one concern:
//! the status poll is the single point where ground truth enters the system,
//! the schedule watcher feeds resolutions and synthesizes imminent scheduled
//! starts, the pump aggregator derives the shared pump flag, and the sweep
//! bounds the pending registry.
//!
//! Every loop awaits its work sequentially on one interval, so two polls of
//! the same kind can never overlap; a slow request dies by its own timeout
//! rather than queueing behind the next tick.

use chrono::{Local, Utc};
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, Coordinates};
use crate::reconcile::{self, MismatchAlert, Thresholds};
use crate::resolve::TimeResolver;
use crate::schedule::Period;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Status poll
// ---------------------------------------------------------------------------

/// Poll ground truth for all zones and reconcile. Transport failure means
/// "no update this tick": prior runtime is retained and only the
/// reachability flag (plus one transition event) changes.
pub async fn run_status_poll(
    client: ApiClient,
    shared: SharedState,
    thresholds: Thresholds,
    period: Duration,
) {
    let mut ticker = interval(period);
    info!(period_sec = period.as_secs(), "status poller started");

    loop {
        ticker.tick().await;

        match client.zone_status().await {
            Ok(polled) => {
                let alerts = {
                    let mut st = shared.write().await;
                    if !st.backend_reachable {
                        st.record_system("backend reachable again".to_string());
                    }
                    reconcile::apply_poll(&mut st, polled, &thresholds, Instant::now(), Utc::now())
                };
                for alert in alerts {
                    escalate(&client, alert).await;
                }
            }
            Err(e) => {
                warn!("status poll failed: {e:#}");
                let mut st = shared.write().await;
                if st.backend_reachable {
                    st.record_poll_failure(format!("status poll failed: {e:#}"));
                } else {
                    st.backend_reachable = false;
                }
            }
        }
    }
}

/// Ship one sustained-mismatch escalation: a local CRITICAL-level log plus a
/// fire-and-forget remote event.
async fn escalate(client: &ApiClient, alert: MismatchAlert) {
    error!(
        zone = alert.zone,
        elapsed_sec = alert.elapsed_secs,
        expected_active = alert.expected_active,
        "CRITICAL: hardware has not confirmed expected state"
    );
    let event = serde_json::json!({
        "level": "CRITICAL",
        "source": "zone-supervisor",
        "zone": alert.zone,
        "elapsed_sec": alert.elapsed_secs,
        "message": format!(
            "zone {} expected {} but hardware disagrees after {}s",
            alert.zone,
            if alert.expected_active { "active" } else { "inactive" },
            alert.elapsed_secs
        ),
    });
    // Failures are swallowed inside log_event; losing a log line must never
    // stall the poll loop's caller.
    let client = client.clone();
    tokio::spawn(async move { client.log_event(event).await });
}

// ---------------------------------------------------------------------------
// Schedule watcher
// ---------------------------------------------------------------------------

/// Refresh zone definitions and today-resolutions on a slow cadence, and
/// check for imminent scheduled starts on a fast one.
pub async fn run_schedule_watcher(
    client: ApiClient,
    shared: SharedState,
    thresholds: Thresholds,
    check_period: Duration,
    refresh_period: Duration,
) {
    let mut resolver = TimeResolver::new(client.clone());
    let mut coords: Option<Coordinates> = None;
    let mut last_refresh: Option<Instant> = None;
    let mut last_date = Local::now().date_naive();

    let mut ticker = interval(check_period);
    info!(
        check_sec = check_period.as_secs(),
        refresh_sec = refresh_period.as_secs(),
        "schedule watcher started"
    );

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let today = Local::now().date_naive();

        // Midnight rollover: yesterday's resolutions no longer apply.
        if today != last_date {
            last_date = today;
            let zone_ids: Vec<u32> = {
                let st = shared.read().await;
                st.zones.iter().map(|z| z.zone_id).collect()
            };
            for id in &zone_ids {
                resolver.invalidate_today(*id);
            }
            shared.write().await.resolved_today.clear();
            last_refresh = None;
            debug!("date rolled over, today caches dropped");
        }

        let due = last_refresh
            .map(|t| now.duration_since(t) >= refresh_period)
            .unwrap_or(true);
        if due {
            refresh(&client, &shared, &mut resolver, &mut coords, today).await;
            last_refresh = Some(now);
        }

        let synthesized = {
            let mut st = shared.write().await;
            reconcile::detect_scheduled_starts(
                &mut st,
                &thresholds,
                Instant::now(),
                Local::now().naive_local(),
                Utc::now(),
            )
        };
        if synthesized > 0 {
            debug!(count = synthesized, "scheduled starts now pending");
        }
    }
}

async fn refresh(
    client: &ApiClient,
    shared: &SharedState,
    resolver: &mut TimeResolver,
    coords: &mut Option<Coordinates>,
    today: chrono::NaiveDate,
) {
    match client.fetch_schedule().await {
        Ok(zones) => {
            debug!(zones = zones.len(), "schedule refreshed");
            shared.write().await.zones = zones;
        }
        Err(e) => warn!("schedule refresh failed: {e:#}"),
    }

    match client.fetch_settings().await {
        Ok(settings) => *coords = Coordinates::from_settings(&settings),
        Err(e) => warn!("settings fetch failed: {e:#}"),
    }

    let Some(site) = *coords else {
        debug!("no coordinates available, skipping time resolution");
        return;
    };

    let zones: Vec<crate::schedule::Zone> = shared.read().await.zones.clone();
    for z in zones {
        let codes: Vec<String> = z.slots.iter().map(|s| s.code.clone()).collect();
        let mut resolved = resolver.resolve_for_today(z.zone_id, &codes, today, site).await;

        // Weekly/monthly zones display their occurrence date's times, which
        // can differ from today's solar times.
        if z.period != Period::Daily {
            let occurrence =
                crate::schedule::next_occurrence_date(&z, &resolved, Local::now().naive_local());
            if let Some(date) = occurrence.filter(|d| *d != today) {
                for code in codes.iter().filter(|c| crate::resolve::needs_resolution(c)) {
                    let time = resolver.resolve_for_date(z.zone_id, code, date, site).await;
                    resolved.insert(code.clone(), time);
                }
            }
        }

        shared.write().await.resolved_today.insert(z.zone_id, resolved);
    }
}

// ---------------------------------------------------------------------------
// Pump aggregate
// ---------------------------------------------------------------------------

/// Any open valve implies the pump is drawing; recompute the shared flag.
pub async fn run_pump_aggregate(shared: SharedState, period: Duration) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        let mut st = shared.write().await;
        let on = st.runtime.values().any(|r| r.active);
        if on != st.pump_on {
            st.pump_on = on;
            info!(pump_on = on, "pump aggregate changed");
        }
    }
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// Bound the pending registry against lost confirmations.
pub async fn run_sweep(shared: SharedState, thresholds: Thresholds, period: Duration) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        let cleared = {
            let mut st = shared.write().await;
            reconcile::sweep(&mut st, &thresholds, Instant::now())
        };
        if cleared > 0 {
            info!(cleared, "sweep cleared stale pending entries");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

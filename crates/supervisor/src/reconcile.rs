//! Expected/actual reconciliation engine.
//!
//! The command dispatcher and the schedule watcher record *expected* zone
//! state optimistically; the status poller brings in ground truth. This
//! module compares the two on every poll tick, clears confirmed pending
//! entries, and escalates sustained disagreement.
//!
//! ## Per-zone observable states
//!
//! ```text
//! gray ──[command / imminent scheduled start]──▶ orange
//! orange ──[ground truth corroborates]──▶ green or gray
//! orange ──[pending_timeout elapsed]──▶ red  (escalation logged)
//! red / orange ──[error_ceiling elapsed, sweep]──▶ gray
//! ```
//!
//! The engine is pure over `(state, now)`: it returns escalation alerts for
//! the task layer to ship, and never touches the network itself.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::schedule::{literal_minutes, Period, ZoneId, ZoneMode};
use crate::state::{ExpectedKind, ExpectedZone, PendingEntry, SupervisorState, ZoneRuntime};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub pending_timeout: Duration,
    pub manual_grace: Duration,
    pub schedule_grace: Duration,
    pub error_ceiling: Duration,
}

impl Thresholds {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            pending_timeout: cfg.pending_timeout(),
            manual_grace: cfg.manual_grace(),
            schedule_grace: cfg.schedule_grace(),
            error_ceiling: cfg.error_ceiling(),
        }
    }

    /// Escalation milestones for a sustained mismatch: first detection at the
    /// pending timeout, then fixed marks, never once per tick.
    fn milestones(&self) -> Vec<Duration> {
        let mut marks = vec![
            self.pending_timeout,
            Duration::from_secs(60),
            Duration::from_secs(300),
        ];
        marks.sort_unstable();
        marks.dedup();
        marks
    }
}

/// A pending entry that crossed an escalation milestone this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MismatchAlert {
    pub zone: ZoneId,
    pub elapsed_secs: u64,
    pub expected_active: bool,
}

// ---------------------------------------------------------------------------
// Command-side transitions (rule 1)
// ---------------------------------------------------------------------------

/// Optimistically record a start command. Re-issuing on an already-pending
/// zone simply re-arms the expectation and restarts the pending clock.
pub fn record_start_command(
    st: &mut SupervisorState,
    zone: ZoneId,
    duration_secs: u32,
    now: Instant,
    wall: DateTime<Utc>,
) {
    st.expected.insert(
        zone,
        ExpectedZone {
            active: true,
            started_at: wall,
            ends_at: Some(wall + ChronoDuration::seconds(duration_secs as i64)),
            kind: ExpectedKind::Manual,
        },
    );
    st.pending.insert(zone, PendingEntry::new(now));
    st.record_command(format!("zone {zone}: manual start ({duration_secs}s) dispatched"));
}

/// Optimistically record a cancel command.
pub fn record_cancel_command(
    st: &mut SupervisorState,
    zone: ZoneId,
    now: Instant,
    wall: DateTime<Utc>,
) {
    st.expected.insert(
        zone,
        ExpectedZone {
            active: false,
            started_at: wall,
            ends_at: None,
            kind: ExpectedKind::Canceled,
        },
    );
    st.pending.insert(zone, PendingEntry::new(now));
    st.record_command(format!("zone {zone}: cancel dispatched"));
}

/// Undo an optimistic record after a failed command, restoring whatever the
/// zone carried beforehand.
pub fn rollback_command(
    st: &mut SupervisorState,
    zone: ZoneId,
    prior_expected: Option<ExpectedZone>,
    prior_pending: Option<PendingEntry>,
) {
    match prior_expected {
        Some(e) => {
            st.expected.insert(zone, e);
        }
        None => {
            st.expected.remove(&zone);
        }
    }
    match prior_pending {
        Some(p) => {
            st.pending.insert(zone, p);
        }
        None => {
            st.pending.remove(&zone);
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduled-start detection (rule 2)
// ---------------------------------------------------------------------------

/// Synthesize a pending expectation for zones whose computed start time is
/// within the schedule grace window of now, so schedule-triggered starts show
/// as pending just like manual ones. Returns how many were synthesized.
pub fn detect_scheduled_starts(
    st: &mut SupervisorState,
    thresholds: &Thresholds,
    now: Instant,
    wall_local: chrono::NaiveDateTime,
    wall_utc: DateTime<Utc>,
) -> usize {
    let grace = ChronoDuration::from_std(thresholds.schedule_grace)
        .unwrap_or_else(|_| ChronoDuration::seconds(60));
    let today = wall_local.date();
    let mut synthesized = 0;

    let candidates: Vec<(ZoneId, u32)> = st
        .zones
        .iter()
        .filter(|z| z.mode == ZoneMode::Active)
        .filter(|z| match z.period {
            Period::Daily => true,
            // Weekly/monthly only fire today when the anchor lands on today.
            Period::Weekly | Period::Monthly => {
                crate::schedule::next_occurrence_date(
                    z,
                    st.resolved_today.get(&z.zone_id).unwrap_or(&HashMap::new()),
                    wall_local,
                ) == Some(today)
            }
        })
        .flat_map(|z| {
            let empty = HashMap::new();
            let resolved = st.resolved_today.get(&z.zone_id).unwrap_or(&empty);
            z.slots
                .iter()
                .filter_map(|s| {
                    let m = literal_minutes(&s.code)
                        .or_else(|| resolved.get(&s.code).and_then(|t| literal_minutes(t)))?;
                    Some((z.zone_id, m, s.duration_secs))
                })
                .collect::<Vec<_>>()
        })
        .filter_map(|(id, minutes, duration)| {
            let start = today.and_hms_opt(minutes / 60, minutes % 60, 0)?;
            let delta = (start - wall_local).abs();
            (delta <= grace).then_some((id, duration))
        })
        .collect();

    for (id, duration_secs) in candidates {
        let already_expected_active = st.expected.get(&id).map(|e| e.active).unwrap_or(false);
        let already_active = st.runtime.get(&id).map(|r| r.active).unwrap_or(false);
        if already_expected_active || already_active {
            continue;
        }
        st.expected.insert(
            id,
            ExpectedZone {
                active: true,
                started_at: wall_utc,
                ends_at: Some(wall_utc + ChronoDuration::seconds(duration_secs as i64)),
                kind: ExpectedKind::Scheduled,
            },
        );
        st.pending.insert(id, PendingEntry::new(now));
        st.record_schedule(format!("zone {id}: scheduled start expected"));
        debug!(zone = id, "scheduled start window open, now pending");
        synthesized += 1;
    }

    synthesized
}

// ---------------------------------------------------------------------------
// Poll reconciliation (rules 3, 4, 5)
// ---------------------------------------------------------------------------

/// Merge one poll result and reconcile every zone against it. Returns the
/// escalation alerts that crossed a milestone this tick.
pub fn apply_poll(
    st: &mut SupervisorState,
    polled: HashMap<ZoneId, ZoneRuntime>,
    thresholds: &Thresholds,
    now: Instant,
    wall: DateTime<Utc>,
) -> Vec<MismatchAlert> {
    st.backend_reachable = true;
    for (id, rt) in polled {
        st.runtime.insert(id, rt);
    }

    let pending_zones: Vec<ZoneId> = st.pending.keys().copied().collect();
    let mut alerts = Vec::new();

    for id in pending_zones {
        let runtime = st.runtime.get(&id).copied();
        let expected = st.expected.get(&id).copied();

        if corroborated(runtime.as_ref(), expected.as_ref(), wall) {
            st.pending.remove(&id);
            // A confirmed start keeps its expectation until the run ends.
            // Anything else, including a canceled expectation settled by an
            // active read, has nothing left to expect.
            let keep = runtime.map(|r| r.active).unwrap_or(false)
                && expected.map(|e| e.active).unwrap_or(false);
            if !keep {
                st.expected.remove(&id);
            }
            debug!(zone = id, "pending corroborated, cleared");
            continue;
        }

        // Still uncorroborated: escalate across any milestone crossed.
        let Some(entry) = st.pending.get_mut(&id) else {
            continue;
        };
        let elapsed = now.duration_since(entry.since);
        let marks = thresholds.milestones();
        let mut fired = Vec::new();
        while entry.milestones_logged < marks.len() && elapsed >= marks[entry.milestones_logged] {
            entry.milestones_logged += 1;
            fired.push(MismatchAlert {
                zone: id,
                elapsed_secs: elapsed.as_secs(),
                expected_active: expected.map(|e| e.active).unwrap_or(false),
            });
        }
        for alert in fired {
            warn!(
                zone = id,
                elapsed_sec = alert.elapsed_secs,
                "expected/actual mismatch persists"
            );
            st.record_mismatch(format!(
                "zone {id}: no hardware confirmation after {}s",
                alert.elapsed_secs
            ));
            alerts.push(alert);
        }
    }

    // Rule 5: an expected-active zone outside any pending window whose
    // hardware reports inactive has genuinely stopped; fold expectation back
    // to reality. The grace window protects a just-issued start.
    let stopped: Vec<ZoneId> = st
        .expected
        .iter()
        .filter(|(id, e)| {
            e.active
                && !st.pending.contains_key(id)
                && !st.runtime.get(id).map(|r| r.active).unwrap_or(false)
                && wall - e.started_at
                    > ChronoDuration::from_std(thresholds.manual_grace)
                        .unwrap_or_else(|_| ChronoDuration::seconds(5))
        })
        .map(|(id, _)| *id)
        .collect();
    for id in stopped {
        st.expected.remove(&id);
        debug!(zone = id, "run ended, expectation cleared");
    }

    alerts
}

/// Rule 3's corroboration predicate: has ground truth confirmed whatever we
/// were waiting on?
fn corroborated(
    runtime: Option<&ZoneRuntime>,
    expected: Option<&ExpectedZone>,
    wall: DateTime<Utc>,
) -> bool {
    let active = runtime.map(|r| r.active).unwrap_or(false);
    if active {
        // Start confirmed.
        return true;
    }
    match expected {
        // Nothing expected anymore; an inactive read settles it.
        None => true,
        // Cancellation confirmed.
        Some(e) if !e.active => true,
        // Expected active, hardware inactive: only a run past its computed
        // end is "natural completion". Anything earlier stays pending; a
        // just-issued start must not be cleared before the hardware reacts.
        Some(e) => e.ends_at.map(|end| wall >= end).unwrap_or(false),
    }
}

// ---------------------------------------------------------------------------
// Sweep (rule 6)
// ---------------------------------------------------------------------------

/// Force-clear pending/error bookkeeping older than the absolute ceiling, so
/// lost confirmations can never grow the registry without bound. Returns the
/// number of entries cleared.
pub fn sweep(st: &mut SupervisorState, thresholds: &Thresholds, now: Instant) -> usize {
    let stale: Vec<ZoneId> = st
        .pending
        .iter()
        .filter(|(_, p)| now.duration_since(p.since) >= thresholds.error_ceiling)
        .map(|(id, _)| *id)
        .collect();

    for id in &stale {
        st.pending.remove(id);
        st.expected.remove(id);
        info!(zone = id, "pending entry hit the error ceiling, dropping");
        st.record_system(format!("zone {id}: stale pending entry swept"));
    }
    stale.len()
}

// ===========================================================================
// Tests
// ===========================================================================

//! Central reconciliation store: ground-truth runtime per zone (written only
//! by the poller), optimistic expected state (written by the command
//! dispatcher and the schedule watcher), the pending registry, and a bounded
//! event ring for the operator surface.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::schedule::{Zone, ZoneId};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SupervisorState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// What the hardware reports a zone is actually doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Manual,
    Scheduled,
    Unknown,
}

impl From<Option<&str>> for RunKind {
    fn from(raw: Option<&str>) -> Self {
        match raw {
            Some("manual") => Self::Manual,
            Some("scheduled") => Self::Scheduled,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ZoneRuntime {
    pub active: bool,
    pub remaining: u32,
    pub kind: RunKind,
}

/// Why we believe a zone should be in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedKind {
    Manual,
    Scheduled,
    Canceled,
}

/// What the client believes a zone is doing because of a command it issued
/// (or a scheduled start it anticipates).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExpectedZone {
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub kind: ExpectedKind,
}

/// Bookkeeping for a zone awaiting hardware corroboration.
#[derive(Debug, Clone, Copy)]
pub struct PendingEntry {
    /// When pending/mismatch tracking began.
    pub since: Instant,
    /// How many escalation milestones have already fired, so a sustained
    /// mismatch logs once per crossing rather than every tick.
    pub milestones_logged: usize,
}

impl PendingEntry {
    pub fn new(now: Instant) -> Self {
        Self {
            since: now,
            milestones_logged: 0,
        }
    }
}

/// Observable per-zone reconciliation state. Exactly one holds per zone at
/// any evaluation instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneColor {
    /// Ground truth active.
    Green,
    /// Ground truth inactive, nothing outstanding.
    Gray,
    /// Awaiting corroboration, under the pending timeout.
    Orange,
    /// Pending persisted past the timeout without corroboration.
    Red,
}

/// Classify one zone from its runtime and pending bookkeeping.
pub fn zone_color(
    runtime: Option<&ZoneRuntime>,
    pending: Option<&PendingEntry>,
    now: Instant,
    pending_timeout: Duration,
) -> ZoneColor {
    if runtime.map(|r| r.active).unwrap_or(false) {
        return ZoneColor::Green;
    }
    match pending {
        Some(p) if now.duration_since(p.since) >= pending_timeout => ZoneColor::Red,
        Some(_) => ZoneColor::Orange,
        None => ZoneColor::Gray,
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Poll,
    Command,
    Schedule,
    Mismatch,
    System,
}

// ---------------------------------------------------------------------------
// The store
// ---------------------------------------------------------------------------

pub struct SupervisorState {
    pub started_at: Instant,
    pub backend_reachable: bool,
    /// Zone definitions from the backend schedule, refreshed periodically.
    pub zones: Vec<Zone>,
    /// Ground truth. Mutated exclusively by the status poller.
    pub runtime: HashMap<ZoneId, ZoneRuntime>,
    pub expected: HashMap<ZoneId, ExpectedZone>,
    pub pending: HashMap<ZoneId, PendingEntry>,
    /// Per-zone "today" resolutions, published by the schedule watcher for
    /// the status view.
    pub resolved_today: HashMap<ZoneId, HashMap<String, String>>,
    /// Operator-typed timer text, buffered until a start succeeds.
    pub manual_input: HashMap<ZoneId, String>,
    /// Any zone's valve open implies the pump is drawing.
    pub pump_on: bool,
    pub events: VecDeque<SystemEvent>,
}

impl SupervisorState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            backend_reachable: false,
            zones: Vec::new(),
            runtime: HashMap::new(),
            expected: HashMap::new(),
            pending: HashMap::new(),
            resolved_today: HashMap::new(),
            manual_input: HashMap::new(),
            pump_on: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.iter().find(|z| z.zone_id == id)
    }

    /// Pending-set membership means "expected state not yet corroborated by
    /// the most recent runtime read".
    pub fn is_pending(&self, id: ZoneId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_schedule(&mut self, detail: String) {
        self.push_event(EventKind::Schedule, detail);
    }

    pub fn record_mismatch(&mut self, detail: String) {
        self.push_event(EventKind::Mismatch, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn record_poll_failure(&mut self, detail: String) {
        self.backend_reachable = false;
        self.push_event(EventKind::Poll, detail);
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// JSON snapshot (what the operator surface returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ZoneView {
    pub zone_id: ZoneId,
    pub color: ZoneColor,
    pub active: bool,
    pub remaining: u32,
    pub countdown: String,
    pub pending_secs: Option<u64>,
    pub expected: Option<ExpectedZone>,
    pub next_run: String,
    pub next_time: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub backend_reachable: bool,
    pub pump_on: bool,
    pub zones: Vec<ZoneView>,
    pub events: Vec<SystemEvent>,
}

impl SupervisorState {
    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, pending_timeout: Duration) -> StatusResponse {
        let now = Instant::now();
        let wall = chrono::Local::now().naive_local();
        let empty = HashMap::new();

        let zones = self
            .zones
            .iter()
            .map(|z| {
                let id = z.zone_id;
                let runtime = self.runtime.get(&id);
                let pending = self.pending.get(&id);
                let resolved = self.resolved_today.get(&id).unwrap_or(&empty);
                // Poll-reported remaining wins; for an expected-active zone
                // the poll has not confirmed yet, derive from the expectation.
                let remaining = match self.expected.get(&id) {
                    Some(e) if e.active => {
                        let dur = e
                            .ends_at
                            .map(|end| (end - e.started_at).num_seconds().max(0) as u32)
                            .unwrap_or(0);
                        crate::schedule::remaining_seconds(
                            runtime.and_then(|r| r.active.then_some(r.remaining)),
                            e.started_at.naive_utc(),
                            dur,
                            Utc::now().naive_utc(),
                        )
                    }
                    _ => runtime.map(|r| r.remaining).unwrap_or(0),
                };
                ZoneView {
                    zone_id: id,
                    color: zone_color(runtime, pending, now, pending_timeout),
                    active: runtime.map(|r| r.active).unwrap_or(false),
                    remaining,
                    countdown: crate::duration::format_countdown(remaining),
                    pending_secs: pending.map(|p| now.duration_since(p.since).as_secs()),
                    expected: self.expected.get(&id).copied(),
                    next_run: crate::schedule::next_display_label(z, resolved, wall),
                    next_time: crate::schedule::next_daily_time(z, resolved, wall),
                }
            })
            .collect();

        StatusResponse {
            uptime_secs: now.duration_since(self.started_at).as_secs(),
            backend_reachable: self.backend_reachable,
            pump_on: self.pump_on,
            zones,
            events: self.events.iter().rev().cloned().collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- zone_color ----------------------------------------------------------

    #[test]
    fn color_green_when_runtime_active() {
        let rt = ZoneRuntime {
            active: true,
            remaining: 30,
            kind: RunKind::Manual,
        };
        // Even an outstanding pending entry loses to confirmed-on.
        let pending = PendingEntry::new(Instant::now());
        assert_eq!(
            zone_color(
                Some(&rt),
                Some(&pending),
                Instant::now(),
                Duration::from_secs(30)
            ),
            ZoneColor::Green
        );
    }

    #[test]
    fn color_gray_when_idle_and_not_pending() {
        let rt = ZoneRuntime {
            active: false,
            remaining: 0,
            kind: RunKind::Unknown,
        };
        assert_eq!(
            zone_color(Some(&rt), None, Instant::now(), Duration::from_secs(30)),
            ZoneColor::Gray
        );
    }

    #[test]
    fn color_gray_when_zone_never_polled() {
        assert_eq!(
            zone_color(None, None, Instant::now(), Duration::from_secs(30)),
            ZoneColor::Gray
        );
    }

    #[tokio::test(start_paused = true)]
    async fn color_orange_then_red_as_pending_ages() {
        let rt = ZoneRuntime {
            active: false,
            remaining: 0,
            kind: RunKind::Unknown,
        };
        let pending = PendingEntry::new(Instant::now());
        let timeout = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            zone_color(Some(&rt), Some(&pending), Instant::now(), timeout),
            ZoneColor::Orange
        );

        tokio::time::advance(Duration::from_secs(34)).await;
        assert_eq!(
            zone_color(Some(&rt), Some(&pending), Instant::now(), timeout),
            ZoneColor::Red
        );
    }

    // -- run kind decoding ---------------------------------------------------

    #[test]
    fn run_kind_from_wire_strings() {
        assert_eq!(RunKind::from(Some("manual")), RunKind::Manual);
        assert_eq!(RunKind::from(Some("scheduled")), RunKind::Scheduled);
        assert_eq!(RunKind::from(Some("drip")), RunKind::Unknown);
        assert_eq!(RunKind::from(None), RunKind::Unknown);
    }

    // -- event ring ----------------------------------------------------------

    #[test]
    fn event_ring_is_bounded() {
        let mut st = SupervisorState::new();
        for i in 0..250 {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        // Oldest entries were dropped.
        assert_eq!(st.events.front().unwrap().detail, "event 50");
    }
}

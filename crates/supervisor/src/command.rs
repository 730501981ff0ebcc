//! Manual-timer command dispatch. State is mutated optimistically before the
//! request goes out; both start and cancel share one rollback path driven by
//! [`CommandOutcome`], so a timeout or rejection restores exactly what the
//! zone carried beforehand.

use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info};

use crate::api::{ApiClient, CommandOutcome};
use crate::reconcile;
use crate::schedule::ZoneId;
use crate::state::SharedState;

#[derive(Clone)]
pub struct CommandDispatcher {
    client: ApiClient,
    state: SharedState,
}

impl CommandDispatcher {
    pub fn new(client: ApiClient, state: SharedState) -> Self {
        Self { client, state }
    }

    /// Start a manual run. On success the zone's buffered input text is
    /// consumed; on failure the optimistic expectation and pending entry are
    /// rolled back and the outcome is surfaced to the caller.
    pub async fn start_manual_timer(&self, zone: ZoneId, duration_secs: u32) -> CommandOutcome {
        let (prior_expected, prior_pending) = {
            let mut st = self.state.write().await;
            let priors = (
                st.expected.get(&zone).copied(),
                st.pending.get(&zone).copied(),
            );
            reconcile::record_start_command(&mut st, zone, duration_secs, Instant::now(), Utc::now());
            priors
        };

        let outcome = self.client.start_timer(zone, duration_secs).await;
        match &outcome {
            CommandOutcome::Ok => {
                let mut st = self.state.write().await;
                st.manual_input.remove(&zone);
                info!(zone, duration_secs, "manual timer started");
            }
            CommandOutcome::Transient(msg) | CommandOutcome::Rejected(msg) => {
                error!(zone, "manual start failed: {msg}");
                let mut st = self.state.write().await;
                reconcile::rollback_command(&mut st, zone, prior_expected, prior_pending);
                st.record_command(format!("zone {zone}: start failed ({msg}), rolled back"));
            }
        }
        outcome
    }

    /// Cancel a zone's timer. Canceling a zone with no pending action and no
    /// active run is a no-op: no state change, no log, no request.
    pub async fn cancel_timer(&self, zone: ZoneId) -> CommandOutcome {
        let (prior_expected, prior_pending) = {
            let mut st = self.state.write().await;
            let running = st.runtime.get(&zone).map(|r| r.active).unwrap_or(false);
            if !running && !st.is_pending(zone) && !st.expected.contains_key(&zone) {
                return CommandOutcome::Ok;
            }
            let priors = (
                st.expected.get(&zone).copied(),
                st.pending.get(&zone).copied(),
            );
            reconcile::record_cancel_command(&mut st, zone, Instant::now(), Utc::now());
            priors
        };

        let outcome = self.client.cancel_timer(zone).await;
        match &outcome {
            CommandOutcome::Ok => {
                info!(zone, "timer cancel dispatched");
            }
            CommandOutcome::Transient(msg) | CommandOutcome::Rejected(msg) => {
                error!(zone, "cancel failed: {msg}");
                let mut st = self.state.write().await;
                reconcile::rollback_command(&mut st, zone, prior_expected, prior_pending);
                st.record_command(format!("zone {zone}: cancel failed ({msg}), rolled back"));
            }
        }
        outcome
    }
}

// ===========================================================================
// Tests
// ===========================================================================

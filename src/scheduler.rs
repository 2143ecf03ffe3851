use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{PostingConfig, QuotaPolicy};
use crate::store::Store;
use crate::types::{DeniedReason, Gate, Result, ScheduleState};

/// Owns the posting gate: time-of-day windows, minimum inter-post interval
/// and daily/monthly quotas. `record_post` is the only mutator and must be
/// called exactly once per successful publish.
pub struct Scheduler {
    rules: PostingConfig,
    store: Arc<Store>,
    state: Mutex<ScheduleState>,
    /// Held by callers across the whole check-then-publish-then-record
    /// sequence so two concurrent cycles cannot both pass the gate.
    cycle_lock: Mutex<()>,
}

impl Scheduler {
    /// Load persisted schedule state, or start fresh on first run.
    pub async fn load(store: Arc<Store>, rules: PostingConfig) -> Result<Self> {
        let state = match store.load_schedule_state().await? {
            Some(state) => {
                info!(
                    "Loaded schedule state: {} today, {} this month",
                    state.posts_today, state.posts_this_month
                );
                state
            }
            None => ScheduleState::fresh(Utc::now().with_timezone(&rules.timezone).date_naive()),
        };
        Ok(Self::with_state(store, rules, state))
    }

    pub fn with_state(store: Arc<Store>, rules: PostingConfig, state: ScheduleState) -> Self {
        Self {
            rules,
            store,
            state: Mutex::new(state),
            cycle_lock: Mutex::new(()),
        }
    }

    /// Acquire the cycle-wide gate lock. Callers hold the guard from the
    /// `can_post_now` check until after `record_post`.
    pub async fn lock_cycle(&self) -> MutexGuard<'_, ()> {
        self.cycle_lock.lock().await
    }

    /// Check whether a post may go out right now. Denial reasons are checked
    /// in a fixed order: window, interval, daily ceiling, monthly ceiling.
    pub async fn can_post_now(&self, now: DateTime<Utc>) -> Gate {
        let mut state = self.state.lock().await;
        self.roll_over(&mut state, now);

        let local = now.with_timezone(&self.rules.timezone).time();
        if !self.in_window(local) {
            return Gate::Denied(DeniedReason::OutsideWindow);
        }

        if let Some(last) = state.last_post_at {
            let min_interval = Duration::minutes(self.rules.min_interval_minutes);
            if now.signed_duration_since(last) < min_interval {
                return Gate::Denied(DeniedReason::MinInterval);
            }
        }

        if state.posts_today >= self.rules.max_per_day {
            return Gate::Denied(DeniedReason::DailyCeiling);
        }

        if state.posts_this_month >= self.rules.max_per_month {
            return Gate::Denied(DeniedReason::MonthlyCeiling);
        }

        Gate::Allowed
    }

    /// Advance the counters after a successful publish and persist them.
    /// Under the fail-open policy a storage error is logged and swallowed;
    /// the in-memory counters still advance for the rest of the process
    /// lifetime. Under fail-closed the error propagates.
    pub async fn record_post(&self, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.roll_over(&mut state, now);

        state.last_post_at = Some(now);
        state.posts_today += 1;
        state.posts_this_month += 1;

        match self.store.save_schedule_state(&state).await {
            Ok(()) => {
                debug!(
                    "Recorded post: {} today, {} this month",
                    state.posts_today, state.posts_this_month
                );
                Ok(())
            }
            Err(e) => match self.rules.quota_policy {
                QuotaPolicy::FailOpen => {
                    warn!("Failed to persist schedule state (continuing in-memory): {e}");
                    Ok(())
                }
                QuotaPolicy::FailClosed => Err(e),
            },
        }
    }

    pub async fn state_snapshot(&self) -> ScheduleState {
        self.state.lock().await.clone()
    }

    /// Windows are wall-clock in the reference timezone, start inclusive,
    /// end exclusive.
    fn in_window(&self, local: NaiveTime) -> bool {
        self.rules
            .windows
            .iter()
            .any(|(start, end)| *start <= local && local < *end)
    }

    /// Lazy counter rollover at reference-time midnight. Comparing dates on
    /// each call instead of running a reset timer means a process asleep or
    /// down over midnight still resets correctly.
    fn roll_over(&self, state: &mut ScheduleState, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.rules.timezone).date_naive();
        if today == state.counted_date {
            return;
        }
        if today.year() != state.counted_date.year() || today.month() != state.counted_date.month()
        {
            state.posts_this_month = 0;
        }
        state.posts_today = 0;
        state.counted_date = today;
    }
}

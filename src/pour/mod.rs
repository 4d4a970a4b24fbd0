//! The pour session state machine (§4.5) — the core of the dispensing
//! control loop. `Idle → Authorizing → Priming → Flowing → Terminating →
//! Recorded`. The session object exists only for states other than
//! `Idle`; `Idle` is the absence of a `PourSession`, which is how
//! `Supervisor` represents it (§4.5, invariant 1 in §8).
//!
//! Adapted from a function-table FSM (no_std, `fn`-pointer driven) to an
//! `async`, `match`-driven state machine, since our transitions await I/O
//! (flow reads, store round-trips) that a no_std tick function can't.

pub mod bac;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::bus::{PresenceMap, TokenId};
use crate::db::models::{Fragment, Grant, Keg};
use crate::db::stores::{DrinkStore, GrantStore, KegStore, KeyStore, UserStore};
use crate::flow::FlowController;
use crate::ledger::GrantLedger;
use crate::ui::UiSink;

use bac::{decompose_bac_default, instant_bac};

/// Tokens currently "cooled down" — ignored by authorization until unseen
/// for `ib_idle_min_disconnected` (§3). Membership, not a timestamp: the
/// staleness check that evicts an entry reads the token's `last_seen` out
/// of the `PresenceMap`, not out of this set.
#[derive(Debug, Clone, Default)]
pub struct TimeoutSet {
    inner: Arc<RwLock<HashSet<TokenId>>>,
}

impl TimeoutSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: TokenId) {
        self.inner.write().await.insert(token);
    }

    pub async fn contains(&self, token: TokenId) -> bool {
        self.inner.read().await.contains(&token)
    }

    /// Drop any entry whose `last_seen` in `presence` is older than
    /// `idle_min_disconnected`, or that is no longer tracked at all by the
    /// presence map (treated as long gone).
    pub async fn evict_stale(&self, presence: &PresenceMap, idle_min_disconnected: Duration) {
        let snapshot = presence.snapshot().await;
        let now = Instant::now();
        let mut set = self.inner.write().await;
        set.retain(|token| match snapshot.last_seen_age(*token, now) {
            Some(age) => age < idle_min_disconnected,
            None => false,
        });
    }
}

/// Last observed cumulative tick count, retained between pours for the
/// leak/tamper audit (§3, §4.5). Written only at session end, read only
/// at session start — the `Mutex` exists for `Send`-across-`.await`
/// convenience, not because of real contention (§5).
#[derive(Debug, Clone, Default)]
pub struct LastFlowTicks(Arc<Mutex<Option<u32>>>);

impl LastFlowTicks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<u32> {
        *self.0.lock().await
    }

    pub async fn set(&self, ticks: u32) {
        *self.0.lock().await = Some(ticks);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    UserLeft,
    TimedOut,
    GrantsExhausted,
    Shutdown,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::UserLeft => "user_left",
            TerminationReason::TimedOut => "timed_out",
            TerminationReason::GrantsExhausted => "grants_exhausted",
            TerminationReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PourOutcome {
    pub reason: TerminationReason,
    pub total_ticks: u32,
    pub bac: f64,
}

/// What `try_run` produced: either the user had no usable grants (§4.5
/// Authorizing → Idle, no session ever existed in any later state), or a
/// full pour ran to completion.
pub enum PourAttempt {
    NoGrants,
    Completed(PourOutcome),
}

/// Timing knobs `PourSession` needs, lifted out of `TimingConfig`/
/// `FlowConfig` into plain `Duration`s so the state machine doesn't
/// depend on the config module's shape.
#[derive(Debug, Clone, Copy)]
pub struct PourTiming {
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub missing_ceiling: Duration,
}

/// Everything a `PourSession` needs, bundled so `Supervisor` can hand it
/// off without threading a dozen parameters through every call.
pub struct PourContext<F: FlowController> {
    pub flow: Arc<Mutex<F>>,
    pub presence: PresenceMap,
    pub timeout_set: TimeoutSet,
    pub last_flow_ticks: LastFlowTicks,
    pub key_store: KeyStore,
    pub user_store: UserStore,
    pub grant_store: GrantStore,
    pub keg_store: KegStore,
    pub drink_store: DrinkStore,
    pub ui: Arc<dyn UiSink>,
    pub timing: PourTiming,
}

/// Runs one authorized pour for `token` to completion. Constructed (i.e.
/// moves out of `Idle`) only after `Supervisor` has already verified the
/// token is present, known, not cooling down, and recently seen (§4.5
/// `Idle → Authorizing` preconditions).
pub struct PourSession;

impl PourSession {
    #[instrument(skip_all, fields(token = %format!("{token:#x}")), name = "pour_session")]
    pub async fn try_run<F: FlowController>(
        token: TokenId,
        ctx: &PourContext<F>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<PourAttempt> {
        let key = ctx
            .key_store
            .get_key(token)
            .await?
            .ok_or_else(|| anyhow::anyhow!("token {token:#x} has no bound key"))?;
        let user = ctx.user_store.get_user(key.user_id).await?;

        let mut ledger = GrantLedger::load(&ctx.grant_store, user.id).await?;
        let Some(mut current_grant) = ledger.next_grant(Utc::now()) else {
            let err = crate::error::CoreError::NoGrants(user.id);
            info!(user = %user.name, "{err}; cooling down token");
            ctx.timeout_set.insert(token).await;
            return Ok(PourAttempt::NoGrants);
        };

        // Authorizing -> Priming: flow audit, then clear the counter.
        let audit_reading = {
            let mut flow = ctx.flow.lock().await;
            flow.read_ticks().map_err(|e| crate::error::CoreError::FlowIo(e))?
        };
        if let Some(expected) = ctx.last_flow_ticks.get().await {
            if expected != audit_reading {
                let err = crate::error::CoreError::AuditMismatch {
                    expected,
                    actual: audit_reading,
                };
                warn!(target: "security", "{err}");
            }
        }
        {
            let mut flow = ctx.flow.lock().await;
            flow.clear_ticks().map_err(|e| crate::error::CoreError::FlowIo(e))?;
        }

        // Priming -> Flowing.
        ctx.ui.set_current_plate(&user);
        {
            let mut flow = ctx.flow.lock().await;
            flow.open_valve().map_err(|e| crate::error::CoreError::FlowIo(e))?;
        }
        let keg = ctx.keg_store.get_current_keg().await?;

        let result = Self::run_flowing(token, ctx, &mut ledger, &mut current_grant, &keg, shutdown).await;

        // Flowing -> Terminating: always close the valve, fail-closed
        // regardless of how the loop exited (§7).
        {
            let mut flow = ctx.flow.lock().await;
            if let Err(e) = flow.close_valve() {
                warn!(error = %e, "failed to close valve on session end");
            }
        }

        let (reason, mut total_ticks, mut fragments, last_grant, mut last_grant_ticks, last_reading) = result?;

        // One final tick read with the same sanity filter, capturing
        // whatever overshoot lands between the last in-loop poll and the
        // valve physically closing (§4.5, §5: at most one poll_time of
        // overshoot is accepted between close_valve and this read).
        {
            let final_read = {
                let mut flow = ctx.flow.lock().await;
                flow.read_ticks()
            };
            match final_read {
                Ok(now_ticks) => {
                    let delta = now_ticks as i64 - last_reading as i64;
                    if !(0..=500).contains(&delta) {
                        let err = crate::error::CoreError::TickAnomaly(delta);
                        warn!("{err}; discarding final audit sample");
                    } else {
                        total_ticks = total_ticks.saturating_add(delta as u32);
                        // If the last grant consumed was already exhausted
                        // and folded into `fragments` (grants_exhausted
                        // termination), `last_grant_ticks` is 0 and this
                        // grant has no further allowance to attribute ticks
                        // to — fold the overshoot into its existing
                        // fragment instead of double-recording it in both
                        // `fragments` and `last_grant_ticks`. Otherwise the
                        // current grant is still open and the overshoot
                        // belongs to it.
                        match fragments.last_mut().filter(|f| f.grant_id == last_grant.id) {
                            Some(frag) => frag.ticks = frag.ticks.saturating_add(delta),
                            None => last_grant_ticks = last_grant_ticks.saturating_add(delta as u32),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "final flow audit read failed; recording without overshoot"),
            }
        }

        // Terminating -> Recorded.
        let (prior_bac, prior_time) = ctx.drink_store.get_last_drink(user.id).await?;
        let seconds_ago = (Utc::now() - prior_time).num_seconds().max(0) as f64;
        let bac = instant_bac(&user, &keg, total_ticks) + decompose_bac_default(prior_bac, seconds_ago);

        ctx.drink_store
            .emit(
                user.id,
                keg.id,
                total_ticks as i64,
                last_grant.id,
                last_grant_ticks as i64,
                bac,
                &fragments,
            )
            .await?;
        ctx.ui.set_last_drink(&user, keg.drink_ounces(total_ticks), bac);
        ctx.last_flow_ticks.set(total_ticks).await;

        info!(
            user = %user.name,
            reason = reason.as_str(),
            total_ticks,
            bac,
            "pour recorded"
        );

        Ok(PourAttempt::Completed(PourOutcome {
            reason,
            total_ticks,
            bac,
        }))
    }

    /// The `Flowing` steady state: poll, sanity-filter, roll the ledger,
    /// evaluate termination predicates in §4.5 order. Returns the
    /// termination reason plus everything needed to write the
    /// `DrinkRecord`.
    async fn run_flowing<F: FlowController>(
        token: TokenId,
        ctx: &PourContext<F>,
        ledger: &mut GrantLedger,
        current_grant: &mut Grant,
        keg: &Keg,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<(TerminationReason, u32, Vec<Fragment>, Grant, u32, u32)> {
        let mut interval = tokio::time::interval(ctx.timing.poll_interval);
        let idle_deadline = tokio::time::Instant::now() + ctx.timing.idle_timeout;
        let mut idle_timer_fired = false;

        let mut last_reading: u32 = 0;
        let mut total_ticks: u32 = 0;
        let mut grant_ticks: u32 = 0;
        let mut fragments: Vec<Fragment> = Vec::new();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(idle_deadline), if !idle_timer_fired => {
                    idle_timer_fired = true;
                    ctx.timeout_set.insert(token).await;
                    warn!("idle timer expired; token queued for cool-down");
                }
                _ = interval.tick() => {
                    if shutdown.is_cancelled() {
                        return Ok((TerminationReason::Shutdown, total_ticks, fragments, current_grant.clone(), grant_ticks, last_reading));
                    }

                    let read_result = {
                        let mut flow = ctx.flow.lock().await;
                        flow.read_ticks()
                    };
                    let now_ticks = match read_result {
                        Ok(t) => t,
                        Err(e) => {
                            let err = crate::error::CoreError::FlowIo(e);
                            warn!("{err}; aborting pour session (fail-closed)");
                            return Err(err.into());
                        }
                    };

                    let delta = now_ticks as i64 - last_reading as i64;
                    if !(0..=500).contains(&delta) {
                        let err = crate::error::CoreError::TickAnomaly(delta);
                        warn!("{err}; discarding sample");
                    } else {
                        total_ticks = total_ticks.saturating_add(delta as u32);
                        grant_ticks = grant_ticks.saturating_add(delta as u32);
                        last_reading = now_ticks.max(0);

                        ctx.ui.activity(
                            keg.drink_ounces(grant_ticks) % 8.0,
                            keg.drink_ounces(total_ticks),
                        );
                    }

                    if ctx.timeout_set.contains(token).await {
                        return Ok((TerminationReason::TimedOut, total_ticks, fragments, current_grant.clone(), grant_ticks, last_reading));
                    }

                    let snapshot = ctx.presence.snapshot().await;
                    if let Some(age) = snapshot.last_seen_age(token, Instant::now()) {
                        if age > ctx.timing.missing_ceiling {
                            return Ok((TerminationReason::UserLeft, total_ticks, fragments, current_grant.clone(), grant_ticks, last_reading));
                        }
                    }

                    let ounces_consumed = keg.drink_ounces(grant_ticks);
                    if ledger.is_exhausted(current_grant, ounces_consumed) {
                        fragments.push(Fragment { grant_id: current_grant.id, ticks: grant_ticks as i64 });
                        // Reset unconditionally, matching the original's
                        // unconditional `grant_ticks = 0` on exhaustion
                        // regardless of whether another grant is available.
                        // The exhausted grant's ticks now live solely in
                        // the fragment just pushed; `grant_ticks` tracks
                        // only what's consumed against whatever comes next
                        // (or nothing, if no grant remains).
                        grant_ticks = 0;
                        match ledger.next_grant(Utc::now()) {
                            Some(next) => {
                                *current_grant = next;
                            }
                            None => {
                                return Ok((TerminationReason::GrantsExhausted, total_ticks, fragments, current_grant.clone(), grant_ticks, last_reading));
                            }
                        }
                    }
                }
            }
        }
    }
}

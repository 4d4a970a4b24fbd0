//! Supervisor (§4.6): owns the shared state named in §3/§5, spawns and
//! joins the worker tasks, and drives the relaxed-cadence loop that
//! evicts stale `TimeoutSet` entries and starts the next `PourSession`.
//!
//! Grounded on `sovereign-engine::main`'s "construct state, spawn
//! background tasks, join" shape and `groblegark-coop`'s
//! `CancellationToken` + `tokio::signal::unix` shutdown handling, extended
//! here to the four signals §6 names (SIGHUP, SIGINT, SIGQUIT, SIGTERM).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bot::ChatBot;
use crate::bus::{BusScanner, OneWireBus, PresenceMap, TokenId};
use crate::config::AppConfig;
use crate::db::stores::{DrinkStore, GrantStore, KegStore, KeyStore, ThermoStore, UserStore};
use crate::db::Database;
use crate::flow::FlowController;
use crate::logging::LogEchoHandle;
use crate::pour::{LastFlowTicks, PourAttempt, PourContext, PourSession, PourTiming, TimeoutSet};
use crate::thermo::{TempSensor, ThermoController};
use crate::ui::UiSink;

/// The narrow interface the admin shell (and, in principle, any other
/// out-of-process collaborator) is allowed to call back through — never
/// the raw shared state (Design Notes).
pub struct AdminHandle {
    user_store: UserStore,
    key_store: KeyStore,
    thermo_store: ThermoStore,
    bot: Arc<dyn ChatBot>,
    use_aim: bool,
    shutdown: CancellationToken,
    log_echo: LogEchoHandle,
}

impl AdminHandle {
    pub async fn add_user(
        &self,
        name: &str,
        weight_lbs: f64,
        gender: &str,
        token_id: TokenId,
    ) -> anyhow::Result<i64> {
        let user_id = self.user_store.add_user(name, weight_lbs, gender).await?;
        self.key_store_bind(token_id, user_id).await?;
        Ok(user_id)
    }

    async fn key_store_bind(&self, token_id: TokenId, user_id: i64) -> anyhow::Result<()> {
        self.user_store.bind_key(token_id, user_id).await
    }

    pub fn quit(&self) {
        info!("admin shell requested shutdown");
        self.shutdown.cancel();
    }

    pub async fn current_temperature(&self) -> anyhow::Result<Option<f64>> {
        Ok(self.thermo_store.last_reading(1).await?.map(|r| r.temp_c))
    }

    /// `AIM.use_aim` gates the whole `bot` subcommand, matching the
    /// original's `BotManager` never being constructed when the AIM config
    /// section is absent or disabled.
    pub fn bot_go(&self) {
        if !self.use_aim {
            warn!("bot command ignored: AIM.use_aim is disabled");
            return;
        }
        self.bot.go();
    }

    pub fn bot_stop(&self) {
        if !self.use_aim {
            warn!("bot command ignored: AIM.use_aim is disabled");
            return;
        }
        self.bot.stop();
    }

    pub fn bot_say(&self, user: &str, message: &str) {
        if !self.use_aim {
            warn!("bot command ignored: AIM.use_aim is disabled");
            return;
        }
        self.bot.say(user, message);
    }

    /// Always valid; `key_store` is kept for symmetry with the other
    /// stores a narrower interface might eventually need (e.g. checking
    /// a token is free before binding it in `adduser`'s Q&A flow).
    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    pub fn showlog(&self) {
        self.log_echo.show();
    }

    pub fn hidelog(&self) {
        self.log_echo.hide();
    }
}

/// Owns every piece of shared mutable state named in §3/§5 and drives
/// the main supervisory loop.
pub struct Supervisor<B: OneWireBus + 'static, F: FlowController + 'static, S: TempSensor + 'static> {
    config: AppConfig,
    bus: Arc<Mutex<B>>,
    flow: Arc<Mutex<F>>,
    sensor: Arc<Mutex<S>>,
    presence: PresenceMap,
    timeout_set: TimeoutSet,
    last_flow_ticks: LastFlowTicks,
    key_store: KeyStore,
    user_store: UserStore,
    grant_store: GrantStore,
    keg_store: KegStore,
    drink_store: DrinkStore,
    thermo_store: ThermoStore,
    ui: Arc<dyn UiSink>,
    bot: Arc<dyn ChatBot>,
    shutdown: CancellationToken,
}

impl<B: OneWireBus + 'static, F: FlowController + 'static, S: TempSensor + 'static> Supervisor<B, F, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        db: Database,
        bus: B,
        flow: F,
        sensor: S,
        ui: Arc<dyn UiSink>,
        bot: Arc<dyn ChatBot>,
    ) -> Self {
        Self {
            bus: Arc::new(Mutex::new(bus)),
            flow: Arc::new(Mutex::new(flow)),
            sensor: Arc::new(Mutex::new(sensor)),
            presence: PresenceMap::new(),
            timeout_set: TimeoutSet::new(),
            last_flow_ticks: LastFlowTicks::new(),
            key_store: KeyStore::new(db.clone()),
            user_store: UserStore::new(db.clone()),
            grant_store: GrantStore::new(db.clone()),
            keg_store: KegStore::new(db.clone()),
            drink_store: DrinkStore::new(db.clone()),
            thermo_store: ThermoStore::new(db),
            ui,
            bot,
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn admin_handle(&self, log_echo: LogEchoHandle) -> AdminHandle {
        AdminHandle {
            user_store: self.user_store.clone(),
            key_store: self.key_store.clone(),
            thermo_store: self.thermo_store.clone(),
            bot: self.bot.clone(),
            use_aim: self.config.aim.use_aim,
            shutdown: self.shutdown.clone(),
            log_echo,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn `BusScanner` and `ThermoController`, then run the
    /// supervisory loop until shutdown is requested, then join the
    /// background tasks. The admin shell and signal handler are spawned
    /// by `main` (they need `AdminHandle`/the raw `CancellationToken`
    /// respectively, not the rest of this state).
    pub async fn run(self) -> anyhow::Result<()> {
        let timing = &self.config.timing;

        let scanner = BusScanner::new(
            self.bus.clone(),
            self.presence.clone(),
            self.config.users.ignoreids.clone(),
            Duration::from_secs_f64(timing.ib_refresh_timeout),
        );
        let scanner_shutdown = self.shutdown.clone();
        let scanner_task = tokio::spawn(scanner.run(scanner_shutdown));

        let thermo_task = if self.config.thermo.use_thermo {
            let controller = ThermoController::new(
                self.sensor.clone(),
                self.flow.clone(),
                self.thermo_store.clone(),
                self.ui.clone(),
                Duration::from_secs(5),
                self.config.thermo.temp_max_high,
                self.config.thermo.temp_max_low,
                Duration::from_secs(timing.freezer_event_min.max(0) as u64),
            );
            let thermo_shutdown = self.shutdown.clone();
            Some(tokio::spawn(controller.run(thermo_shutdown)))
        } else {
            None
        };

        let pour_ctx = PourContext {
            flow: self.flow.clone(),
            presence: self.presence.clone(),
            timeout_set: self.timeout_set.clone(),
            last_flow_ticks: self.last_flow_ticks.clone(),
            key_store: self.key_store.clone(),
            user_store: self.user_store.clone(),
            grant_store: self.grant_store.clone(),
            keg_store: self.keg_store.clone(),
            drink_store: self.drink_store.clone(),
            ui: self.ui.clone(),
            timing: PourTiming {
                poll_interval: Duration::from_secs_f64(self.config.flow.polltime),
                idle_timeout: Duration::from_secs_f64(timing.ib_idle_timeout),
                missing_ceiling: Duration::from_secs_f64(timing.ib_missing_ceiling),
            },
        };

        self.main_loop(&pour_ctx).await;

        scanner_task.abort();
        if let Some(t) = thermo_task {
            t.abort();
        }

        info!("supervisor shut down cleanly");
        Ok(())
    }

    /// §4.6: ~0.5s cadence. Evict stale `TimeoutSet` entries; if idle,
    /// look for an eligible token and run one `PourSession` to
    /// completion; repeat until shutdown.
    async fn main_loop(&self, pour_ctx: &PourContext<F>) {
        let idle_min_disconnected = Duration::from_secs_f64(self.config.timing.ib_idle_min_disconnected);
        let missing_ceiling = Duration::from_secs_f64(self.config.timing.ib_missing_ceiling);
        let mut tick = tokio::time::interval(Duration::from_millis(500));

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }

            self.timeout_set.evict_stale(&self.presence, idle_min_disconnected).await;

            if let Some(token) = self.find_eligible_token(missing_ceiling).await {
                match PourSession::try_run(token, pour_ctx, &self.shutdown).await {
                    Ok(PourAttempt::NoGrants) => {
                        info!(token = %format!("{token:#x}"), "pour skipped: no usable grants");
                    }
                    Ok(PourAttempt::Completed(outcome)) => {
                        info!(
                            token = %format!("{token:#x}"),
                            reason = outcome.reason.as_str(),
                            ticks = outcome.total_ticks,
                            "pour complete"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "pour session failed");
                    }
                }
            }
        }
    }

    /// §4.5 `Idle → Authorizing` preconditions: present, known key, not
    /// cooling down, recently seen.
    async fn find_eligible_token(&self, missing_ceiling: Duration) -> Option<TokenId> {
        let snapshot = self.presence.snapshot().await;
        let now = std::time::Instant::now();

        for &token in &snapshot.present {
            if self.timeout_set.contains(token).await {
                continue;
            }
            let Some(age) = snapshot.last_seen_age(token, now) else {
                continue;
            };
            if age >= missing_ceiling {
                continue;
            }
            match self.key_store.known_key(token).await {
                Ok(true) => return Some(token),
                Ok(false) => continue,
                Err(e) => {
                    warn!(error = %e, token = %format!("{token:#x}"), "key lookup failed");
                    continue;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::flow::MockFlowController;
    use crate::thermo::MockTempSensor;
    use crate::bot::NoopBot;
    use crate::ui::NullUi;

    fn test_config() -> AppConfig {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[DB]
host = localhost
user = kegbot
password = x
db = kegbot

[Devices]
onewire = /dev/null
flow = /dev/null

[UI]
use_lcd = false

[Thermo]
use_thermo = false
temp_max_high = 4.0
temp_max_low = 1.0

[Timing]
ib_refresh_timeout = 0.05
ib_idle_min_disconnected = 0.2
ib_missing_ceiling = 0.1
ib_idle_timeout = 5.0
freezer_event_min = 300

[Flow]
polltime = 0.05

[Users]
ignoreids =

[Logging]
use_sql = false
use_logfile = false
use_stream = true
"#
        )
        .unwrap();
        AppConfig::load(f.path().to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn admin_handle_quit_cancels_shutdown() {
        let db = Database::test_db().await;
        let sup = Supervisor::new(
            test_config(),
            db,
            MockBus::new(),
            MockFlowController::new(),
            MockTempSensor::default(),
            Arc::new(NullUi),
            Arc::new(NoopBot),
        );
        let handle = sup.admin_handle(LogEchoHandle::detached());
        assert!(!sup.shutdown_token().is_cancelled());
        handle.quit();
        assert!(sup.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn find_eligible_token_skips_unknown_and_cooling_down_tokens() {
        let db = Database::test_db().await;
        let users = UserStore::new(db.clone());
        let uid = users.add_user("ace", 180.0, "male").await.unwrap();
        users.bind_key(0xA1, uid).await.unwrap();

        let sup = Supervisor::new(
            test_config(),
            db,
            MockBus::new(),
            MockFlowController::new(),
            MockTempSensor::default(),
            Arc::new(NullUi),
            Arc::new(NoopBot),
        );
        sup.presence.publish_for_test(0xA1).await;
        sup.presence.publish_for_test(0xFF).await; // unknown key

        let found = sup.find_eligible_token(Duration::from_secs(5)).await;
        assert_eq!(found, Some(0xA1));

        sup.timeout_set.insert(0xA1).await;
        let found = sup.find_eligible_token(Duration::from_secs(5)).await;
        assert_eq!(found, None);
    }
}

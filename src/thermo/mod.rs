//! Thermostatic controller (§4.3): hysteresis + anti-short-cycle fridge
//! relay control, running concurrently with the dispensing loop and
//! sharing the 1-Wire bus mutex with `BusScanner`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::db::stores::ThermoStore;
use crate::flow::{FlowController, FridgeState};
use crate::ui::UiSink;

/// Read-side port for the temperature sensor. Sensor index 1 per §4.3;
/// kept generic in case a future core wires up more than one probe.
pub trait TempSensor: Send + Sync {
    fn read_celsius(&mut self, sensor_index: u32) -> Result<f64, String>;
}

pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

/// Byte-oriented adapter over the thermo probe's device path, framed the
/// same way as `flow::SerialFlowController` and `bus::SerialOneWireBus`: a
/// single command byte, an 8-byte little-endian float reply.
pub struct SerialTempSensor {
    device: std::fs::File,
}

impl SerialTempSensor {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, String> {
        let device = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| format!("open {}: {e}", path.as_ref().display()))?;
        Ok(Self { device })
    }
}

impl TempSensor for SerialTempSensor {
    fn read_celsius(&mut self, sensor_index: u32) -> Result<f64, String> {
        use std::io::{Read, Write};
        self.device
            .write_all(&[b'T', sensor_index as u8])
            .map_err(|e| format!("write read-temp command: {e}"))?;
        let mut buf = [0u8; 8];
        self.device
            .read_exact(&mut buf)
            .map_err(|e| format!("read temperature: {e}"))?;
        Ok(f64::from_le_bytes(buf))
    }
}

/// In-memory sensor for tests.
#[derive(Debug, Default)]
pub struct MockTempSensor {
    pub celsius: f64,
}

impl TempSensor for MockTempSensor {
    fn read_celsius(&mut self, _sensor_index: u32) -> Result<f64, String> {
        Ok(self.celsius)
    }
}

/// Drives the fridge relay on a fixed sample cadence. Holds the bus mutex
/// only for the duration of one temperature read (§5) — never across the
/// relay command that follows.
pub struct ThermoController<S: TempSensor, F: FlowController> {
    sensor: Arc<Mutex<S>>,
    flow: Arc<Mutex<F>>,
    thermo_store: ThermoStore,
    ui: Arc<dyn UiSink>,
    sample_interval: Duration,
    temp_max_high: f64,
    temp_max_low: f64,
    freezer_event_min: Duration,
    last_transition: Option<Instant>,
}

impl<S: TempSensor + 'static, F: FlowController + 'static> ThermoController<S, F> {
    pub fn new(
        sensor: Arc<Mutex<S>>,
        flow: Arc<Mutex<F>>,
        thermo_store: ThermoStore,
        ui: Arc<dyn UiSink>,
        sample_interval: Duration,
        temp_max_high: f64,
        temp_max_low: f64,
        freezer_event_min: Duration,
    ) -> Self {
        Self {
            sensor,
            flow,
            thermo_store,
            ui,
            sample_interval,
            temp_max_high,
            temp_max_low,
            freezer_event_min,
            last_transition: None,
        }
    }

    #[instrument(skip_all, name = "thermo_controller")]
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.sample_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("thermo controller stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.sample_once().await;
                }
            }
        }
    }

    /// One sample-and-act cycle: §4.3 steps 1-5.
    async fn sample_once(&mut self) {
        let reading = {
            let mut sensor = self.sensor.lock().await;
            sensor.read_celsius(1)
        };
        let temp = match reading {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "temperature sensor read failed; skipping this cycle");
                return;
            }
        };

        if let Err(e) = self.thermo_store.log_reading(1, temp).await {
            warn!(error = %e, "failed to persist temperature reading");
        }
        self.ui.set_temperature(temp);

        let current = {
            let flow = self.flow.lock().await;
            flow.fridge_status()
        };

        if temp >= self.temp_max_high && current != FridgeState::On {
            self.try_transition_on(temp).await;
        } else if temp <= self.temp_max_low && current != FridgeState::Off {
            self.transition_off(temp).await;
        }
    }

    async fn try_transition_on(&mut self, temp: f64) {
        let now = Instant::now();
        if let Some(last) = self.last_transition {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.freezer_event_min {
                let err = crate::error::CoreError::ShortCycle {
                    remaining: (self.freezer_event_min - elapsed).as_secs() as i64,
                    minimum: self.freezer_event_min.as_secs() as i64,
                };
                warn!(temp_c = temp, "{err}");
                return;
            }
        }
        let mut flow = self.flow.lock().await;
        match flow.enable_fridge() {
            Ok(()) => {
                self.last_transition = Some(now);
                info!(temp_c = temp, "fridge enabled");
                self.ui.set_freezer(true);
            }
            Err(e) => warn!(error = %e, "failed to enable fridge relay"),
        }
    }

    /// Off transitions are always allowed immediately — safety-forward
    /// per §4.3.
    async fn transition_off(&mut self, temp: f64) {
        let mut flow = self.flow.lock().await;
        match flow.disable_fridge() {
            Ok(()) => {
                self.last_transition = Some(Instant::now());
                info!(temp_c = temp, "fridge disabled");
                self.ui.set_freezer(false);
            }
            Err(e) => warn!(error = %e, "failed to disable fridge relay"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::flow::MockFlowController;
    use crate::ui::NullUi;

    async fn controller(
        high: f64,
        low: f64,
        min: Duration,
    ) -> (
        ThermoController<MockTempSensor, MockFlowController>,
        Arc<Mutex<MockTempSensor>>,
        Arc<Mutex<MockFlowController>>,
    ) {
        let db = Database::test_db().await;
        let sensor = Arc::new(Mutex::new(MockTempSensor { celsius: 0.0 }));
        let flow = Arc::new(Mutex::new(MockFlowController::new()));
        let ctl = ThermoController::new(
            sensor.clone(),
            flow.clone(),
            ThermoStore::new(db),
            Arc::new(NullUi),
            Duration::from_millis(10),
            high,
            low,
            min,
        );
        (ctl, sensor, flow)
    }

    #[tokio::test]
    async fn enables_fridge_above_high_threshold() {
        let (mut ctl, sensor, flow) = controller(4.0, 1.0, Duration::from_secs(0)).await;
        sensor.lock().await.celsius = 5.0;
        ctl.sample_once().await;
        assert_eq!(flow.lock().await.fridge_status(), FridgeState::On);
    }

    #[tokio::test]
    async fn disables_fridge_below_low_threshold_always() {
        let (mut ctl, sensor, flow) = controller(4.0, 1.0, Duration::from_secs(600)).await;
        sensor.lock().await.celsius = 5.0;
        ctl.sample_once().await;
        assert_eq!(flow.lock().await.fridge_status(), FridgeState::On);

        sensor.lock().await.celsius = 0.5;
        ctl.sample_once().await;
        assert_eq!(flow.lock().await.fridge_status(), FridgeState::Off);
    }

    #[tokio::test]
    async fn short_cycle_gate_refuses_rapid_reenable() {
        // S5: on at t=0, off at t=10s, on-request at t=20s refused with
        // freezer_event_min=60s; state stays off.
        let (mut ctl, sensor, flow) = controller(4.0, 1.0, Duration::from_secs(60)).await;

        sensor.lock().await.celsius = 5.0;
        ctl.sample_once().await;
        assert_eq!(flow.lock().await.fridge_status(), FridgeState::On);

        sensor.lock().await.celsius = 0.5;
        ctl.sample_once().await;
        assert_eq!(flow.lock().await.fridge_status(), FridgeState::Off);

        // Immediately request on again — inside the 60s window.
        sensor.lock().await.celsius = 5.0;
        ctl.sample_once().await;
        assert_eq!(
            flow.lock().await.fridge_status(),
            FridgeState::Off,
            "on-request refused within freezer_event_min"
        );
    }

    #[tokio::test]
    async fn no_change_in_dead_band() {
        let (mut ctl, sensor, flow) = controller(4.0, 1.0, Duration::from_secs(0)).await;
        sensor.lock().await.celsius = 2.5;
        ctl.sample_once().await;
        assert_eq!(flow.lock().await.fridge_status(), FridgeState::Unknown);
    }
}

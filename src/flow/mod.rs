//! Flow controller driver (§4.2): cumulative tick counter, valve, and
//! fridge relay sitting on top of a serial device. All methods may fail
//! with an I/O error; policy on failure (fail-closed for the valve) lives
//! in `PourSession`/`ThermoController`, not here.

use std::io::{Read, Write};
use std::path::Path;

use tracing::warn;

/// Fridge relay state. `Unknown` only at startup, before the first
/// explicit command — §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FridgeState {
    On,
    Off,
    Unknown,
}

/// Capability seam for the flow sensor + valve + fridge relay hardware.
/// `SerialFlowController` is the real adapter; `MockFlowController` backs
/// the test suite — both implement this trait so `PourSession` and
/// `ThermoController` never see hardware directly.
pub trait FlowController: Send + Sync {
    /// Current cumulative pulse count since the last `clear_ticks`.
    /// Idempotent: repeated reads with no flow return the same value.
    fn read_ticks(&mut self) -> Result<u32, String>;

    /// Reset the counter to 0.
    fn clear_ticks(&mut self) -> Result<(), String>;

    /// Idempotent: opening an open valve is a no-op.
    fn open_valve(&mut self) -> Result<(), String>;

    /// Idempotent: closing a closed valve is a no-op.
    fn close_valve(&mut self) -> Result<(), String>;

    fn enable_fridge(&mut self) -> Result<(), String>;

    fn disable_fridge(&mut self) -> Result<(), String>;

    fn fridge_status(&self) -> FridgeState;
}

/// Byte-oriented adapter over a serial device path. The wire protocol for
/// the flow/valve/relay board is out of scope for this core (§1); this
/// implementation frames nothing beyond a single command byte per
/// operation and a 4-byte little-endian tick count on read, which is
/// enough to exercise the device file without inventing a protocol this
/// spec doesn't define.
pub struct SerialFlowController {
    device: std::fs::File,
    valve_open: bool,
    fridge: FridgeState,
}

impl SerialFlowController {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, String> {
        let device = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| format!("open {}: {e}", path.as_ref().display()))?;
        Ok(Self {
            device,
            valve_open: false,
            fridge: FridgeState::Unknown,
        })
    }

    fn write_cmd(&mut self, byte: u8) -> Result<(), String> {
        self.device
            .write_all(&[byte])
            .map_err(|e| format!("write command {byte:#x}: {e}"))
    }
}

impl FlowController for SerialFlowController {
    fn read_ticks(&mut self) -> Result<u32, String> {
        self.write_cmd(b'R')?;
        let mut buf = [0u8; 4];
        self.device
            .read_exact(&mut buf)
            .map_err(|e| format!("read ticks: {e}"))?;
        Ok(u32::from_le_bytes(buf))
    }

    fn clear_ticks(&mut self) -> Result<(), String> {
        self.write_cmd(b'C')
    }

    fn open_valve(&mut self) -> Result<(), String> {
        if self.valve_open {
            return Ok(());
        }
        self.write_cmd(b'O')?;
        self.valve_open = true;
        Ok(())
    }

    fn close_valve(&mut self) -> Result<(), String> {
        if !self.valve_open {
            return Ok(());
        }
        self.write_cmd(b'X')?;
        self.valve_open = false;
        Ok(())
    }

    fn enable_fridge(&mut self) -> Result<(), String> {
        self.write_cmd(b'F')?;
        self.fridge = FridgeState::On;
        Ok(())
    }

    fn disable_fridge(&mut self) -> Result<(), String> {
        self.write_cmd(b'f')?;
        self.fridge = FridgeState::Off;
        Ok(())
    }

    fn fridge_status(&self) -> FridgeState {
        self.fridge
    }
}

/// In-memory test double. `read_ticks` returns whatever the test harness
/// has pushed with `set_ticks`/`advance_ticks`.
#[derive(Debug, Default)]
pub struct MockFlowController {
    ticks: u32,
    valve_open: bool,
    fridge: Option<FridgeState>,
    fail_next_read: bool,
}

impl MockFlowController {
    pub fn new() -> Self {
        Self {
            fridge: None,
            ..Default::default()
        }
    }

    pub fn set_ticks(&mut self, ticks: u32) {
        self.ticks = ticks;
    }

    pub fn advance_ticks(&mut self, delta: u32) {
        self.ticks = self.ticks.saturating_add(delta);
    }

    pub fn valve_is_open(&self) -> bool {
        self.valve_open
    }

    pub fn fail_next_read(&mut self) {
        self.fail_next_read = true;
    }
}

impl FlowController for MockFlowController {
    fn read_ticks(&mut self) -> Result<u32, String> {
        if self.fail_next_read {
            self.fail_next_read = false;
            warn!("mock flow controller simulating read failure");
            return Err("simulated flow I/O error".to_string());
        }
        Ok(self.ticks)
    }

    fn clear_ticks(&mut self) -> Result<(), String> {
        self.ticks = 0;
        Ok(())
    }

    fn open_valve(&mut self) -> Result<(), String> {
        self.valve_open = true;
        Ok(())
    }

    fn close_valve(&mut self) -> Result<(), String> {
        self.valve_open = false;
        Ok(())
    }

    fn enable_fridge(&mut self) -> Result<(), String> {
        self.fridge = Some(FridgeState::On);
        Ok(())
    }

    fn disable_fridge(&mut self) -> Result<(), String> {
        self.fridge = Some(FridgeState::Off);
        Ok(())
    }

    fn fridge_status(&self) -> FridgeState {
        self.fridge.unwrap_or(FridgeState::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_ticks_is_idempotent_with_no_flow() {
        let mut f = MockFlowController::new();
        f.set_ticks(42);
        f.clear_ticks().unwrap();
        assert_eq!(f.read_ticks().unwrap(), 0);
        f.clear_ticks().unwrap();
        assert_eq!(f.read_ticks().unwrap(), 0);
    }

    #[test]
    fn close_valve_after_any_number_of_calls_leaves_it_closed() {
        let mut f = MockFlowController::new();
        f.open_valve().unwrap();
        assert!(f.valve_is_open());
        f.close_valve().unwrap();
        f.close_valve().unwrap();
        f.close_valve().unwrap();
        assert!(!f.valve_is_open());
    }

    #[test]
    fn fridge_status_starts_unknown() {
        let f = MockFlowController::new();
        assert_eq!(f.fridge_status(), FridgeState::Unknown);
    }
}

//! LCD UI / screen rotation (§11 supplemented feature). `UiSink` is the
//! emit-to-sink port the dispensing loop writes through; it never knows
//! whether a real LCD is attached.

use tracing::{debug, info};

use crate::db::models::User;

/// The plates the original rotates through: main, temp, freezer,
/// last-drink, drinker. Modeled as discrete calls rather than a single
/// "set screen" method so each component only touches the facts it owns.
pub trait UiSink: Send + Sync {
    fn set_current_plate(&self, user: &User);

    fn activity(&self, ounces_this_glass: f64, ounces_total: f64);

    fn set_temperature(&self, celsius: f64);

    fn set_freezer(&self, on: bool);

    fn set_last_drink(&self, user: &User, ounces: f64, bac: f64);

    fn clear(&self);
}

/// Default when `UI.use_lcd` is false, matching the original's
/// `Display('/dev/null')` fallback: every transition is logged at debug
/// level and nothing else happens.
#[derive(Debug, Default)]
pub struct NullUi;

impl UiSink for NullUi {
    fn set_current_plate(&self, user: &User) {
        debug!(user = %user.name, "ui: current plate");
    }

    fn activity(&self, ounces_this_glass: f64, ounces_total: f64) {
        debug!(ounces_this_glass, ounces_total, "ui: activity");
    }

    fn set_temperature(&self, celsius: f64) {
        debug!(celsius, "ui: temperature");
    }

    fn set_freezer(&self, on: bool) {
        debug!(on, "ui: freezer");
    }

    fn set_last_drink(&self, user: &User, ounces: f64, bac: f64) {
        debug!(user = %user.name, ounces, bac, "ui: last drink");
    }

    fn clear(&self) {
        debug!("ui: clear");
    }
}

/// `UI.use_lcd = true` but no real MTX Orb serial driver is wired up (out
/// of scope per §1) — renders the 4-line plate text to the log at `info`
/// level instead, so the interface has a real, observable effect.
#[derive(Debug, Default)]
pub struct LogLcd;

impl UiSink for LogLcd {
    fn set_current_plate(&self, user: &User) {
        info!(target: "lcd", "[{:<16}]\n[pour for {:<10}]", "kegbot", user.name);
    }

    fn activity(&self, ounces_this_glass: f64, ounces_total: f64) {
        info!(target: "lcd", "[{:>5.1} oz this glass]\n[{:>5.1} oz total]", ounces_this_glass, ounces_total);
    }

    fn set_temperature(&self, celsius: f64) {
        info!(
            target: "lcd",
            "[fridge: {:>4.1}C / {:>4.1}F]",
            celsius,
            crate::thermo::celsius_to_fahrenheit(celsius)
        );
    }

    fn set_freezer(&self, on: bool) {
        info!(target: "lcd", "[compressor: {}]", if on { "on" } else { "off" });
    }

    fn set_last_drink(&self, user: &User, ounces: f64, bac: f64) {
        info!(
            target: "lcd",
            "[last: {:<10}]\n[{:>5.1} oz, bac~{:.3}]",
            user.name, ounces, bac
        );
    }

    fn clear(&self) {
        info!(target: "lcd", "[cleared]");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Gender;

    fn user() -> User {
        User {
            id: 1,
            name: "ace".into(),
            weight_lbs: 180.0,
            gender: Gender::Male,
        }
    }

    #[test]
    fn null_ui_does_not_panic_on_any_call() {
        let ui = NullUi;
        ui.set_current_plate(&user());
        ui.activity(1.0, 2.0);
        ui.set_temperature(4.0);
        ui.set_freezer(true);
        ui.set_last_drink(&user(), 12.0, 0.04);
        ui.clear();
    }

    #[test]
    fn log_lcd_does_not_panic_on_any_call() {
        let ui = LogLcd;
        ui.set_current_plate(&user());
        ui.activity(1.0, 2.0);
        ui.set_temperature(4.0);
        ui.set_freezer(true);
        ui.set_last_drink(&user(), 12.0, 0.04);
        ui.clear();
    }
}

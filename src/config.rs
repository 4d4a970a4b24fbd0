use std::collections::HashSet;

use ini::Ini;

use crate::error::CoreError;

/// `Devices.*` — serial device paths.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub onewire: String,
    pub lcd: String,
    pub flow: String,
    pub thermo: String,
}

/// `UI.*`.
#[derive(Debug, Clone)]
pub struct UiConfig {
    pub use_lcd: bool,
    pub lcd_model: String,
}

/// `Thermo.*` — thresholds in degrees Celsius.
#[derive(Debug, Clone)]
pub struct ThermoConfig {
    pub use_thermo: bool,
    pub temp_max_high: f64,
    pub temp_max_low: f64,
}

/// `Timing.*` — all seconds, float except `freezer_event_min`.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub ib_refresh_timeout: f64,
    pub ib_idle_min_disconnected: f64,
    pub ib_missing_ceiling: f64,
    pub ib_idle_timeout: f64,
    pub freezer_event_min: i64,
}

/// `Flow.*`.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub polltime: f64,
}

/// `Users.*`.
#[derive(Debug, Clone)]
pub struct UsersConfig {
    pub ignoreids: HashSet<u64>,
}

/// `Logging.*`.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub use_sql: bool,
    pub use_logfile: bool,
    pub use_stream: bool,
    pub logfile: String,
    pub logformat: String,
    pub logtable: String,
}

/// `AIM.*` — chat bot gate; the bot itself is a `NoopBot` (see `bot`), but
/// the config key is real and toggles whether the admin shell's `bot`
/// subcommand is wired up at all.
#[derive(Debug, Clone)]
pub struct AimConfig {
    pub use_aim: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub devices: DeviceConfig,
    pub ui: UiConfig,
    pub thermo: ThermoConfig,
    pub timing: TimingConfig,
    pub flow: FlowConfig,
    pub users: UsersConfig,
    pub logging: LoggingConfig,
    pub aim: AimConfig,
}

fn section<'a>(ini: &'a Ini, name: &str) -> Result<&'a ini::Properties, CoreError> {
    ini.section(Some(name))
        .ok_or_else(|| CoreError::Config(format!("missing [{name}] section")))
}

fn get<'a>(props: &'a ini::Properties, section: &str, key: &str) -> Result<&'a str, CoreError> {
    props
        .get(key)
        .ok_or_else(|| CoreError::Config(format!("missing key '{key}' in [{section}]")))
}

fn get_or<'a>(props: &'a ini::Properties, key: &str, default: &'a str) -> &'a str {
    props.get(key).unwrap_or(default)
}

fn parse_bool(section: &str, key: &str, raw: &str) -> Result<bool, CoreError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CoreError::Config(format!(
            "'{key}' in [{section}] is not a boolean: {raw}"
        ))),
    }
}

fn parse_f64(section: &str, key: &str, raw: &str) -> Result<f64, CoreError> {
    raw.trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("'{key}' in [{section}] is not a number: {raw}")))
}

fn parse_i64(section: &str, key: &str, raw: &str) -> Result<i64, CoreError> {
    raw.trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("'{key}' in [{section}] is not an integer: {raw}")))
}

impl AppConfig {
    /// Load and validate the INI file at `path`. The database itself is
    /// opened from the `--database`/`KEGBOT_DATABASE` CLI flag, not from
    /// this file — the core is SQLite-only with a fixed, migration-defined
    /// schema, so there is no `[DB]` section to parse here.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let _ = dotenvy::dotenv();

        let ini = Ini::load_from_file(path)
            .map_err(|e| CoreError::Config(format!("failed to read {path}: {e}")))?;

        let dev_s = section(&ini, "Devices")?;
        let devices = DeviceConfig {
            onewire: get(dev_s, "Devices", "onewire")?.to_string(),
            lcd: get_or(dev_s, "lcd", "/dev/null").to_string(),
            flow: get(dev_s, "Devices", "flow")?.to_string(),
            thermo: get_or(dev_s, "thermo", "/dev/null").to_string(),
        };

        let ui_s = section(&ini, "UI")?;
        let ui = UiConfig {
            use_lcd: parse_bool("UI", "use_lcd", get_or(ui_s, "use_lcd", "false"))?,
            lcd_model: get_or(ui_s, "lcd_model", "CFA-635").to_string(),
        };

        let thermo_s = section(&ini, "Thermo")?;
        let thermo = ThermoConfig {
            use_thermo: parse_bool("Thermo", "use_thermo", get_or(thermo_s, "use_thermo", "true"))?,
            temp_max_high: parse_f64(
                "Thermo",
                "temp_max_high",
                get(thermo_s, "Thermo", "temp_max_high")?,
            )?,
            temp_max_low: parse_f64(
                "Thermo",
                "temp_max_low",
                get(thermo_s, "Thermo", "temp_max_low")?,
            )?,
        };
        if thermo.temp_max_high <= thermo.temp_max_low {
            return Err(CoreError::Config(format!(
                "Thermo.temp_max_high ({}) must be greater than Thermo.temp_max_low ({})",
                thermo.temp_max_high, thermo.temp_max_low
            )));
        }

        let timing_s = section(&ini, "Timing")?;
        let timing = TimingConfig {
            ib_refresh_timeout: parse_f64(
                "Timing",
                "ib_refresh_timeout",
                get(timing_s, "Timing", "ib_refresh_timeout")?,
            )?,
            ib_idle_min_disconnected: parse_f64(
                "Timing",
                "ib_idle_min_disconnected",
                get(timing_s, "Timing", "ib_idle_min_disconnected")?,
            )?,
            ib_missing_ceiling: parse_f64(
                "Timing",
                "ib_missing_ceiling",
                get(timing_s, "Timing", "ib_missing_ceiling")?,
            )?,
            ib_idle_timeout: parse_f64(
                "Timing",
                "ib_idle_timeout",
                get(timing_s, "Timing", "ib_idle_timeout")?,
            )?,
            freezer_event_min: parse_i64(
                "Timing",
                "freezer_event_min",
                get(timing_s, "Timing", "freezer_event_min")?,
            )?,
        };

        let flow_s = section(&ini, "Flow")?;
        let flow = FlowConfig {
            polltime: parse_f64("Flow", "polltime", get(flow_s, "Flow", "polltime")?)?,
        };

        let users_s = section(&ini, "Users")?;
        let ignoreids = get_or(users_s, "ignoreids", "")
            .split_whitespace()
            .map(|tok| {
                tok.parse::<u64>().map_err(|_| {
                    CoreError::Config(format!("invalid token id in Users.ignoreids: {tok}"))
                })
            })
            .collect::<Result<HashSet<u64>, CoreError>>()?;
        let users = UsersConfig { ignoreids };

        let logging_s = section(&ini, "Logging")?;
        let logging = LoggingConfig {
            use_sql: parse_bool("Logging", "use_sql", get_or(logging_s, "use_sql", "false"))?,
            use_logfile: parse_bool(
                "Logging",
                "use_logfile",
                get_or(logging_s, "use_logfile", "false"),
            )?,
            use_stream: parse_bool(
                "Logging",
                "use_stream",
                get_or(logging_s, "use_stream", "true"),
            )?,
            logfile: get_or(logging_s, "logfile", "kegbot.log").to_string(),
            logformat: get_or(logging_s, "logformat", "%(asctime)s %(levelname)s %(message)s")
                .to_string(),
            logtable: get_or(logging_s, "logtable", "logs").to_string(),
        };

        let aim = match ini.section(Some("AIM")) {
            Some(s) => AimConfig {
                use_aim: parse_bool("AIM", "use_aim", get_or(s, "use_aim", "false"))?,
            },
            None => AimConfig { use_aim: false },
        };

        Ok(Self {
            devices,
            ui,
            thermo,
            timing,
            flow,
            users,
            logging,
            aim,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const MINIMAL: &str = r#"
[DB]
host = localhost
user = kegbot
password = hunter2
db = kegbot

[Devices]
onewire = /dev/ow0
flow = /dev/ttyUSB0

[UI]
use_lcd = false

[Thermo]
temp_max_high = 4.0
temp_max_low = 1.0

[Timing]
ib_refresh_timeout = 1.0
ib_idle_min_disconnected = 10.0
ib_missing_ceiling = 3.0
ib_idle_timeout = 60.0
freezer_event_min = 300

[Flow]
polltime = 0.5

[Users]
ignoreids = 1 2 3

[Logging]
use_sql = false
use_logfile = false
use_stream = true
"#;

    #[test]
    fn loads_minimal_fixture() {
        let f = write_fixture(MINIMAL);
        let cfg = AppConfig::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.timing.freezer_event_min, 300);
        assert_eq!(cfg.users.ignoreids, [1u64, 2, 3].into_iter().collect());
        assert!(!cfg.ui.use_lcd);
        assert!(cfg.logging.use_stream);
        assert!(!cfg.aim.use_aim);
    }

    #[test]
    fn rejects_inverted_thermo_thresholds() {
        let body = MINIMAL.replace("temp_max_high = 4.0", "temp_max_high = 0.5");
        let f = write_fixture(&body);
        let err = AppConfig::load(f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn missing_section_is_config_error() {
        let body = MINIMAL.replace("[Flow]\npolltime = 0.5\n", "");
        let f = write_fixture(&body);
        let err = AppConfig::load(f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}

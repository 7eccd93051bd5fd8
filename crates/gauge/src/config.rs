use obd_gauge_bluetooth::BluetoothCtlConfig;
use obd_gauge_worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workers: WorkerConfig,
    pub bluetooth: BluetoothConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub bluetoothctl_path: String,
    pub rfcomm_path: String,
    pub rfcomm_device: u8,
    pub rfcomm_channel: u8,
    pub pin_code: String,
    pub discovery_timeout_seconds: u64,
    pub init_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    pub reply_timeout_seconds: u64,
    pub show_all_devices: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub controls_fade_delay_ms: u64,
    pub controls_fade_duration_ms: u64,
    /// Fraction of the radius kept clear of the bezel.
    pub safe_margin: f32,
    /// Height of a terminal cell divided by its width.
    pub cell_aspect: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            bluetoothctl_path: "bluetoothctl".to_string(),
            rfcomm_path: "rfcomm".to_string(),
            rfcomm_device: 0,
            rfcomm_channel: 1,
            pin_code: "1234".to_string(),
            discovery_timeout_seconds: 12,
            init_timeout_seconds: 10,
            command_timeout_seconds: 20,
            reply_timeout_seconds: 5,
            show_all_devices: false,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            controls_fade_delay_ms: 5_000,
            controls_fade_duration_ms: 1_000,
            safe_margin: 0.08,
            cell_aspect: 2.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl BluetoothConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_seconds)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_seconds)
    }

    pub fn ctl_config(&self) -> BluetoothCtlConfig {
        BluetoothCtlConfig {
            bluetoothctl_path: self.bluetoothctl_path.clone(),
            rfcomm_path: self.rfcomm_path.clone(),
            rfcomm_device: self.rfcomm_device,
            rfcomm_channel: self.rfcomm_channel,
            pin_code: self.pin_code.clone(),
            command_timeout: Duration::from_secs(self.command_timeout_seconds),
            reply_timeout: Duration::from_secs(self.reply_timeout_seconds),
        }
    }
}

impl DisplayConfig {
    pub fn fade_delay(&self) -> Duration {
        Duration::from_millis(self.controls_fade_delay_ms)
    }

    pub fn fade_duration(&self) -> Duration {
        Duration::from_millis(self.controls_fade_duration_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                if path.exists() {
                    tracing::warn!("Ignoring unreadable config {}: {:#}", path.display(), e);
                }
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bluetooth]
            pin_code = "0000"
            show_all_devices = true

            [workers]
            max_workers = 4
            "#,
        )
        .expect("parse");

        assert_eq!(config.bluetooth.pin_code, "0000");
        assert!(config.bluetooth.show_all_devices);
        assert_eq!(config.bluetooth.discovery_timeout_seconds, 12);
        assert_eq!(config.workers.max_workers, 4);
        assert_eq!(config.workers.join_timeout_ms, 2_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn shipped_default_file_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/default.toml");
        let config = Config::load(&path).expect("default.toml parses");
        let defaults = Config::default();

        assert_eq!(config.workers.max_workers, defaults.workers.max_workers);
        assert_eq!(
            config.bluetooth.command_timeout_seconds,
            defaults.bluetooth.command_timeout_seconds
        );
        assert_eq!(config.display.safe_margin, defaults.display.safe_margin);
    }

    #[test]
    fn missing_or_malformed_file_yields_defaults() {
        let missing = Config::load_or_default(Path::new("/nonexistent/obd-gauge.toml"));
        assert_eq!(missing.bluetooth.init_timeout_seconds, 10);

        let dir = std::env::temp_dir().join(format!("obd-gauge-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("config.toml");
        std::fs::write(&path, "[workers\nmax_workers = ").expect("write");
        let broken = Config::load_or_default(&path);
        assert_eq!(broken.workers.max_workers, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn converts_to_backend_config() {
        let ctl = BluetoothConfig::default().ctl_config();
        assert_eq!(ctl.command_timeout, Duration::from_secs(20));
        assert_eq!(ctl.reply_timeout, Duration::from_secs(5));
        assert_eq!(ctl.rfcomm_channel, 1);
    }
}

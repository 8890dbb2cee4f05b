//! Configuration file support for the recovery simulator

use quic_recovery::config::{CongestionAlgorithm, FlowControlConfig, RecoveryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Simulated network path, identical in both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// One-way propagation delay in milliseconds
    #[serde(default = "default_delay")]
    pub delay_ms: u64,
    /// Uniform random extra delay in milliseconds; reorders packets
    #[serde(default)]
    pub jitter_ms: u64,
    /// Probability that a datagram is dropped (0.0 to 1.0)
    #[serde(default)]
    pub loss_rate: f64,
    /// Bottleneck bandwidth in kilobits per second; 0 means unlimited
    #[serde(default = "default_bandwidth")]
    pub bandwidth_kbps: u64,
    /// Seed of the link's random number generator
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_delay() -> u64 {
    20
}

fn default_bandwidth() -> u64 {
    20_000
}

fn default_seed() -> u64 {
    1
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            delay_ms: default_delay(),
            jitter_ms: 0,
            loss_rate: 0.0,
            bandwidth_kbps: default_bandwidth(),
            seed: default_seed(),
        }
    }
}

impl LinkConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

/// Congestion control selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionKind {
    NewReno,
    Cubic,
}

impl From<CongestionKind> for CongestionAlgorithm {
    fn from(kind: CongestionKind) -> Self {
        match kind {
            CongestionKind::NewReno => CongestionAlgorithm::NewReno,
            CongestionKind::Cubic => CongestionAlgorithm::Cubic,
        }
    }
}

/// Loss recovery settings of both endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    #[serde(default = "default_congestion")]
    pub congestion: CongestionKind,
    #[serde(default = "default_true")]
    pub pacing: bool,
    #[serde(default = "default_true")]
    pub ecn: bool,
    /// RTT assumed before the first sample, in milliseconds
    #[serde(default = "default_initial_rtt")]
    pub initial_rtt_ms: u64,
    /// Maximum ACK delay in milliseconds
    #[serde(default = "default_max_ack_delay")]
    pub max_ack_delay_ms: u64,
    #[serde(default = "default_packet_threshold")]
    pub packet_threshold: u64,
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: u64,
    /// Randomly skip packet numbers; runs are only reproducible without it
    #[serde(default = "default_true")]
    pub skip_packet_numbers: bool,
}

fn default_congestion() -> CongestionKind {
    CongestionKind::NewReno
}

fn default_true() -> bool {
    true
}

fn default_initial_rtt() -> u64 {
    333
}

fn default_max_ack_delay() -> u64 {
    25
}

fn default_packet_threshold() -> u64 {
    3
}

fn default_max_datagram_size() -> u64 {
    1200
}

impl Default for RecoverySettings {
    fn default() -> Self {
        RecoverySettings {
            congestion: default_congestion(),
            pacing: true,
            ecn: true,
            initial_rtt_ms: default_initial_rtt(),
            max_ack_delay_ms: default_max_ack_delay(),
            packet_threshold: default_packet_threshold(),
            max_datagram_size: default_max_datagram_size(),
            skip_packet_numbers: true,
        }
    }
}

/// Receive windows of the receiving endpoint, in bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSettings {
    #[serde(default = "default_stream_window")]
    pub stream_window: u64,
    #[serde(default = "default_max_stream_window")]
    pub max_stream_window: u64,
    #[serde(default = "default_connection_window")]
    pub connection_window: u64,
    #[serde(default = "default_max_connection_window")]
    pub max_connection_window: u64,
}

fn default_stream_window() -> u64 {
    64 * 1024
}

fn default_max_stream_window() -> u64 {
    6 * 1024 * 1024
}

fn default_connection_window() -> u64 {
    96 * 1024
}

fn default_max_connection_window() -> u64 {
    15 * 1024 * 1024
}

impl Default for WindowSettings {
    fn default() -> Self {
        WindowSettings {
            stream_window: default_stream_window(),
            max_stream_window: default_max_stream_window(),
            connection_window: default_connection_window(),
            max_connection_window: default_max_connection_window(),
        }
    }
}

/// Complete simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Bytes transferred on the stream
    #[serde(default = "default_transfer_size")]
    pub transfer_size: u64,
    /// Give up after this much simulated time, in seconds
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: u64,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub windows: WindowSettings,
}

fn default_transfer_size() -> u64 {
    4 * 1024 * 1024
}

fn default_time_limit() -> u64 {
    120
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            transfer_size: default_transfer_size(),
            time_limit_secs: default_time_limit(),
            link: LinkConfig::default(),
            recovery: RecoverySettings::default(),
            windows: WindowSettings::default(),
        }
    }
}

impl SimConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: SimConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.link.loss_rate) {
            return Err(ConfigError::Invalid(format!(
                "loss_rate must be in [0, 1), got {}",
                self.link.loss_rate
            )));
        }
        if self.transfer_size == 0 {
            return Err(ConfigError::Invalid("transfer_size must be positive".to_string()));
        }
        if self.recovery.max_datagram_size < 1200 {
            return Err(ConfigError::Invalid(format!(
                "max_datagram_size must be at least 1200, got {}",
                self.recovery.max_datagram_size
            )));
        }
        let windows = &self.windows;
        if windows.stream_window == 0 || windows.connection_window == 0 {
            return Err(ConfigError::Invalid("receive windows must be positive".to_string()));
        }
        if windows.max_stream_window < windows.stream_window
            || windows.max_connection_window < windows.connection_window
        {
            return Err(ConfigError::Invalid(
                "maximum receive windows must not be below the initial windows".to_string(),
            ));
        }
        Ok(())
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        let recovery = &self.recovery;
        RecoveryConfig::default()
            .with_congestion(recovery.congestion.into())
            .with_pacing(recovery.pacing)
            .with_ecn(recovery.ecn)
            .with_initial_rtt(Duration::from_millis(recovery.initial_rtt_ms))
            .with_max_ack_delay(Duration::from_millis(recovery.max_ack_delay_ms))
            .with_packet_threshold(recovery.packet_threshold)
            .with_max_datagram_size(recovery.max_datagram_size)
            .with_skip_packet_numbers(recovery.skip_packet_numbers)
    }

    pub fn flow_control_config(&self) -> FlowControlConfig {
        let windows = &self.windows;
        FlowControlConfig::default()
            .with_stream_window(windows.stream_window, windows.max_stream_window)
            .with_connection_window(windows.connection_window, windows.max_connection_window)
    }

    /// Example configuration with a lossy, reordering path
    pub fn example() -> Self {
        SimConfig {
            transfer_size: 8 * 1024 * 1024,
            time_limit_secs: 60,
            link: LinkConfig {
                delay_ms: 40,
                jitter_ms: 5,
                loss_rate: 0.01,
                bandwidth_kbps: 50_000,
                seed: 7,
            },
            recovery: RecoverySettings {
                congestion: CongestionKind::Cubic,
                ..RecoverySettings::default()
            },
            windows: WindowSettings::default(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: SimConfig = toml::from_str("").unwrap();
        assert_eq!(config.transfer_size, 4 * 1024 * 1024);
        assert_eq!(config.link.delay_ms, 20);
        assert_eq!(config.recovery.congestion, CongestionKind::NewReno);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = SimConfig::example();
        let toml = toml::to_string(&config).unwrap();
        let parsed: SimConfig = toml::from_str(&toml).unwrap();

        assert_eq!(parsed.link.seed, 7);
        assert_eq!(parsed.recovery.congestion, CongestionKind::Cubic);
    }

    #[test]
    fn test_partial_section() {
        let config: SimConfig = toml::from_str(
            r#"
            transfer_size = 1000

            [link]
            loss_rate = 0.05

            [recovery]
            congestion = "cubic"
            "#,
        )
        .unwrap();
        assert_eq!(config.link.loss_rate, 0.05);
        assert_eq!(config.link.delay_ms, 20);
        assert_eq!(config.recovery_config().congestion, CongestionAlgorithm::Cubic);
    }

    #[test]
    fn test_validation() {
        let mut config = SimConfig::default();
        config.link.loss_rate = 1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SimConfig::default();
        config.windows.max_stream_window = 1;
        assert!(config.validate().is_err());
    }
}

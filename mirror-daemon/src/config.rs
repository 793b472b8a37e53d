//! Configuration for the mirroring daemon.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mirror_core::{EncoderConfig, SessionConfig, Watermarks};

use crate::error::DaemonError;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub network: NetworkConfig,
    pub capture: CaptureConfig,
    pub session: SessionTuning,
    pub netcfg: NetcfgConfig,
    pub logging: LoggingConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the viewer listener on.
    pub bind_address: String,
    /// TCP port for viewer sessions.
    pub port: u16,
    /// Concurrent viewers accepted (the capture pipeline serves one).
    pub max_connections: usize,
    /// Unwritten bytes per connection above which frames are held back.
    pub alert_threshold_bytes: usize,
}

/// Capture and encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second.
    pub framerate: u32,
    pub bitrate_kbps: u32,
    /// Seconds between sync frames.
    pub gop_secs: u32,
    /// zstd level for the synthetic pattern (1 = fastest).
    pub compression_level: i32,
    /// Largest geometry the capture source accepts. Larger requests
    /// fall back to the 1280x720 class.
    pub max_dimension: u32,
    /// Rotate the synthetic display every N seconds (0 = never).
    pub rotate_every_secs: u64,
}

/// Session scheduling and liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTuning {
    pub handshake_timeout_secs: u64,
    pub capture_start_timeout_secs: u64,
    pub probe_interval_secs: u64,
    /// Unacknowledged probes tolerated before the viewer is dropped.
    pub probe_drift_threshold: u16,
    pub slice_interval_ms: u64,
    pub stats_interval_secs: u64,
    /// Queue depth that pauses the encoder.
    pub high_watermark: usize,
    /// Queue depth that resumes it.
    pub low_watermark: usize,
}

/// Network-configuration daemon bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetcfgConfig {
    pub enabled: bool,
    /// Local socket of the network-configuration daemon.
    pub socket: PathBuf,
    pub request_timeout_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 7340,
            max_connections: 1,
            alert_threshold_bytes: 512 * 1024,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 30,
            bitrate_kbps: 4000,
            gop_secs: 1,
            compression_level: 1,
            max_dimension: 4096,
            rotate_every_secs: 0,
        }
    }
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            capture_start_timeout_secs: 60,
            probe_interval_secs: 5,
            probe_drift_threshold: 3,
            slice_interval_ms: 20,
            stats_interval_secs: 10,
            high_watermark: 4,
            low_watermark: 1,
        }
    }
}

impl Default for NetcfgConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket: PathBuf::from("/run/netcfg.sock"),
            request_timeout_ms: 3000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl DaemonConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, DaemonError> {
        Ok(format!("{}:{}", self.network.bind_address, self.network.port).parse()?)
    }

    /// Session policy, with out-of-range values clamped.
    pub fn to_session_config(&self) -> SessionConfig {
        let s = &self.session;
        let watermarks = Watermarks::new(s.high_watermark, s.low_watermark).unwrap_or_else(|e| {
            tracing::warn!("{e}; using default watermarks");
            Watermarks::default()
        });
        SessionConfig {
            handshake_timeout: Duration::from_secs(s.handshake_timeout_secs.max(1)),
            capture_start_timeout: Duration::from_secs(s.capture_start_timeout_secs.max(1)),
            probe_interval: Duration::from_secs(s.probe_interval_secs.max(1)),
            probe_drift_threshold: s.probe_drift_threshold.max(1),
            slice_interval: Duration::from_millis(s.slice_interval_ms.clamp(1, 1000)),
            stats_interval: Duration::from_secs(s.stats_interval_secs.max(1)),
            watermarks,
            max_connections: self.network.max_connections.max(1),
        }
    }

    /// Requested encoder geometry and rate.
    pub fn to_encoder_config(&self) -> EncoderConfig {
        let c = &self.capture;
        EncoderConfig {
            width: c.width.max(16),
            height: c.height.max(16),
            framerate: c.framerate.clamp(1, 60),
            bitrate_bps: c.bitrate_kbps.max(100).saturating_mul(1000),
        }
    }

    pub fn netcfg_timeout(&self) -> Duration {
        Duration::from_millis(self.netcfg.request_timeout_ms.max(100))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&DaemonConfig::default()).unwrap();
        assert!(text.contains("alert_threshold_bytes"));
        assert!(text.contains("slice_interval_ms"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&DaemonConfig::default()).unwrap();
        let parsed: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, 7340);
        assert_eq!(parsed.capture.framerate, 30);
        assert!(!parsed.netcfg.enabled);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: DaemonConfig = toml::from_str("[network]\nport = 9000\n").unwrap();
        assert_eq!(parsed.network.port, 9000);
        assert_eq!(parsed.network.max_connections, 1);
        assert_eq!(parsed.session.probe_drift_threshold, 3);
    }

    #[test]
    fn session_config_matches_defaults() {
        let session = DaemonConfig::default().to_session_config();
        assert_eq!(session, SessionConfig::default());
    }

    #[test]
    fn to_session_config_clamps() {
        let mut cfg = DaemonConfig::default();
        cfg.session.slice_interval_ms = 0;
        cfg.session.probe_drift_threshold = 0;
        cfg.session.high_watermark = 1;
        cfg.session.low_watermark = 5; // inverted
        cfg.network.max_connections = 0;
        let session = cfg.to_session_config();
        assert_eq!(session.slice_interval, Duration::from_millis(1));
        assert_eq!(session.probe_drift_threshold, 1);
        assert_eq!(session.watermarks, Watermarks::default());
        assert_eq!(session.max_connections, 1);
    }

    #[test]
    fn to_encoder_config_clamps() {
        let mut cfg = DaemonConfig::default();
        cfg.capture.framerate = 240;
        cfg.capture.bitrate_kbps = 8000;
        let enc = cfg.to_encoder_config();
        assert_eq!(enc.framerate, 60);
        assert_eq!(enc.bitrate_bps, 8_000_000);
    }

    #[test]
    fn listen_addr_parses() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.listen_addr().unwrap().port(), 7340);

        let mut bad = DaemonConfig::default();
        bad.network.bind_address = "not an address".into();
        assert!(matches!(bad.listen_addr(), Err(DaemonError::Address(_))));
    }
}

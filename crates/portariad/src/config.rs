use portaria_core::{GateTiming, LivenessConfig, OrchestratorConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}

/// Daemon configuration.
///
/// Defaults, then the TOML file named by `PORTARIA_CONFIG` (if any), then
/// `PORTARIA_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// V4L2 device of the face camera (default: /dev/video0).
    pub face_camera: String,
    /// V4L2 device of the plate camera (default: /dev/video1).
    pub plate_camera: String,
    pub descriptor_dim: usize,
    /// Maximum Euclidean distance for a positive face match.
    pub match_threshold: f32,
    /// Minimum interval between two registrations of the same resident.
    pub cooldown_secs: u64,
    pub liveness_required: bool,
    pub liveness: LivenessConfig,
    pub face_poll_ms: u64,
    pub plate_poll_ms: u64,
    pub records_page_size: usize,
    pub pedestrian_travel_ms: u64,
    pub pedestrian_auto_close_ms: u64,
    pub vehicle_travel_ms: u64,
    pub vehicle_auto_close_ms: u64,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("portaria");

        let pedestrian = GateTiming::pedestrian();
        let vehicle = GateTiming::vehicle();
        Self {
            db_path: data_dir.join("portaria.db"),
            face_camera: "/dev/video0".to_string(),
            plate_camera: "/dev/video1".to_string(),
            descriptor_dim: portaria_core::registry::DEFAULT_DESCRIPTOR_DIM,
            match_threshold: portaria_core::matcher::DEFAULT_DISTANCE_THRESHOLD,
            cooldown_secs: 30,
            liveness_required: true,
            liveness: LivenessConfig::default(),
            face_poll_ms: 300,
            plate_poll_ms: 5_000,
            records_page_size: 10,
            pedestrian_travel_ms: pedestrian.travel.as_millis() as u64,
            pedestrian_auto_close_ms: pedestrian.auto_close.as_millis() as u64,
            vehicle_travel_ms: vehicle.travel.as_millis() as u64,
            vehicle_auto_close_ms: vehicle.auto_close.as_millis() as u64,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("PORTARIA_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("face_poll_ms", self.face_poll_ms == 0),
            ("plate_poll_ms", self.plate_poll_ms == 0),
            ("records_page_size", self.records_page_size == 0),
            ("descriptor_dim", self.descriptor_dim == 0),
        ];
        match positive.into_iter().find(|(_, zero)| *zero) {
            Some((key, _)) => Err(ConfigError::Invalid {
                key,
                reason: "must be greater than zero",
            }),
            None => Ok(()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply `PORTARIA_*` overrides. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PORTARIA_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PORTARIA_FACE_CAMERA") {
            self.face_camera = v;
        }
        if let Some(v) = lookup("PORTARIA_PLATE_CAMERA") {
            self.plate_camera = v;
        }
        override_parsed(&lookup, "PORTARIA_DESCRIPTOR_DIM", &mut self.descriptor_dim);
        override_parsed(&lookup, "PORTARIA_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "PORTARIA_COOLDOWN_SECS", &mut self.cooldown_secs);
        if let Some(v) = lookup("PORTARIA_LIVENESS_REQUIRED") {
            self.liveness_required = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        override_parsed(&lookup, "PORTARIA_FACE_POLL_MS", &mut self.face_poll_ms);
        override_parsed(&lookup, "PORTARIA_PLATE_POLL_MS", &mut self.plate_poll_ms);
        override_parsed(&lookup, "PORTARIA_RECORDS_PAGE_SIZE", &mut self.records_page_size);
        if let Some(v) = lookup("PORTARIA_BUS") {
            self.session_bus = v.eq_ignore_ascii_case("session");
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            cooldown: Duration::from_secs(self.cooldown_secs),
            liveness_required: self.liveness_required,
            match_threshold: self.match_threshold,
            descriptor_dim: self.descriptor_dim,
            liveness: self.liveness.clone(),
            pedestrian_gate: GateTiming {
                travel: Duration::from_millis(self.pedestrian_travel_ms),
                auto_close: Duration::from_millis(self.pedestrian_auto_close_ms),
            },
            vehicle_gate: GateTiming {
                travel: Duration::from_millis(self.vehicle_travel_ms),
                auto_close: Duration::from_millis(self.vehicle_auto_close_ms),
            },
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config override"),
    }
}

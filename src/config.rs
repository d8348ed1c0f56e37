use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::annotate::{Analytic, AnnotatorSettings};
use crate::metrics::InfluxConfig;
use crate::pipeline::RestartPolicy;
use crate::stream::StreamSettings;

const DEFAULT_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_MODEL: &str = "stub";
const DEFAULT_DEVICE: &str = "CPU";
const DEFAULT_RESTART_BACKOFF_MS: u64 = 500;

/// One camera entry. `path`, `device` and `analytics` stay server-side; the
/// rest is what the dashboard sees.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    pub path: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_analytics")]
    pub analytics: Vec<Analytic>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            latitude: 0.0,
            longitude: 0.0,
            path: String::new(),
            device: default_device(),
            analytics: default_analytics(),
        }
    }
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_analytics() -> Vec<Analytic> {
    vec![Analytic::Pedestrian, Analytic::Vehicle, Analytic::Bike]
}

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    cameras: Option<Vec<CameraConfig>>,
    server: Option<ServerConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    stream: Option<StreamConfigFile>,
    metrics: Option<MetricsConfigFile>,
    urls: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    model: Option<String>,
    tracking: Option<bool>,
    collision: Option<bool>,
    font_path: Option<PathBuf>,
    restart_backoff_ms: Option<u64>,
    max_restarts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    fps: Option<u32>,
    producer_timeout_secs: Option<u64>,
    tile_width: Option<u32>,
    tile_height: Option<u32>,
    tile_wait_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct MetricsConfigFile {
    influx_url: Option<String>,
    database: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub cameras: Vec<CameraConfig>,
    pub addr: String,
    pub model: String,
    pub tracking: bool,
    pub collision: bool,
    /// Overrides the bundled overlay font.
    pub font_path: Option<PathBuf>,
    pub restart: RestartPolicy,
    pub stream: StreamSettings,
    /// `None` disables metrics persistence.
    pub influx: Option<InfluxConfig>,
    /// Dashboard links rendered into the `/dashboard` page.
    pub urls: BTreeMap<String, String>,
}

impl RelayConfig {
    /// Load from `path`, falling back to `RELAY_CONFIG`, then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("RELAY_CONFIG").ok().map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate a config document without touching the environment.
    pub fn parse(raw: &str, format: ConfigFormat) -> Result<Self> {
        let file = parse_config(raw, format)?;
        let mut cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let defaults = StreamSettings::default();
        let pipeline = file.pipeline.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            fps: stream.fps.unwrap_or(defaults.fps),
            producer_timeout: stream
                .producer_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.producer_timeout),
            tile_width: stream.tile_width.unwrap_or(defaults.tile_width),
            tile_height: stream.tile_height.unwrap_or(defaults.tile_height),
            tile_wait: stream
                .tile_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.tile_wait),
            jpeg_quality: stream.jpeg_quality.unwrap_or(defaults.jpeg_quality),
            ..defaults
        };
        let influx = file.metrics.and_then(|metrics| {
            let url = metrics.influx_url?;
            let base = InfluxConfig::default();
            Some(InfluxConfig {
                url,
                database: metrics.database.unwrap_or(base.database),
                username: metrics.username.unwrap_or(base.username),
                password: metrics.password.unwrap_or(base.password),
                ..base
            })
        });
        Ok(Self {
            cameras: file.cameras.unwrap_or_default(),
            addr: file
                .server
                .and_then(|server| server.addr)
                .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            model: pipeline.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            tracking: pipeline.tracking.unwrap_or(true),
            collision: pipeline.collision.unwrap_or(true),
            font_path: pipeline.font_path,
            restart: RestartPolicy {
                backoff: Duration::from_millis(
                    pipeline
                        .restart_backoff_ms
                        .unwrap_or(DEFAULT_RESTART_BACKOFF_MS),
                ),
                max_restarts: pipeline.max_restarts,
            },
            stream,
            influx,
            urls: file.urls.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("RELAY_ADDR") {
            if !addr.trim().is_empty() {
                self.addr = addr;
            }
        }
        if let Ok(fps) = std::env::var("RELAY_FPS") {
            self.stream.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("RELAY_FPS must be a positive integer"))?;
        }
        if let Ok(model) = std::env::var("RELAY_MODEL_PATH") {
            if !model.trim().is_empty() {
                self.model = model;
            }
        }
        if let Ok(url) = std::env::var("RELAY_INFLUX_URL") {
            if !url.trim().is_empty() {
                let mut influx = self.influx.take().unwrap_or_default();
                influx.url = url;
                self.influx = Some(influx);
            }
        }
        if let Ok(value) = std::env::var("RELAY_TRACKING") {
            self.tracking = parse_flag("RELAY_TRACKING", &value)?;
        }
        if let Ok(value) = std::env::var("RELAY_COLLISION") {
            self.collision = parse_flag("RELAY_COLLISION", &value)?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("config must list at least one camera"));
        }
        for (i, cam) in self.cameras.iter().enumerate() {
            if cam.path.trim().is_empty() {
                return Err(anyhow!("camera {} has an empty path", i));
            }
            if !(-90.0..=90.0).contains(&cam.latitude) {
                return Err(anyhow!("camera {} latitude {} out of range", i, cam.latitude));
            }
            if !(-180.0..=180.0).contains(&cam.longitude) {
                return Err(anyhow!("camera {} longitude {} out of range", i, cam.longitude));
            }
            if cam.analytics.is_empty() {
                return Err(anyhow!("camera {} enables no analytics", i));
            }
        }
        self.addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid server addr '{}': {}", self.addr, e))?;
        if self.stream.fps == 0 {
            return Err(anyhow!("stream fps must be greater than zero"));
        }
        if self.stream.tile_width == 0 || self.stream.tile_height == 0 {
            return Err(anyhow!("stream tile size must be non-zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        if self.stream.producer_timeout.is_zero() {
            return Err(anyhow!("producer timeout must be greater than zero"));
        }
        if let Some(influx) = &self.influx {
            url::Url::parse(&influx.url)
                .map_err(|e| anyhow!("invalid influxdb url '{}': {}", influx.url, e))?;
        }
        Ok(())
    }

    /// Collision checks run on tracks, so enabling them enables tracking.
    pub fn annotator_settings(&self) -> AnnotatorSettings {
        AnnotatorSettings {
            tracking: self.tracking || self.collision,
            collision: self.collision,
        }
    }

    /// True when every camera is a synthetic `stub://` source.
    pub fn all_synthetic(&self) -> bool {
        self.cameras.iter().all(|cam| cam.path.starts_with("stub://"))
    }

    /// Camera list as exposed to the dashboard page.
    pub fn dashboard_json(&self) -> serde_json::Value {
        let cameras: Vec<serde_json::Value> = self
            .cameras
            .iter()
            .map(|cam| {
                serde_json::json!({
                    "address": cam.address,
                    "latitude": cam.latitude,
                    "longitude": cam.longitude,
                })
            })
            .collect();
        serde_json::json!({ "cameras": cameras, "urls": self.urls })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

fn parse_config(raw: &str, format: ConfigFormat) -> Result<RelayConfigFile> {
    match format {
        ConfigFormat::Json => serde_json::from_str(raw).map_err(|e| anyhow!("{}", e)),
        ConfigFormat::Toml => toml::from_str(raw).map_err(|e| anyhow!("{}", e)),
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    parse_config(&raw, ConfigFormat::from_path(path))
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", name, other)),
    }
}

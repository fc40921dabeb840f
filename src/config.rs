use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub database: DatabaseConfig,
    pub batching: BatchingConfig,
    pub camera: CameraConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

fn deserialize_source_kind<'de, D>(deserializer: D) -> Result<SourceKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Thresholds governing when a batch is closed and how results are sampled.
#[derive(Debug, Deserialize, Clone)]
pub struct BatchingConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    #[serde(default = "default_image_reference_root")]
    pub image_reference_root: String,
}

fn default_max_batch_size() -> usize {
    32
}

fn default_max_latency_ms() -> u64 {
    100
}

fn default_sampling_rate() -> f64 {
    0.05
}

fn default_image_reference_root() -> String {
    "sampled_images".to_string()
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_latency_ms: default_max_latency_ms(),
            sampling_rate: default_sampling_rate(),
            image_reference_root: default_image_reference_root(),
        }
    }
}

impl Validatable for BatchingConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("batching.max_batch_size must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(format!(
                "batching.sampling_rate must be within [0, 1], got {}",
                self.sampling_rate
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(
        default = "default_source_kind",
        deserialize_with = "deserialize_source_kind"
    )]
    pub source: SourceKind,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_fps")]
    pub fps: u64,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_source_kind() -> SourceKind {
    SourceKind::Synthetic
}

fn default_device() -> String {
    "0".to_string()
}

fn default_fps() -> u64 {
    30
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn fps_to_delay_ms(fps: u64) -> u64 {
    (1000.0 / fps.max(1) as f64).round().max(1.0) as u64
}

impl CameraConfig {
    pub fn get_frame_delay_ms(&self) -> u64 {
        fps_to_delay_ms(self.fps)
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source_kind(),
            device: default_device(),
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Validatable for CameraConfig {
    fn validate(&self) -> Result<(), String> {
        if self.fps == 0 {
            return Err("camera.fps must be at least 1".to_string());
        }
        if self.width == 0 || self.height == 0 {
            return Err("camera resolution must be non-zero".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct WebSocketConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_ping_interval_secs() -> u64 {
    20
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Synthetic,
    Device,
}

impl TryFrom<String> for SourceKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "synthetic" => Ok(Self::Synthetic),
            "device" => Ok(Self::Device),
            other => Err(format!(
                "{} is not a supported frame source. Use either `synthetic` or `device`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {e}"))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("SORTER")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    for check in [config.batching.validate(), config.camera.validate()] {
        if let Err(e) = check {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(config)
}

use crate::frame::StreamMode;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub monitoring: MonitoringConfig,
    pub classifier: ClassifierConfig,
    pub frame_source: FrameSourceConfig,
    pub handoff: HandoffConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
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
pub struct MonitoringConfig {
    #[serde(default)]
    pub mode: StreamMode,
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
    #[serde(default = "default_detection_enabled")]
    pub detection_enabled: bool,
    #[serde(default = "default_auto_capture_enabled")]
    pub auto_capture_enabled: bool,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f32,
    #[serde(default = "default_auto_capture_threshold")]
    pub auto_capture_threshold: f32,
    #[serde(default = "default_simulated_probe_timeout_ms")]
    pub simulated_probe_timeout_ms: u64,
    #[serde(default = "default_live_probe_timeout_ms")]
    pub live_probe_timeout_ms: u64,
}

fn default_cadence_ms() -> u64 {
    10_000
}

fn default_detection_enabled() -> bool {
    true
}

fn default_auto_capture_enabled() -> bool {
    true
}

fn default_alert_threshold() -> f32 {
    70.0
}

fn default_auto_capture_threshold() -> f32 {
    80.0
}

fn default_simulated_probe_timeout_ms() -> u64 {
    5_000
}

fn default_live_probe_timeout_ms() -> u64 {
    3_000
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::default(),
            cadence_ms: default_cadence_ms(),
            detection_enabled: default_detection_enabled(),
            auto_capture_enabled: default_auto_capture_enabled(),
            alert_threshold: default_alert_threshold(),
            auto_capture_threshold: default_auto_capture_threshold(),
            simulated_probe_timeout_ms: default_simulated_probe_timeout_ms(),
            live_probe_timeout_ms: default_live_probe_timeout_ms(),
        }
    }
}

impl MonitoringConfig {
    pub fn get_probe_timeout_ms(&self, mode: StreamMode) -> u64 {
        match mode {
            StreamMode::Simulated => self.simulated_probe_timeout_ms,
            StreamMode::Live => self.live_probe_timeout_ms,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    pub base_url: String,
    #[serde(default)]
    pub subject_id: Option<String>,
    /// Unset by default: classifier calls are unbounded unless configured.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrameSourceConfig {
    pub dataset_base_url: String,
    #[serde(default = "default_drone_host")]
    pub drone_host: String,
}

fn default_drone_host() -> String {
    "192.168.4.1".into()
}

impl FrameSourceConfig {
    pub fn get_dataset_stream_url(&self) -> String {
        format!(
            "{}/api/dataset/random-stream",
            self.dataset_base_url.trim_end_matches('/')
        )
    }

    pub fn get_drone_stream_url(&self) -> String {
        format!("http://{}/stream", self.drone_host)
    }

    pub fn get_drone_capture_url(&self) -> String {
        format!("http://{}/capture", self.drone_host)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HandoffConfig {
    pub path: PathBuf,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_jpeg_quality() -> u8 {
    95
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
    let base_path = std::env::current_dir().expect("Failed to determine the current directory");
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT");

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("DM")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}

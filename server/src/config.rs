use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Capture window duration D in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,
    /// Per-read deadline on the child's stdout.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: f64,
    /// Capture tool binary.
    #[serde(default = "default_tool")]
    pub tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_window_secs() -> f64 {
    1.5
}

fn default_read_timeout_secs() -> f64 {
    1.0
}

fn default_tool() -> String {
    "tshark".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            tool: default_tool(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            capture: CaptureConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("netlens").required(false))
            .add_source(config::Environment::with_prefix("NETLENS").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config file: {}. Using defaults.", e);
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.capture.window_secs, 1.5);
        assert_eq!(config.capture.tool, "tshark");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                "[capture]\nwindow_secs = 2.0",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.capture.window_secs, 2.0);
        assert_eq!(config.capture.read_timeout_secs, 1.0);
        assert_eq!(config.server.port, 8765);
    }
}

mod hot;

use config::{Config as Cfg, Environment, File};
use serde::{Deserialize, de::DeserializeOwned};

use crate::error::Error;

pub use hot::{HotConfig, Reloadable};

/// Delay before a replaced client is released.
pub const CLIENT_CLOSE_DELAY: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            level: default_log_level(),
            otlp_endpoint: None,
        }
    }
}

fn default_service_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Loads `T` from an optional config file overlaid with `APP__*` environment variables.
///
/// Without an explicit path a `configuration.{toml,yaml,json}` in the working
/// directory is used when present.
pub fn load<T: DeserializeOwned>(path: Option<&str>) -> Result<T, Error> {
    dotenvy::dotenv().ok();

    let file = match path {
        Some(path) => File::with_name(path).required(true),
        None => File::with_name("configuration").required(false),
    };

    let config = Cfg::builder()
        .add_source(file)
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        log: LogConfig,
        redis: SampleRedis,
    }

    #[derive(Debug, Deserialize)]
    struct SampleRedis {
        url: String,
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[log]\nlevel = \"debug\"\n\n[redis]\nurl = \"redis://127.0.0.1:6379\""
        )
        .unwrap();

        let sample: Sample = load(file.path().to_str()).unwrap();
        assert_eq!(sample.log.level, "debug");
        assert_eq!(sample.log.service_name, env!("CARGO_PKG_NAME"));
        assert_eq!(sample.redis.url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_missing_required_file_is_an_error() {
        let res: Result<Sample, _> = load(Some("/nonexistent/service-kit-config"));
        assert!(matches!(res, Err(Error::Config(_))));
    }
}

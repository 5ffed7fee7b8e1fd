//! Node configuration, read once from the environment at startup.

use std::time::Duration;

use crate::bridge::codec::{DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_FRAME_BYTES};
use crate::tensor::{InputShape, TensorError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("INPUTDIMS: {0}")]
    InputDims(#[from] TensorError),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    /// HTTP control port.
    pub port: u16,
    /// Port of the listener that accepts frames from the previous hop.
    pub frame_port: u16,
    /// Next hop's frame listener, `host:port`. `None` on the tail node.
    pub forward: Option<String>,
    /// HTTP base URLs of every node in the pipeline.
    pub slices: Vec<String>,
    pub input_shape: InputShape,
    /// `None` waits for results forever.
    pub request_timeout: Option<Duration>,
    pub probe_timeout: Duration,
    pub compression_level: i32,
    pub max_frame_bytes: usize,
}

impl NodeConfig {
    pub fn new(input_shape: InputShape) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            frame_port: 5001,
            forward: None,
            slices: Vec::new(),
            input_shape,
            request_timeout: None,
            probe_timeout: Duration::from_secs(10),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let input_shape: InputShape = get("INPUTDIMS")
            .ok_or(ConfigError::Missing("INPUTDIMS"))?
            .parse()?;
        let mut config = Self::new(input_shape);

        if let Some(host) = get("HOST") {
            config.host = host;
        }
        if let Some(port) = get("PORT") {
            config.port = parse("PORT", &port)?;
        }
        if let Some(port) = get("FRAME_PORT") {
            config.frame_port = parse("FRAME_PORT", &port)?;
        }
        config.forward = get("FORWARD").map(|v| v.trim().to_string());
        config.slices = get("SLICES").map(|v| parse_slices(&v)).unwrap_or_default();

        if let Some(secs) = get("REQUEST_TIMEOUT") {
            let secs: f64 = parse("REQUEST_TIMEOUT", &secs)?;
            config.request_timeout = timeout_from_secs("REQUEST_TIMEOUT", secs)?;
        }
        if let Some(secs) = get("PROBE_TIMEOUT") {
            let secs: f64 = parse("PROBE_TIMEOUT", &secs)?;
            config.probe_timeout = timeout_from_secs("PROBE_TIMEOUT", secs)?
                .ok_or_else(|| invalid("PROBE_TIMEOUT", secs.to_string(), "must be positive"))?;
        }
        if let Some(level) = get("COMPRESSION_LEVEL") {
            config.compression_level = parse("COMPRESSION_LEVEL", &level)?;
        }
        if let Some(max) = get("MAX_FRAME_BYTES") {
            config.max_frame_bytes = parse("MAX_FRAME_BYTES", &max)?;
        }

        Ok(config)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn frame_addr(&self) -> String {
        format!("{}:{}", self.host, self.frame_port)
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(name, value.to_string(), e.to_string()))
}

fn invalid(name: &'static str, value: String, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value,
        reason: reason.into(),
    }
}

/// `0` means no timeout.
fn timeout_from_secs(name: &'static str, secs: f64) -> Result<Option<Duration>, ConfigError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid(name, secs.to_string(), "must be a non-negative number"));
    }
    if secs == 0.0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs_f64(secs)))
}

/// Comma-separated peer list; bare `host:port` entries get `http://`.
fn parse_slices(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.starts_with("http://") || s.starts_with("https://") {
                s.trim_end_matches('/').to_string()
            } else {
                format!("http://{}", s.trim_end_matches('/'))
            }
        })
        .collect()
}

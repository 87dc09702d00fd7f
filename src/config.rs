//! Configuration management for the photo booth backend.
//!
//! Configuration is read from environment variables:
//! - `OPENAI_API_KEY` - Required. Key for the image-editing API.
//! - `IMAGE_API_URL` - Optional. Defaults to `https://api.openai.com/v1/images/edits`.
//! - `IMAGE_MODEL` - Optional. Defaults to `gpt-image-1`.
//! - `IMAGE_SIZE` - Optional. Output size requested upstream. Defaults to `1024x1536`.
//! - `IMAGE_INPUT_FIDELITY` - Optional. Defaults to `high`.
//! - `TRANSFORM_PROMPT` - Optional. Fixed prompt sent with every photo.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `PUBLIC_BASE_URL` - Optional. Base of generated download URLs. Defaults to `http://{HOST}:{PORT}`.
//! - `DATA_DIR` - Optional. Root for the task database and blobs. Defaults to `./data`.
//! - `TASK_STORE` - Optional. `sqlite` (default) or `memory`.
//! - `STORAGE_BUCKET` - Optional. Bucket name used in artifact URLs. Defaults to `photobooth`.
//! - `WATERMARK_PATH` - Optional. Frame asset composited onto results. Defaults to `assets/watermark.png`.
//! - `WATERMARK_WIDTH_RATIO` - Optional. Watermark width as a fraction of the result. Defaults to `0.3`.
//! - `WATERMARK_PADDING_RATIO` - Optional. Bottom padding as a fraction of the result height. Defaults to `0.03`.
//! - `HANDOFF_TTL_SECS` - Optional. Lifetime of QR handoff payloads. Defaults to `600`.
//! - `HANDOFF_MAX_BYTES` - Optional. Largest accepted handoff payload. Defaults to 5 MiB.
//! - `DEV_MODE` - Optional. Disables admin auth when true.
//! - `DASHBOARD_PASSWORD` / `JWT_SECRET` / `JWT_TTL_DAYS` - Admin dashboard auth.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::task::store::TaskStoreType;
use crate::util::env_var_bool;

/// Upper bound for `JWT_TTL_DAYS` (ten years).
pub const MAX_JWT_TTL_DAYS: i64 = 3650;

pub const DEFAULT_IMAGE_API_URL: &str = "https://api.openai.com/v1/images/edits";

pub const DEFAULT_TRANSFORM_PROMPT: &str = "Transform this photo into a vibrant, high-quality \
illustrated portrait. Keep every person's pose, facial features, expression and the overall \
composition recognisable. Use clean lines, rich colours and soft studio lighting. Do not add \
any text or logos.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Authentication mode for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Disabled,
    Password,
}

/// Admin dashboard authentication.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Password accepted by `/api/auth/login`
    pub dashboard_password: Option<String>,

    /// HMAC secret for issued JWTs
    pub jwt_secret: Option<String>,

    /// Lifetime of issued tokens
    pub jwt_ttl_days: i64,
}

impl AuthConfig {
    pub fn auth_mode(&self, dev_mode: bool) -> AuthMode {
        if dev_mode {
            AuthMode::Disabled
        } else {
            AuthMode::Password
        }
    }

    pub fn auth_required(&self, dev_mode: bool) -> bool {
        self.auth_mode(dev_mode) == AuthMode::Password
    }
}

/// Upstream image-editing service settings.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub prompt: String,
    pub size: String,
    pub input_fidelity: String,
}

impl TransformConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            api_url: DEFAULT_IMAGE_API_URL.to_string(),
            model: "gpt-image-1".to_string(),
            prompt: DEFAULT_TRANSFORM_PROMPT.to_string(),
            size: "1024x1536".to_string(),
            input_fidelity: "high".to_string(),
        }
    }
}

/// Watermark/frame compositing settings.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub asset_path: PathBuf,
    pub width_ratio: f32,
    pub padding_ratio: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            asset_path: PathBuf::from("assets/watermark.png"),
            width_ratio: 0.3,
            padding_ratio: 0.03,
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Base URL embedded in artifact download links
    pub public_base_url: String,

    /// Root directory for the task database and blob files
    pub data_dir: PathBuf,

    /// Task record backend
    pub task_store: TaskStoreType,

    /// Bucket name for stored artifacts
    pub storage_bucket: String,

    /// Skips admin auth when set
    pub dev_mode: bool,

    pub auth: AuthConfig,

    pub transform: TransformConfig,

    pub overlay: OverlayConfig,

    /// Lifetime of handoff payloads
    pub handoff_ttl: Duration,

    /// Size cap for handoff payloads (serialized JSON bytes)
    pub handoff_max_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENAI_API_KEY` is not set and
    /// `ConfigError::InvalidValue` for unparsable numbers.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;

        let defaults = TransformConfig::new(api_key);
        let transform = TransformConfig {
            api_url: std::env::var("IMAGE_API_URL").unwrap_or(defaults.api_url.clone()),
            model: std::env::var("IMAGE_MODEL").unwrap_or(defaults.model.clone()),
            prompt: std::env::var("TRANSFORM_PROMPT").unwrap_or(defaults.prompt.clone()),
            size: std::env::var("IMAGE_SIZE").unwrap_or(defaults.size.clone()),
            input_fidelity: std::env::var("IMAGE_INPUT_FIDELITY")
                .unwrap_or(defaults.input_fidelity.clone()),
            ..defaults
        };

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = parse_env("PORT", 3000)?;
        let public_base_url = std::env::var("PUBLIC_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let task_store = std::env::var("TASK_STORE")
            .map(|value| TaskStoreType::from_str(&value))
            .unwrap_or_default();

        let overlay_defaults = OverlayConfig::default();
        let overlay = OverlayConfig {
            asset_path: std::env::var("WATERMARK_PATH")
                .map(PathBuf::from)
                .unwrap_or(overlay_defaults.asset_path),
            width_ratio: parse_ratio("WATERMARK_WIDTH_RATIO", overlay_defaults.width_ratio)?,
            padding_ratio: parse_ratio("WATERMARK_PADDING_RATIO", overlay_defaults.padding_ratio)?,
        };

        let auth = AuthConfig {
            dashboard_password: std::env::var("DASHBOARD_PASSWORD").ok(),
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            jwt_ttl_days: check_jwt_ttl_days(parse_env("JWT_TTL_DAYS", 30)?)?,
        };

        Ok(Self {
            host,
            port,
            public_base_url,
            data_dir,
            task_store,
            storage_bucket: std::env::var("STORAGE_BUCKET")
                .unwrap_or_else(|_| "photobooth".to_string()),
            dev_mode: env_var_bool("DEV_MODE", false),
            auth,
            transform,
            overlay,
            handoff_ttl: Duration::from_secs(parse_env("HANDOFF_TTL_SECS", 600)?),
            handoff_max_bytes: parse_env("HANDOFF_MAX_BYTES", 5 * 1024 * 1024)?,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            public_base_url: "http://127.0.0.1:3000".to_string(),
            data_dir,
            task_store: TaskStoreType::Memory,
            storage_bucket: "photobooth".to_string(),
            dev_mode: true,
            auth: AuthConfig {
                jwt_ttl_days: 30,
                ..AuthConfig::default()
            },
            transform: TransformConfig::new(api_key),
            overlay: OverlayConfig::default(),
            handoff_ttl: Duration::from_secs(600),
            handoff_max_bytes: 5 * 1024 * 1024,
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn check_jwt_ttl_days(days: i64) -> Result<i64, ConfigError> {
    if !(1..=MAX_JWT_TTL_DAYS).contains(&days) {
        return Err(ConfigError::InvalidValue(
            "JWT_TTL_DAYS".to_string(),
            format!("{} is outside 1..={}", days, MAX_JWT_TTL_DAYS),
        ));
    }
    Ok(days)
}

fn parse_ratio(name: &str, default: f32) -> Result<f32, ConfigError> {
    let value: f32 = parse_env(name, default)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("{} is outside 0.0..=1.0", value),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_is_disabled_in_dev_mode() {
        let auth = AuthConfig::default();
        assert_eq!(auth.auth_mode(true), AuthMode::Disabled);
        assert!(!auth.auth_required(true));
        assert!(auth.auth_required(false));
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::new("key".to_string(), PathBuf::from("/tmp/booth"));
        assert_eq!(config.transform.model, "gpt-image-1");
        assert_eq!(config.transform.size, "1024x1536");
        assert_eq!(config.transform.api_url, DEFAULT_IMAGE_API_URL);
        assert_eq!(config.task_store, TaskStoreType::Memory);
        assert!(config.overlay.width_ratio > 0.0 && config.overlay.width_ratio < 1.0);
    }

    #[test]
    fn jwt_ttl_days_is_bounded() {
        assert_eq!(check_jwt_ttl_days(30).unwrap(), 30);
        assert_eq!(check_jwt_ttl_days(MAX_JWT_TTL_DAYS).unwrap(), MAX_JWT_TTL_DAYS);
        assert!(check_jwt_ttl_days(0).is_err());
        assert!(check_jwt_ttl_days(i64::MAX).is_err());
    }

    #[test]
    fn parse_env_falls_back_to_default_when_unset() {
        let value: u64 = parse_env("PHOTOBOOTH_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }
}

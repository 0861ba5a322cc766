use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/videohub-env";
pub const DEFAULT_MEDIA_ROOT: &str = "./data";
pub const DEFAULT_DATABASE_FILE: &str = "videohub.db";
pub const DEFAULT_VIDEOHUB_PORT: u16 = 8080;
pub const DEFAULT_VIDEOHUB_HOST: &str = "127.0.0.1";
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
pub const DEFAULT_THUMBNAIL_TIMEOUT_SECS: u64 = 30;

/// Values read from an env file or from the process environment. Every field
/// is optional so layers can be stacked.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub media_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub videohub_host: Option<String>,
    pub videohub_port: Option<u16>,
    pub ffmpeg_path: Option<PathBuf>,
    pub thumbnail_timeout_secs: Option<u64>,
    pub allowed_origins: Option<String>,
}

impl EnvConfig {
    /// Reads the recognised keys from the current process environment.
    pub fn from_process_env() -> Result<Self> {
        parse_pairs(std::env::vars(), "process environment")
    }

    /// Fills every unset field of `self` from `fallback`.
    pub fn or(self, fallback: EnvConfig) -> EnvConfig {
        EnvConfig {
            media_root: self.media_root.or(fallback.media_root),
            database_path: self.database_path.or(fallback.database_path),
            videohub_host: self.videohub_host.or(fallback.videohub_host),
            videohub_port: self.videohub_port.or(fallback.videohub_port),
            ffmpeg_path: self.ffmpeg_path.or(fallback.ffmpeg_path),
            thumbnail_timeout_secs: self
                .thumbnail_timeout_secs
                .or(fallback.thumbnail_timeout_secs),
            allowed_origins: self.allowed_origins.or(fallback.allowed_origins),
        }
    }
}

/// Command line values; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub database_path: PathBuf,
    pub host: IpAddr,
    pub port: u16,
    pub ffmpeg_path: PathBuf,
    pub thumbnail_timeout: Duration,
    pub allowed_origins: AllowedOrigins,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let pairs = content.lines().filter_map(|line| {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        trimmed
            .split_once('=')
            .map(|(key, value)| (key.trim().to_string(), value.trim().trim_matches('"').to_string()))
    });
    parse_pairs(pairs, &path.display().to_string()).map(Some)
}

fn parse_pairs<I>(pairs: I, source: &str) -> Result<EnvConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut cfg = EnvConfig::default();
    for (key, value) in pairs {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "MEDIA_ROOT" => cfg.media_root = Some(PathBuf::from(value)),
            "DATABASE_PATH" => cfg.database_path = Some(PathBuf::from(value)),
            "VIDEOHUB_HOST" => cfg.videohub_host = Some(value.to_string()),
            "VIDEOHUB_PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing VIDEOHUB_PORT from {source}"))?;
                cfg.videohub_port = Some(port);
            }
            "FFMPEG_PATH" => cfg.ffmpeg_path = Some(PathBuf::from(value)),
            "THUMBNAIL_TIMEOUT_SECS" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Parsing THUMBNAIL_TIMEOUT_SECS from {source}"))?;
                cfg.thumbnail_timeout_secs = Some(secs);
            }
            "ALLOWED_ORIGINS" => cfg.allowed_origins = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(cfg)
}

fn parse_allowed_origins(value: Option<&str>) -> AllowedOrigins {
    let origins: Vec<String> = value
        .unwrap_or("*")
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect();
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        AllowedOrigins::Any
    } else {
        AllowedOrigins::List(origins)
    }
}

/// Loads the env file at `config_path` (a missing file is fine), layers the
/// process environment on top and finally the command line overrides.
pub fn load_runtime_config(
    config_path: &Path,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let file = read_env_config(config_path)?.unwrap_or_default();
    let env = EnvConfig::from_process_env()?;
    resolve_runtime_config(overrides, env.or(file))
}

pub fn resolve_runtime_config(
    overrides: RuntimeOverrides,
    cfg: EnvConfig,
) -> Result<RuntimeConfig> {
    let media_root = overrides
        .media_root
        .or(cfg.media_root)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT));
    let database_path = overrides
        .database_path
        .or(cfg.database_path)
        .unwrap_or_else(|| media_root.join(DEFAULT_DATABASE_FILE));
    let host_raw = overrides
        .host
        .or(cfg.videohub_host)
        .unwrap_or_else(|| DEFAULT_VIDEOHUB_HOST.to_string());
    let host: IpAddr = host_raw
        .trim()
        .parse()
        .map_err(|err| anyhow!("invalid listen host {host_raw:?}: {err}"))?;
    let port = overrides
        .port
        .or(cfg.videohub_port)
        .unwrap_or(DEFAULT_VIDEOHUB_PORT);
    let ffmpeg_path = cfg
        .ffmpeg_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_PATH));
    let thumbnail_timeout = Duration::from_secs(
        cfg.thumbnail_timeout_secs
            .unwrap_or(DEFAULT_THUMBNAIL_TIMEOUT_SECS),
    );
    let allowed_origins = parse_allowed_origins(cfg.allowed_origins.as_deref());

    Ok(RuntimeConfig {
        media_root,
        database_path,
        host,
        port,
        ffmpeg_path,
        thumbnail_timeout,
        allowed_origins,
    })
}

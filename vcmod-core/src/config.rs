//! Configuration layering.
//!
//! Connection parameters come from, in increasing precedence: `VMWARE_*`
//! environment variables, the TOML config file, and the invocation's own
//! parameters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;

use crate::args::Params;
use crate::error::{Error, Result};
use crate::session::{ConnectionParams, DEFAULT_PORT};
use crate::task::TaskSettings;

pub const CONFIG_ENV: &str = "VCMOD_CONFIG";

/// Environment lookup, injectable for tests.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Contents of `config.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub tasks: TaskSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSection {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub validate_certs: Option<bool>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSection {
    pub poll_interval_ms: Option<u64>,
    pub default_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidArgument(format!("invalid config file: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidArgument(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::parse(&text)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Find and load the config file: an explicit path must exist; the
    /// `VCMOD_CONFIG` and per-user default locations are optional.
    pub fn discover(explicit: Option<&Path>, env: EnvLookup<'_>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = env(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        match default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn task_settings(&self) -> TaskSettings {
        let mut settings = TaskSettings::default();
        if let Some(ms) = self.tasks.poll_interval_ms {
            settings.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = self.tasks.default_timeout_secs {
            settings.default_timeout = Duration::from_secs(secs);
        }
        settings
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("vcmod").join("config.toml"))
}

/// Resolve the connection from the three layers.
pub fn resolve_connection(params: &Params, file: &FileConfig, env: EnvLookup<'_>) -> Result<ConnectionParams> {
    let f = &file.connection;
    let pick = |key: &str, from_file: &Option<String>, env_key: &str| -> Option<String> {
        params
            .string(key)
            .or_else(|| from_file.clone())
            .or_else(|| env(env_key))
    };

    let hostname = pick("hostname", &f.hostname, "VMWARE_HOST");
    let username = pick("username", &f.username, "VMWARE_USER");
    let password = pick("password", &f.password, "VMWARE_PASSWORD");

    let mut missing = Vec::new();
    if hostname.is_none() {
        missing.push("hostname");
    }
    if username.is_none() {
        missing.push("username");
    }
    if password.is_none() {
        missing.push("password");
    }
    let (Some(hostname), Some(username), Some(password)) = (hostname, username, password) else {
        return Err(Error::InvalidArgument(format!(
            "missing required connection parameters: {} (set them as parameters, in the config file or via VMWARE_* variables)",
            missing.join(", ")
        )));
    };

    let port = match params.int("port") {
        Some(p) => port_from(p, "port")?,
        None => match f.port {
            Some(p) => p,
            None => match env("VMWARE_PORT") {
                Some(v) => v
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("VMWARE_PORT '{v}' is not a port number")))?,
                None => DEFAULT_PORT,
            },
        },
    };

    let validate_certs = match params.bool("validate_certs") {
        Some(b) => b,
        None => match f.validate_certs {
            Some(b) => b,
            None => match env("VMWARE_VALIDATE_CERTS") {
                Some(v) => crate::args::parse_bool(&v).ok_or_else(|| {
                    Error::InvalidArgument(format!("VMWARE_VALIDATE_CERTS '{v}' is not a boolean"))
                })?,
                None => true,
            },
        },
    };

    let proxy_host = pick("proxy_host", &f.proxy_host, "VMWARE_PROXY_HOST");
    let proxy_port = match params.int("proxy_port") {
        Some(p) => Some(port_from(p, "proxy_port")?),
        None => match f.proxy_port {
            Some(p) => Some(p),
            None => env("VMWARE_PROXY_PORT")
                .map(|v| {
                    v.parse()
                        .map_err(|_| Error::InvalidArgument(format!("VMWARE_PROXY_PORT '{v}' is not a port number")))
                })
                .transpose()?,
        },
    };
    let proxy = match (proxy_host, proxy_port) {
        (Some(host), Some(port)) => Some((host, port)),
        (Some(_), None) => {
            return Err(Error::InvalidArgument(
                "proxy_host requires proxy_port".to_string(),
            ));
        }
        (None, _) => None,
    };

    Ok(ConnectionParams {
        hostname,
        username,
        password: SecretString::from(password),
        port,
        validate_certs,
        proxy,
    })
}

fn port_from(value: i64, key: &str) -> Result<u16> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| Error::InvalidArgument(format!("{key} {value} is out of range")))
}

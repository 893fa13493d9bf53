use anyhow::Context;
use serde::Deserialize;

use crate::error::Error;

/// Kind of listening endpoint the daemon binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    /// Dual-stack TCP (IPv4 + IPv6 on the same port).
    Dual,
    Ipv4,
    Ipv6,
    /// Local (unix-domain) stream socket.
    Unix,
}

/// How the client address exposed to handlers is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientAddrMode {
    /// Use the socket peer address.
    Socket,
    /// Trust the X-Forwarded-For header verbatim, fall back to the peer address.
    XForwardedFor,
    /// Trust the X-Real-IP header verbatim, fall back to the peer address.
    XRealIp,
}

/// Daemon configuration.
///
/// Loaded from an optional YAML file (`WARDEN_CONFIG`) with environment
/// variable overrides, or built directly in code. Always validated by
/// [`Config::validate`] before the daemon starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub socket: SocketKind,
    pub port: u16,
    pub unix_path: Option<String>,
    /// Maximum simultaneous connections, 0 = unbounded.
    pub max_connections: usize,
    /// Idle timeout in seconds, 0 = none.
    pub idle_timeout: u64,
    /// Callback (transport) thread count.
    pub threads: usize,
    /// Async worker thread count.
    pub async_threads: usize,
    pub client_addr_mode: ClientAddrMode,
}

impl Default for Config {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            socket: SocketKind::Dual,
            port: 8888,
            unix_path: None,
            max_connections: 2048,
            idle_timeout: 60,
            threads: cores.max(4),
            async_threads: (cores * 4).max(16),
            client_addr_mode: ClientAddrMode::Socket,
        }
    }
}

/// Maximum sun_path length on Linux, terminating NUL included.
const MAX_UNIX_PATH: usize = 108;

impl Config {
    /// Loads the configuration from the `WARDEN_CONFIG` YAML file (if set),
    /// then applies individual environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("WARDEN_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read config file '{path}'"))?;
                serde_yaml::from_str(&text)
                    .with_context(|| format!("cannot parse config file '{path}'"))?
            }
            Err(_) => Config::default(),
        };

        if let Ok(v) = std::env::var("WARDEN_SOCKET") {
            config.socket = match v.as_str() {
                "dual" => SocketKind::Dual,
                "ipv4" => SocketKind::Ipv4,
                "ipv6" => SocketKind::Ipv6,
                "unix" => SocketKind::Unix,
                other => anyhow::bail!("unknown socket kind '{other}'"),
            };
        }
        if let Ok(v) = std::env::var("WARDEN_PORT") {
            config.port = v.parse().context("invalid WARDEN_PORT")?;
        }
        if let Ok(v) = std::env::var("WARDEN_UNIX_PATH") {
            config.unix_path = Some(v);
        }
        if let Ok(v) = std::env::var("WARDEN_MAX_CONNECTIONS") {
            config.max_connections = v.parse().context("invalid WARDEN_MAX_CONNECTIONS")?;
        }
        if let Ok(v) = std::env::var("WARDEN_IDLE_TIMEOUT") {
            config.idle_timeout = v.parse().context("invalid WARDEN_IDLE_TIMEOUT")?;
        }
        if let Ok(v) = std::env::var("WARDEN_THREADS") {
            config.threads = v.parse().context("invalid WARDEN_THREADS")?;
        }
        if let Ok(v) = std::env::var("WARDEN_ASYNC_THREADS") {
            config.async_threads = v.parse().context("invalid WARDEN_ASYNC_THREADS")?;
        }

        Ok(config)
    }

    /// Checks every constraint and reports all violations at once.
    pub fn validate(&self) -> Result<(), Error> {
        let mut problems = Vec::new();

        if self.socket == SocketKind::Unix {
            match &self.unix_path {
                None => problems.push("unix socket path must be set".to_string()),
                Some(path) if path.len() >= MAX_UNIX_PATH => {
                    problems.push(format!(
                        "socket path '{}' is too long (max length = {})",
                        path,
                        MAX_UNIX_PATH - 1
                    ));
                }
                Some(_) => {}
            }
        } else if self.port == 0 {
            problems.push(format!("port {} is invalid (range: 1 - 65535)", self.port));
        }
        if self.threads < 1 || self.threads > 128 {
            problems.push(format!(
                "thread count {} is invalid (range: 1 - 128)",
                self.threads
            ));
        }
        if self.async_threads < 1 {
            problems.push(format!(
                "async thread count {} is invalid (minimum: 1)",
                self.async_threads
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems))
        }
    }
}

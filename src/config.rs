//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_SIGNALING_PORT: u16 = 5000;

const ENV_BIND: &str = "SWITCHBOARD_BIND";
const ENV_PORT: &str = "PORT";
const ENV_PING_INTERVAL: &str = "SWITCHBOARD_PING_INTERVAL_SECS";
const ENV_PONG_TIMEOUT: &str = "SWITCHBOARD_PONG_TIMEOUT_SECS";
const ENV_COMMAND_BUFFER: &str = "SWITCHBOARD_COMMAND_BUFFER";
const ENV_ALLOWED_ORIGINS: &str = "SWITCHBOARD_ALLOWED_ORIGINS";
const ENV_FRONTEND_URL: &str = "FRONTEND_URL";

const DEFAULT_ORIGINS: &[&str] = &[
    "http://localhost:5173",
    "http://localhost:5174",
    "*.vercel.app",
];

/// Browser origins allowed to open a WebSocket.
///
/// Entries are exact origins, `*.suffix` to match any origin ending in
/// `.suffix`, or a lone `*` to allow everything. Requests without an
/// `Origin` header (native clients, curl) are always allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedOrigins(Vec<String>);

impl AllowedOrigins {
    pub fn any() -> Self {
        Self(vec!["*".to_owned()])
    }

    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(Into::into).collect())
    }

    pub fn permits(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        self.0.iter().any(|entry| match entry.strip_prefix('*') {
            Some("") => true,
            Some(suffix) => origin.ends_with(suffix),
            None => entry == origin,
        })
    }
}

impl Default for AllowedOrigins {
    fn default() -> Self {
        Self::new(DEFAULT_ORIGINS.iter().copied())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Signaling server configuration options
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Interval between WebSocket pings
    pub ping_interval: Duration,

    /// How long a client has to answer a ping
    pub pong_timeout: Duration,

    /// Capacity of the supervisor's command queue
    pub command_buffer: usize,

    /// Origins accepted during the WebSocket handshake
    pub allowed_origins: AllowedOrigins,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_SIGNALING_PORT)),
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(5),
            command_buffer: 1024,
            allowed_origins: AllowedOrigins::default(),
        }
    }
}

impl SignalingConfig {
    /// Defaults overridden by process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_BIND) {
            config.bind_addr = parse(ENV_BIND, &value)?;
        } else if let Some(value) = lookup(ENV_PORT) {
            let port: u16 = parse(ENV_PORT, &value)?;
            config.bind_addr.set_port(port);
        }
        if let Some(value) = lookup(ENV_PING_INTERVAL) {
            config.ping_interval = Duration::from_secs(parse_nonzero(ENV_PING_INTERVAL, &value)?);
        }
        if let Some(value) = lookup(ENV_PONG_TIMEOUT) {
            config.pong_timeout = Duration::from_secs(parse_nonzero(ENV_PONG_TIMEOUT, &value)?);
        }
        if let Some(value) = lookup(ENV_COMMAND_BUFFER) {
            config.command_buffer = parse_nonzero(ENV_COMMAND_BUFFER, &value)? as usize;
        }
        if let Some(value) = lookup(ENV_ALLOWED_ORIGINS) {
            let entries: Vec<&str> = value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .collect();
            if entries.is_empty() {
                return Err(ConfigError::Invalid {
                    name: ENV_ALLOWED_ORIGINS,
                    value,
                });
            }
            config.allowed_origins = AllowedOrigins::new(entries);
        }
        if let Some(value) = lookup(ENV_FRONTEND_URL) {
            let url = value.trim().trim_end_matches('/');
            if !url.is_empty() {
                config.allowed_origins.0.push(url.to_owned());
            }
        }

        Ok(config)
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_heartbeat(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }

    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity;
        self
    }

    pub fn with_allowed_origins(mut self, origins: AllowedOrigins) -> Self {
        self.allowed_origins = origins;
        self
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_owned(),
    })
}

fn parse_nonzero(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    match parse::<u64>(name, value)? {
        0 => Err(ConfigError::Invalid {
            name,
            value: value.to_owned(),
        }),
        n => Ok(n),
    }
}

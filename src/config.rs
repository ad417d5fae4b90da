use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Proxy,
    Vpn,
}

/// Runtime configuration, loaded from the environment (with `.env` support).
#[derive(Clone)]
pub struct Config {
    pub role: Role,
    pub mode: Mode,

    /// Client: upstream websocket endpoint, e.g. `wss://host:port/`.
    pub server_url: Option<String>,
    /// Server: TCP bind address and port.
    pub server_host: String,
    pub server_port: u16,
    /// Server: bind a unix socket instead of TCP when set.
    pub unix_path: Option<String>,

    /// HTTP Basic credentials guarding the websocket upgrade.
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_ssl: bool,

    /// Client: local SOCKS5 listener.
    pub socks5_address: String,
    pub socks5_port: u16,

    /// 64-char hex seed the account is derived from (index 0).
    pub nano_seed: Option<String>,
    /// Coin tag (e.g. `nano`). Setting it enables metering on the server.
    pub cryptocoin: Option<String>,
    pub price_kilo_requests: f64,
    pub price_gigabytes: f64,

    /// Ledger database path.
    pub database: String,
    /// Light-wallet websocket service.
    pub light_server_url: String,
    pub maintainer_interval_secs: u64,
}

/// Custom Debug that redacts the seed and password.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("server_url", &self.server_url)
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("unix_path", &self.unix_path)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("verify_ssl", &self.verify_ssl)
            .field("socks5_address", &self.socks5_address)
            .field("socks5_port", &self.socks5_port)
            .field("nano_seed", &self.nano_seed.as_ref().map(|_| "<redacted>"))
            .field("cryptocoin", &self.cryptocoin)
            .field("price_kilo_requests", &self.price_kilo_requests)
            .field("price_gigabytes", &self.price_gigabytes)
            .field("database", &self.database)
            .field("light_server_url", &self.light_server_url)
            .field("maintainer_interval_secs", &self.maintainer_interval_secs)
            .finish()
    }
}

fn default_price() -> f64 {
    0.01
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first
    /// when present.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {path}"))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let role = match env::var("ROLE").as_deref() {
            Ok("client") => Role::Client,
            Ok("server") => Role::Server,
            Ok(other) => return Err(eyre!("ROLE must be client or server, got {other}")),
            Err(_) => return Err(eyre!("ROLE environment variable is required")),
        };

        let mode = match env::var("MODE").as_deref() {
            Ok("proxy") | Err(_) => Mode::Proxy,
            Ok("vpn") => Mode::Vpn,
            Ok(other) => return Err(eyre!("MODE must be proxy or vpn, got {other}")),
        };

        let config = Config {
            role,
            mode,
            server_url: optional("SERVER_URL"),
            server_host: optional("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            server_port: parsed_or("SERVER_PORT", 8080),
            unix_path: optional("UNIX_PATH"),
            username: optional("USERNAME"),
            password: optional("PASSWORD"),
            verify_ssl: parsed_or("VERIFY_SSL", true),
            socks5_address: optional("SOCKS5_ADDRESS").unwrap_or_else(|| "127.0.0.1".into()),
            socks5_port: parsed_or("SOCKS5_PORT", 1080),
            nano_seed: optional("NANO_SEED"),
            cryptocoin: optional("CRYPTOCOIN"),
            price_kilo_requests: parsed_or("PRICE_KILO_REQUESTS", default_price()),
            price_gigabytes: parsed_or("PRICE_GIGABYTES", default_price()),
            database: optional("DATABASE").unwrap_or_else(|| "nanotunnel.db".into()),
            light_server_url: optional("LIGHT_SERVER_URL")
                .unwrap_or_else(|| "https://light.nano.org/".into()),
            maintainer_interval_secs: parsed_or("MAINTAINER_INTERVAL_SECS", 60),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mode == Mode::Vpn {
            return Err(eyre!("MODE=vpn is not supported by this build, use proxy"));
        }

        if self.role == Role::Client && self.server_url.is_none() {
            return Err(eyre!("SERVER_URL is required for the client role"));
        }

        if let Some(seed) = &self.nano_seed {
            if seed.len() != 64 || !seed.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(eyre!("NANO_SEED must be 64 hex characters"));
            }
        }

        if self.role == Role::Server && self.cryptocoin.is_some() && self.nano_seed.is_none() {
            return Err(eyre!("NANO_SEED is required when CRYPTOCOIN is set"));
        }

        if self.price_kilo_requests <= 0.0 || self.price_gigabytes <= 0.0 {
            return Err(eyre!("prices must be positive"));
        }

        if !(60..=600).contains(&self.maintainer_interval_secs) {
            return Err(eyre!("MAINTAINER_INTERVAL_SECS must be within 60..=600"));
        }

        Ok(())
    }
}

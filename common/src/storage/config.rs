//! Connection configuration for the backing server.

use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{StorageError, StorageResult};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Characters escaped in URL credentials. Everything but the unreserved set,
/// so a literal `%` survives the client's decoding.
const CREDENTIALS: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Selects and configures the backing server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectionConfig {
    /// A Redis server reached over TCP, TLS or a unix socket.
    Redis(RedisConfig),
    /// A process-local server. Data lives as long as the physical connection.
    InMemory(InMemoryConfig),
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::Redis(RedisConfig::default())
    }
}

impl ConnectionConfig {
    /// Parses a connection URL into a Redis configuration.
    pub fn from_url(url: &str) -> StorageResult<Self> {
        RedisConfig::from_url(url).map(ConnectionConfig::Redis)
    }

    /// Resolves defaults and canonicalizes fields, so two configurations
    /// reaching the same server compare equal.
    pub fn normalized(&self) -> Self {
        match self {
            ConnectionConfig::Redis(redis) => ConnectionConfig::Redis(redis.normalized()),
            ConnectionConfig::InMemory(memory) => ConnectionConfig::InMemory(memory.clone()),
        }
    }

    /// The normalized fields that decide whether two configurations may share
    /// one physical connection, sorted by name.
    pub fn identity_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = match self.normalized() {
            ConnectionConfig::Redis(redis) => vec![
                ("type", "redis".to_string()),
                ("host", redis.host),
                ("port", redis.port.to_string()),
                ("db", redis.db.to_string()),
                ("tls", redis.tls.to_string()),
                ("username", redis.username.unwrap_or_default()),
                ("password", redis.password.unwrap_or_default()),
                ("path", redis.path.unwrap_or_default()),
                ("connect_timeout_ms", redis.connect_timeout_ms.to_string()),
            ],
            ConnectionConfig::InMemory(memory) => vec![
                ("type", "in_memory".to_string()),
                ("db", memory.db.to_string()),
            ],
        };
        fields.sort_by_key(|(name, _)| *name);
        fields
    }
}

/// Redis connection parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Logical database index.
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Unix socket path. When set, `host`, `port` and `tls` are ignored.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
            tls: false,
            username: None,
            password: None,
            path: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| ".."))
            .field("path", &self.path)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

impl RedisConfig {
    /// Parses `redis://`, `rediss://` and `redis+unix://` URLs.
    ///
    /// The database index comes from the first path segment or a `db` query
    /// parameter; credentials come from the userinfo part, or from `user` and
    /// `pass` query parameters for unix sockets.
    pub fn from_url(url: &str) -> StorageResult<Self> {
        let parsed = Url::parse(url).map_err(|e| {
            StorageError::InvalidInput(format!("invalid connection url '{}': {}", url, e))
        })?;

        let mut config = RedisConfig::default();
        match parsed.scheme() {
            "redis" | "rediss" => {
                config.tls = parsed.scheme() == "rediss";
                if let Some(host) = parsed.host_str().filter(|h| !h.is_empty()) {
                    config.host = host.to_string();
                }
                config.port = parsed.port().unwrap_or(DEFAULT_PORT);
                let segment = parsed.path().trim_matches('/');
                if !segment.is_empty() {
                    config.db = parse_db(segment)?;
                }
                if !parsed.username().is_empty() {
                    config.username = Some(decode_credential(parsed.username(), "username")?);
                }
                config.password = parsed
                    .password()
                    .map(|p| decode_credential(p, "password"))
                    .transpose()?;
            }
            "redis+unix" | "unix" => {
                config.path = Some(parsed.path().to_string());
            }
            other => {
                return Err(StorageError::InvalidInput(format!(
                    "unsupported connection scheme '{}'",
                    other
                )));
            }
        }

        for (name, value) in parsed.query_pairs() {
            match name.as_ref() {
                "db" => config.db = parse_db(&value)?,
                "user" => config.username = Some(value.into_owned()),
                "pass" | "password" => config.password = Some(value.into_owned()),
                "connect_timeout_ms" => {
                    config.connect_timeout_ms = value.parse().map_err(|_| {
                        StorageError::InvalidInput(format!(
                            "connect_timeout_ms must be a number, got '{}'",
                            value
                        ))
                    })?;
                }
                _ => {}
            }
        }

        Ok(config)
    }

    /// Canonical form used for connection identity.
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        config.host = config.host.trim().to_ascii_lowercase();
        if config.host.is_empty() || config.host == "localhost" {
            config.host = DEFAULT_HOST.to_string();
        }
        config.username = config.username.filter(|u| !u.is_empty());
        config.password = config.password.filter(|p| !p.is_empty());
        config.path = config.path.filter(|p| !p.is_empty());
        if config.path.is_some() {
            config.host = DEFAULT_HOST.to_string();
            config.port = DEFAULT_PORT;
            config.tls = false;
        }
        config
    }

    /// Renders the configuration as a URL the Redis client understands.
    pub fn to_url(&self) -> StorageResult<Url> {
        let invalid = |what: &str| {
            StorageError::InvalidInput(format!("cannot encode {} into connection url", what))
        };

        if let Some(path) = &self.path {
            let mut url = Url::parse("redis+unix:///").map_err(|_| invalid("socket path"))?;
            url.set_path(path);
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("db", &self.db.to_string());
                if let Some(username) = &self.username {
                    query.append_pair("user", username);
                }
                if let Some(password) = &self.password {
                    query.append_pair("pass", password);
                }
            }
            return Ok(url);
        }

        let scheme = if self.tls { "rediss" } else { "redis" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let mut url = Url::parse(&format!("{}://{}:{}/{}", scheme, host, self.port, self.db))
            .map_err(|e| StorageError::InvalidInput(format!("invalid host '{}': {}", host, e)))?;
        if let Some(username) = &self.username {
            url.set_username(&encode_credential(username))
                .map_err(|_| invalid("username"))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(&encode_credential(password)))
                .map_err(|_| invalid("password"))?;
        }
        Ok(url)
    }
}

/// Parameters for the process-local backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Logical database index; only affects connection identity.
    #[serde(default)]
    pub db: i64,
}

fn decode_credential(raw: &str, what: &str) -> StorageResult<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| StorageError::InvalidInput(format!("{} in connection url is not utf-8", what)))
}

fn encode_credential(raw: &str) -> String {
    utf8_percent_encode(raw, CREDENTIALS).to_string()
}

fn parse_db(value: &str) -> StorageResult<i64> {
    value.parse().map_err(|_| {
        StorageError::InvalidInput(format!("database index must be a number, got '{}'", value))
    })
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

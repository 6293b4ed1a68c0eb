use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use strum_macros::{Display, EnumString};
use url::{Host, Url};

use crate::Error;

pub const DEFAULT_PORT: u16 = 6379;

/// RESP version negotiated with the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString)]
pub enum ProtocolVersion {
    #[default]
    #[strum(serialize = "2")]
    Resp2,
    #[strum(serialize = "3")]
    Resp3,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM encoded certificate authority to trust in addition to the system roots.
    pub ca_cert: Option<PathBuf>,
    /// Accept any server certificate. Only meant for local testing.
    pub danger_accept_invalid_certs: bool,
}

/// Connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Connect through a Unix domain socket instead of TCP.
    pub unix_socket: Option<PathBuf>,
    pub tls: Option<TlsConfig>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical database selected right after connecting.
    pub database: i64,
    /// Name reported by `CLIENT LIST`.
    pub client_name: Option<String>,
    pub protocol: ProtocolVersion,
    pub connect_timeout: Duration,
    /// Default per-command timeout, `None` waits forever.
    pub command_timeout: Option<Duration>,
    /// Maximum number of requests waiting for a reply on one connection.
    pub max_pipeline_depth: usize,
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            unix_socket: None,
            tls: None,
            username: None,
            password: None,
            database: 0,
            client_name: None,
            protocol: ProtocolVersion::Resp2,
            connect_timeout: Duration::from_secs(5),
            command_timeout: None,
            max_pipeline_depth: 1024,
            max_frame_size: 512 * 1024 * 1024,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("unix_socket", &self.unix_socket)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("client_name", &self.client_name)
            .field("protocol", &self.protocol)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("max_pipeline_depth", &self.max_pipeline_depth)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl Config {
    /// Parses `redis://[[username]:password@]host[:port][/database][?protocol=3]`.
    ///
    /// `rediss://` enables TLS and `unix:///path/to/socket[?db=N]` connects through a Unix
    /// domain socket. Credentials and the socket path may be percent-encoded.
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let url =
            Url::parse(url).map_err(|err| Error::Config(format!("invalid url {}: {}", url, err)))?;
        let mut config = Self::default();

        match url.scheme() {
            "redis" => config.apply_authority(&url)?,
            "rediss" => {
                config.tls = Some(TlsConfig::default());
                config.apply_authority(&url)?;
            }
            "unix" | "redis+unix" => {
                let path = decode(url.path())?;
                if path.is_empty() {
                    return Err(Error::Config("missing unix socket path".to_string()));
                }
                config.unix_socket = Some(PathBuf::from(path));
            }
            scheme => return Err(Error::Config(format!("unsupported scheme {}", scheme))),
        }

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "db" => config.database = parse_database(&value)?,
                "protocol" => {
                    config.protocol = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid protocol {}", value)))?;
                }
                "client_name" => config.client_name = Some(value.into_owned()),
                "password" | "pass" => config.password = Some(value.into_owned()),
                "username" | "user" => config.username = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(config)
    }

    /// Reads `REDIS_URL`, falling back to the defaults when unset.
    pub fn from_env() -> Result<Self, Error> {
        match env::var("REDIS_URL") {
            Ok(url) => Self::from_url(&url),
            Err(_) => Ok(Self::default()),
        }
    }

    /// `host:port` or the socket path, used in logs and connect errors.
    pub fn address(&self) -> String {
        match &self.unix_socket {
            Some(path) => path.display().to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    fn apply_authority(&mut self, url: &Url) -> Result<(), Error> {
        let username = decode(url.username())?;
        match url.password() {
            Some(password) => {
                if !username.is_empty() {
                    self.username = Some(username);
                }
                self.password = Some(decode(password)?);
            }
            // A lone credential is a password, as with `AUTH <password>`.
            None if !username.is_empty() => self.password = Some(username),
            None => {}
        }

        match url.host() {
            Some(Host::Ipv6(addr)) => self.host = addr.to_string(),
            Some(host) => self.host = host.to_string(),
            None => {}
        }

        if let Some(port) = url.port() {
            self.port = port;
        }

        let database = url.path().trim_start_matches('/');
        if !database.is_empty() {
            self.database = parse_database(database)?;
        }

        Ok(())
    }
}

fn decode(value: &str) -> Result<String, Error> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::Config(format!("invalid percent-encoding in {}", value)))
}

fn parse_database(value: &str) -> Result<i64, Error> {
    value
        .parse::<i64>()
        .ok()
        .filter(|db| *db >= 0)
        .ok_or_else(|| Error::Config(format!("invalid database {}", value)))
}

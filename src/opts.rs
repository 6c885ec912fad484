//! Connection options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use no_panic::no_panic;
use url::Url;

use crate::buffer_pool::{BufferPool, GLOBAL_BUFFER_POOL};
use crate::error::Error;

/// SSL connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL
    Disable,
    /// Try SSL, fall back to unencrypted if not supported
    #[default]
    Prefer,
    /// Require SSL connection
    Require,
}

/// A password, supplied either directly or resolved lazily by a caller-supplied closure.
///
/// The closure variant exists for IAM-style credentials that are minted shortly before
/// use (e.g. cloud-managed database auth tokens) and should not be stored on `Opts` for
/// the lifetime of the connection.
#[derive(Clone)]
pub enum Password {
    /// A literal password value.
    Literal(String),
    /// A provider invoked at connect time to produce the password.
    Provider(Arc<dyn Fn() -> Result<String, Error> + Send + Sync>),
}

impl Password {
    /// Create a literal password.
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    /// Create a password backed by a provider closure.
    pub fn provider<F>(f: F) -> Self
    where
        F: Fn() -> Result<String, Error> + Send + Sync + 'static,
    {
        Self::Provider(Arc::new(f))
    }

    /// Resolve the actual password value, invoking the provider if needed.
    pub fn resolve(&self) -> Result<String, Error> {
        match self {
            Self::Literal(s) => Ok(s.clone()),
            Self::Provider(f) => f(),
        }
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(..)")
    }
}

impl From<String> for Password {
    fn from(s: String) -> Self {
        Self::Literal(s)
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        Self::Literal(s.to_string())
    }
}

/// Connection options for PostgreSQL.
#[derive(Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `""`
    pub host: String,

    /// Port number for the PostgreSQL server.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket path.
    ///
    /// When set, the driver connects directly to this path instead of TCP.
    /// A host beginning with `/` is treated as a socket directory and resolved
    /// to `{host}/.s.PGSQL.{port}` by [`Opts::resolved_socket_path`].
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Database name to use.
    ///
    /// Defaults to `user` if not set, matching `libpq`.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<Password>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// SSL connection mode.
    ///
    /// Default: `SslMode::Prefer`
    pub ssl_mode: SslMode,

    /// Additional connection parameters sent verbatim in the startup message.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,

    /// When connected via TCP to loopback, upgrade to Unix socket for better performance.
    ///
    /// Default: `true`
    pub prefer_unix_socket: bool,

    /// Maximum number of idle connections in the pool.
    ///
    /// Default: `100`
    pub pool_max_idle_conn: usize,

    /// Maximum number of concurrent connections (None = unlimited).
    ///
    /// Default: `None`
    pub pool_max_concurrency: Option<usize>,

    /// `statement_timeout` GUC, sent as a startup parameter.
    ///
    /// Default: `None`
    pub statement_timeout: Option<Duration>,

    /// `lock_timeout` GUC, sent as a startup parameter.
    ///
    /// Default: `None`
    pub lock_timeout: Option<Duration>,

    /// `idle_in_transaction_session_timeout` GUC, sent as a startup parameter.
    ///
    /// Default: `None`
    pub idle_in_transaction_session_timeout: Option<Duration>,

    /// `options` GUC (command-line style options string), sent as a startup parameter.
    ///
    /// Default: `None`
    pub options: Option<String>,

    /// Requests a replication connection (`database` or `true`/`on`), sent as a startup parameter.
    ///
    /// Default: `None`
    pub replication: Option<String>,

    /// Client-side timeout for establishing the connection and completing startup/auth.
    ///
    /// Default: `None` (no timeout)
    pub connect_timeout: Option<Duration>,

    /// Default client-side timeout applied while waiting for a query's results.
    ///
    /// On expiry the in-flight state machine is abandoned, the response is drained up to
    /// the next `ReadyForQuery`, and `Error::QueryTimeout` is returned; the connection
    /// remains usable for subsequent queries. Individual calls can override this with
    /// `query_with_timeout`/`exec_with_timeout` and their `_collect` variants.
    ///
    /// Default: `None` (no timeout)
    pub query_timeout: Option<Duration>,

    /// Shared buffer pool used to recycle read/write buffers across connections.
    ///
    /// Default: the process-wide [`GLOBAL_BUFFER_POOL`]
    pub buffer_pool: Arc<BufferPool>,
}

impl fmt::Debug for Opts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opts")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("password", &self.password.as_ref().map(|_| "Password(..)"))
            .field("application_name", &self.application_name)
            .field("ssl_mode", &self.ssl_mode)
            .field("params", &self.params)
            .field("prefer_unix_socket", &self.prefer_unix_socket)
            .field("pool_max_idle_conn", &self.pool_max_idle_conn)
            .field("pool_max_concurrency", &self.pool_max_concurrency)
            .field("statement_timeout", &self.statement_timeout)
            .field("lock_timeout", &self.lock_timeout)
            .field(
                "idle_in_transaction_session_timeout",
                &self.idle_in_transaction_session_timeout,
            )
            .field("options", &self.options)
            .field("replication", &self.replication)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl Opts {
    /// Resolve the Unix domain socket path to connect to, if any.
    ///
    /// If `socket` is set explicitly, it is used as-is. Otherwise, if `host` begins
    /// with `/`, it is treated as a socket directory and combined with `port` using
    /// the standard `{dir}/.s.PGSQL.{port}` naming convention.
    pub fn resolved_socket_path(&self) -> Option<String> {
        if let Some(socket) = &self.socket {
            return Some(socket.clone());
        }
        if self.host.starts_with('/') {
            return Some(format!("{}/.s.PGSQL.{}", self.host, self.port));
        }
        None
    }

    /// The database to request from the server, defaulting to `user` when unset.
    pub fn effective_database(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.user)
    }
}

impl Default for Opts {
    #[no_panic]
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            socket: None,
            user: String::new(),
            database: None,
            password: None,
            application_name: None,
            ssl_mode: SslMode::Prefer,
            params: Vec::new(),
            prefer_unix_socket: true,
            pool_max_idle_conn: 100,
            pool_max_concurrency: None,
            statement_timeout: None,
            lock_timeout: None,
            idle_in_transaction_session_timeout: None,
            options: None,
            replication: None,
            connect_timeout: None,
            query_timeout: None,
            buffer_pool: Arc::clone(&GLOBAL_BUFFER_POOL),
        }
    }
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection URL.
    ///
    /// Format: `postgres://[user[:password]@]host[:port][/database][?param1=value1&param2=value2&..]`
    ///
    /// Supported query parameters:
    /// - `sslmode`: disable, prefer, require
    /// - `application_name`: application name
    /// - `prefer_unix_socket`: true/True/1/yes/on or false/False/0/no/off
    /// - `pool_max_idle_conn`: maximum idle connections (positive integer)
    /// - `pool_max_concurrency`: maximum concurrent connections (positive integer)
    /// - `connect_timeout`: seconds, integer
    /// - `statement_timeout`, `lock_timeout`, `idle_in_transaction_session_timeout`: milliseconds, integer
    /// - `options`: raw `options` GUC string
    /// - `replication`: replication mode string
    #[no_panic]
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if !["postgres", "pg"].contains(&url.scheme()) {
            return Err(Error::InvalidUsage(format!(
                "Invalid scheme: expected 'postgres://' or 'pg://', got '{}://'",
                url.scheme()
            )));
        }

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(5432),
            user: url.username().to_string(),
            password: url
                .password()
                .map(|s| Password::Literal(s.to_string())),
            database: url.path().strip_prefix('/').and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }),
            ..Opts::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" => {
                    opts.ssl_mode = match value.as_ref() {
                        "disable" => SslMode::Disable,
                        "prefer" => SslMode::Prefer,
                        "require" => SslMode::Require,
                        _ => {
                            return Err(Error::InvalidUsage(format!(
                                "Invalid sslmode: expected one of ['disable', 'prefer', 'require'], got {}",
                                value
                            )));
                        }
                    };
                }
                "application_name" => {
                    opts.application_name = Some(value.to_string());
                }
                "prefer_unix_socket" => {
                    opts.prefer_unix_socket = match value.as_ref() {
                        "true" | "True" | "1" | "yes" | "on" => true,
                        "false" | "False" | "0" | "no" | "off" => false,
                        _ => {
                            return Err(Error::InvalidUsage(format!(
                                "Invalid prefer_unix_socket: {}",
                                value
                            )));
                        }
                    };
                }
                "pool_max_idle_conn" => {
                    opts.pool_max_idle_conn = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid pool_max_idle_conn: {}", value))
                    })?;
                }
                "pool_max_concurrency" => {
                    opts.pool_max_concurrency = Some(value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid pool_max_concurrency: {}", value))
                    })?);
                }
                "connect_timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid connect_timeout: {}", value))
                    })?;
                    opts.connect_timeout = Some(Duration::from_secs(secs));
                }
                "query_timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid query_timeout: {}", value))
                    })?;
                    opts.query_timeout = Some(Duration::from_secs(secs));
                }
                "statement_timeout" => {
                    let ms: u64 = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid statement_timeout: {}", value))
                    })?;
                    opts.statement_timeout = Some(Duration::from_millis(ms));
                }
                "lock_timeout" => {
                    let ms: u64 = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid lock_timeout: {}", value))
                    })?;
                    opts.lock_timeout = Some(Duration::from_millis(ms));
                }
                "idle_in_transaction_session_timeout" => {
                    let ms: u64 = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!(
                            "Invalid idle_in_transaction_session_timeout: {}",
                            value
                        ))
                    })?;
                    opts.idle_in_transaction_session_timeout = Some(Duration::from_millis(ms));
                }
                "options" => {
                    opts.options = Some(value.to_string());
                }
                "replication" => {
                    opts.replication = Some(value.to_string());
                }
                _ => {
                    opts.params.push((key.to_string(), value.to_string()));
                }
            }
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    #[no_panic]
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {}", e)))?;
        Self::try_from(&url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_database_defaults_to_user() {
        let opts = Opts {
            user: "alice".into(),
            ..Opts::default()
        };
        assert_eq!(opts.effective_database(), "alice");
    }

    #[test]
    fn effective_database_uses_explicit_value() {
        let opts = Opts {
            user: "alice".into(),
            database: Some("analytics".into()),
            ..Opts::default()
        };
        assert_eq!(opts.effective_database(), "analytics");
    }

    #[test]
    fn resolved_socket_path_from_explicit_field() {
        let opts = Opts {
            socket: Some("/var/run/postgresql/.s.PGSQL.5432".into()),
            ..Opts::default()
        };
        assert_eq!(
            opts.resolved_socket_path().as_deref(),
            Some("/var/run/postgresql/.s.PGSQL.5432")
        );
    }

    #[test]
    fn resolved_socket_path_from_slash_prefixed_host() {
        let opts = Opts {
            host: "/var/run/postgresql".into(),
            port: 5433,
            ..Opts::default()
        };
        assert_eq!(
            opts.resolved_socket_path().as_deref(),
            Some("/var/run/postgresql/.s.PGSQL.5433")
        );
    }

    #[test]
    fn resolved_socket_path_none_for_tcp_host() {
        let opts = Opts {
            host: "db.example.com".into(),
            ..Opts::default()
        };
        assert_eq!(opts.resolved_socket_path(), None);
    }
}

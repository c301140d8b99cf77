//! Client configuration.

use std::time::Duration;

use tds_protocol::packet::clamp_packet_size;
use tds_protocol::version::TdsVersion;
use tds_protocol::{EncryptionLevel, Login};
use tds_tls::TlsConfig;

use crate::error::Error;

/// Default SQL Server port.
pub const DEFAULT_SQL_SERVER_PORT: u16 = 1433;

/// Default Sybase ASE port.
pub const DEFAULT_SYBASE_PORT: u16 = 7100;

/// Server product the session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerType {
    /// Microsoft SQL Server.
    #[default]
    SqlServer,
    /// Sybase Adaptive Server Enterprise.
    Sybase,
}

impl ServerType {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlserver" | "mssql" | "1" => Some(Self::SqlServer),
            "sybase" | "ase" | "2" => Some(Self::Sybase),
            _ => None,
        }
    }

    /// Port used when none is given.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::SqlServer => DEFAULT_SQL_SERVER_PORT,
            Self::Sybase => DEFAULT_SYBASE_PORT,
        }
    }

    /// Protocol version used when none is given.
    #[must_use]
    pub const fn default_version(self) -> TdsVersion {
        match self {
            Self::SqlServer => TdsVersion::V7_1,
            Self::Sybase => TdsVersion::V5_0,
        }
    }
}

/// Requested encryption mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never encrypt; the pre-login advertises no encryption support.
    Off,
    /// Encrypt if the server asks for it, otherwise encrypt only the login.
    #[default]
    Request,
    /// Always encrypt, without checking the server certificate.
    Require,
    /// Always encrypt and validate the server certificate.
    Authenticate,
}

impl SslMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "false" | "no" => Some(Self::Off),
            "request" => Some(Self::Request),
            "require" | "true" | "yes" => Some(Self::Require),
            "authenticate" | "strict" => Some(Self::Authenticate),
            _ => None,
        }
    }

    /// Encryption byte advertised in the pre-login.
    #[must_use]
    pub const fn level(self) -> EncryptionLevel {
        match self {
            Self::Off => EncryptionLevel::NotSupported,
            Self::Request => EncryptionLevel::Off,
            Self::Require | Self::Authenticate => EncryptionLevel::On,
        }
    }
}

/// Timeouts for the phases of a connection.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time to establish the TCP connection (default: 15s).
    pub connect_timeout: Duration,
    /// Time to complete the TLS handshake (default: 10s).
    pub tls_timeout: Duration,
    /// Time to complete the login sequence (default: 30s).
    pub login_timeout: Duration,
    /// Time to wait for the first byte of a response (default: none).
    ///
    /// On expiry a cancel is sent and the wait fails with a timeout. The
    /// cancel acknowledgement is drained by the next request.
    pub command_timeout: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            tls_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(30),
            command_timeout: None,
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the TLS handshake timeout.
    #[must_use]
    pub fn tls_timeout(mut self, timeout: Duration) -> Self {
        self.tls_timeout = timeout;
        self
    }

    /// Set the login sequence timeout.
    #[must_use]
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Set the first-byte command timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port; the server type's default when `None`.
    pub port: Option<u16>,

    /// Instance name (for named instances).
    pub instance: Option<String>,

    /// Initial database.
    pub database: Option<String>,

    /// Login name.
    pub user: String,

    /// Login password.
    pub password: String,

    /// Application name reported to the server.
    pub application_name: String,

    /// Client host name reported to the server.
    pub workstation_id: String,

    /// Session language requested at login.
    pub language: Option<String>,

    /// Character set requested at login.
    pub charset: Option<String>,

    /// Server product.
    pub server_type: ServerType,

    /// Requested protocol version; the server type's default when `None`.
    pub tds_version: Option<TdsVersion>,

    /// Encryption mode.
    pub ssl: SslMode,

    /// Skip server certificate validation unless `ssl` is `Authenticate`.
    pub trust_server_certificate: bool,

    /// TLS settings used when encryption is negotiated.
    pub tls: TlsConfig,

    /// Requested packet size; 0 selects the version default.
    pub packet_size: usize,

    /// Phase timeouts.
    pub timeouts: TimeoutConfig,

    /// Largest single value the reader will buffer.
    pub max_value_size: Option<usize>,

    /// Client MAC address sent in the extended login.
    pub mac_address: [u8; 6],

    /// Client library name sent in the login.
    pub library_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            instance: None,
            database: None,
            user: String::new(),
            password: String::new(),
            application_name: "tds-client".to_string(),
            workstation_id: String::new(),
            language: None,
            charset: None,
            server_type: ServerType::default(),
            tds_version: None,
            ssl: SslMode::default(),
            trust_server_certificate: true,
            tls: TlsConfig::default(),
            packet_size: 0,
            timeouts: TimeoutConfig::default(),
            max_value_size: None,
            mac_address: [0; 6],
            library_name: "tds-client".to_string(),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1"
}

fn parse_secs(value: &str) -> Result<Duration, Error> {
    let secs: u64 = value
        .parse()
        .map_err(|_| Error::Config(format!("invalid timeout: {value}")))?;
    Ok(Duration::from_secs(secs))
}

fn parse_mac(value: &str) -> Result<[u8; 6], Error> {
    let invalid = || Error::Config(format!("invalid mac address: {value}"));
    let digits: String = value.chars().filter(|c| !matches!(c, ':' | '-')).collect();
    if digits.len() != 12 || !digits.is_ascii() {
        return Err(invalid());
    }
    let mut mac = [0u8; 6];
    for (i, byte) in mac.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
    }
    Ok(mac)
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a connection string into configuration.
    ///
    /// Keys are case-insensitive; unknown keys are ignored:
    /// ```text
    /// Server=db1,1433;Database=sales;User Id=sa;Password=secret;TDS Version=8.0;
    /// ```
    pub fn from_connection_string(conn_str: &str) -> Result<Self, Error> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "server" | "data source" | "host" | "servername" => {
                    if let Some((host, port)) = value.split_once(',') {
                        config.host = host.trim().to_string();
                        config.port = Some(
                            port.trim()
                                .parse()
                                .map_err(|_| Error::Config(format!("invalid port: {port}")))?,
                        );
                    } else if let Some((host, instance)) = value.split_once('\\') {
                        config.host = host.to_string();
                        config.instance = Some(instance.to_string());
                    } else {
                        config.host = value.to_string();
                    }
                }
                "port" | "portnumber" => {
                    config.port = Some(
                        value
                            .parse()
                            .map_err(|_| Error::Config(format!("invalid port: {value}")))?,
                    );
                }
                "instance" => config.instance = Some(value.to_string()),
                "database" | "initial catalog" | "databasename" => {
                    config.database = Some(value.to_string());
                }
                "user id" | "uid" | "user" => config.user = value.to_string(),
                "password" | "pwd" => config.password = value.to_string(),
                "application name" | "app" | "appname" => {
                    config.application_name = value.to_string();
                }
                "workstation id" | "wsid" => config.workstation_id = value.to_string(),
                "language" | "current language" => config.language = Some(value.to_string()),
                "charset" => config.charset = Some(value.to_string()),
                "servertype" | "server type" => {
                    config.server_type = ServerType::parse(value)
                        .ok_or_else(|| Error::Config(format!("invalid server type: {value}")))?;
                }
                "tds" | "tdsversion" | "tds version" => {
                    config.tds_version = Some(TdsVersion::parse(value).ok_or_else(|| {
                        Error::Config(format!(
                            "invalid TDS version: {value}. Supported values: 4.2, 5.0, 7.0, 8.0, 8.1"
                        ))
                    })?);
                }
                "ssl" | "encrypt" => {
                    config.ssl = SslMode::parse(value)
                        .ok_or_else(|| Error::Config(format!("invalid ssl mode: {value}")))?;
                }
                "trustservercertificate" | "trust server certificate" => {
                    config.trust_server_certificate = parse_bool(value);
                }
                "packet size" | "packetsize" => {
                    config.packet_size = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid packet size: {value}")))?;
                }
                "connect timeout" | "connection timeout" => {
                    config.timeouts.connect_timeout = parse_secs(value)?;
                }
                "login timeout" | "logintimeout" => {
                    config.timeouts.login_timeout = parse_secs(value)?;
                }
                "command timeout" | "sockettimeout" => {
                    let timeout = parse_secs(value)?;
                    config.timeouts.command_timeout = (!timeout.is_zero()).then_some(timeout);
                }
                "max value size" | "maxvaluesize" => {
                    config.max_value_size = Some(
                        value
                            .parse()
                            .map_err(|_| Error::Config(format!("invalid max value size: {value}")))?,
                    );
                }
                "macaddress" | "mac address" => config.mac_address = parse_mac(value)?,
                "library name" | "progname" => {
                    config.library_name = value.to_string();
                }
                _ => {
                    tracing::debug!(
                        key = key,
                        value = value,
                        "ignoring unknown connection string option"
                    );
                }
            }
        }

        Ok(config)
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the login name and password.
    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the server product.
    #[must_use]
    pub fn server_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    /// Set the requested protocol version.
    #[must_use]
    pub fn tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = Some(version);
        self
    }

    /// Set the encryption mode.
    #[must_use]
    pub fn ssl(mut self, mode: SslMode) -> Self {
        self.ssl = mode;
        self
    }

    /// Skip server certificate validation.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set all timeouts.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the first-byte command timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.command_timeout = Some(timeout);
        self
    }

    /// Bound the size of a single decoded value.
    #[must_use]
    pub fn max_value_size(mut self, limit: usize) -> Self {
        self.max_value_size = Some(limit);
        self
    }

    /// Port to connect to.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.server_type.default_port())
    }

    /// Protocol version to request.
    #[must_use]
    pub fn effective_version(&self) -> TdsVersion {
        self.tds_version
            .unwrap_or_else(|| self.server_type.default_version())
    }

    /// Packet size to request, clamped to the protocol limits.
    #[must_use]
    pub fn effective_packet_size(&self) -> usize {
        clamp_packet_size(
            self.packet_size,
            self.effective_version().default_packet_size(),
        )
    }

    /// TLS settings with the certificate policy applied.
    #[must_use]
    pub fn tls_config(&self) -> TlsConfig {
        let trust = self.trust_server_certificate && self.ssl != SslMode::Authenticate;
        self.tls.clone().trust_server_certificate(trust)
    }

    /// Build the login record for this configuration.
    #[must_use]
    pub fn login(&self) -> Login {
        let version = self.effective_version();
        let mut login = Login::new(version)
            .with_credentials(&self.user, &self.password)
            .with_hostname(&self.workstation_id)
            .with_app_name(&self.application_name)
            .with_server_name(&self.host)
            .with_packet_size(self.effective_packet_size() as u32);
        if let Some(database) = &self.database {
            login = login.with_database(database);
        }
        login.library_name.clone_from(&self.library_name);
        login.language = self.language.clone().unwrap_or_default();
        login.charset = self.charset.clone().unwrap_or_default();
        login.client_id = self.mac_address;
        login
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_parsing() {
        let config = Config::from_connection_string(
            "Server=localhost;Database=test;User Id=sa;Password=secret;",
        )
        .unwrap();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.database, Some("test".to_string()));
        assert_eq!(config.user, "sa");
        assert_eq!(config.password, "secret");
    }

    #[test]
    fn test_connection_string_with_port() {
        let config =
            Config::from_connection_string("Server=localhost,1434;Database=test;").unwrap();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.effective_port(), 1434);
    }

    #[test]
    fn test_connection_string_with_instance() {
        let config =
            Config::from_connection_string("Server=localhost\\SQLEXPRESS;Database=test;").unwrap();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.instance, Some("SQLEXPRESS".to_string()));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let config = Config::from_connection_string("SERVER=db1;uSeR iD=app;PWD=x").unwrap();
        assert_eq!(config.host, "db1");
        assert_eq!(config.user, "app");
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = Config::from_connection_string("Server=db1;Frobnicate=yes;").unwrap();
        assert_eq!(config.host, "db1");
    }

    #[test]
    fn test_invalid_pair() {
        assert!(Config::from_connection_string("Server").is_err());
        assert!(Config::from_connection_string("Server=a,notaport").is_err());
    }

    #[test]
    fn test_sybase_defaults() {
        let config = Config::from_connection_string("Server=ase1;ServerType=sybase;").unwrap();
        assert_eq!(config.server_type, ServerType::Sybase);
        assert_eq!(config.effective_port(), 7100);
        assert_eq!(config.effective_version(), TdsVersion::V5_0);
        assert_eq!(config.effective_packet_size(), 512);
    }

    #[test]
    fn test_sql_server_defaults() {
        let config = Config::new();
        assert_eq!(config.effective_port(), 1433);
        assert_eq!(config.effective_version(), TdsVersion::V7_1);
        assert_eq!(config.effective_packet_size(), 4096);
        assert!(config.timeouts.command_timeout.is_none());
    }

    #[test]
    fn test_connection_string_tds_version() {
        let config = Config::from_connection_string("Server=h;TDS=4.2").unwrap();
        assert_eq!(config.effective_version(), TdsVersion::V4_2);

        let config = Config::from_connection_string("Server=h;TDS Version=8.1").unwrap();
        assert_eq!(config.effective_version(), TdsVersion::V7_1_REV1);

        assert!(Config::from_connection_string("Server=h;TDS=9.0").is_err());
    }

    #[test]
    fn test_packet_size_clamped() {
        let config = Config::from_connection_string("Server=h;Packet Size=100").unwrap();
        assert_eq!(config.effective_packet_size(), 512);

        let config = Config::new().packet_size(65536);
        assert_eq!(config.effective_packet_size(), 32768);
    }

    #[test]
    fn test_ssl_modes() {
        let config = Config::from_connection_string("Server=h;ssl=require").unwrap();
        assert_eq!(config.ssl, SslMode::Require);
        assert_eq!(config.ssl.level(), EncryptionLevel::On);
        assert!(config.tls_config().trust_server_certificate);

        let config = Config::from_connection_string("Server=h;ssl=authenticate").unwrap();
        assert!(!config.tls_config().trust_server_certificate);

        assert_eq!(SslMode::Off.level(), EncryptionLevel::NotSupported);
        assert_eq!(SslMode::Request.level(), EncryptionLevel::Off);
        assert!(Config::from_connection_string("Server=h;ssl=maybe").is_err());
    }

    #[test]
    fn test_timeouts() {
        let config = Config::from_connection_string(
            "Server=h;Connect Timeout=5;Login Timeout=7;Command Timeout=3",
        )
        .unwrap();
        assert_eq!(config.timeouts.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.timeouts.login_timeout, Duration::from_secs(7));
        assert_eq!(config.timeouts.command_timeout, Some(Duration::from_secs(3)));

        let config = Config::from_connection_string("Server=h;Command Timeout=0").unwrap();
        assert!(config.timeouts.command_timeout.is_none());
    }

    #[test]
    fn test_mac_address() {
        let config = Config::from_connection_string("Server=h;MacAddress=00-1A-2b-3C-4d-5E").unwrap();
        assert_eq!(config.mac_address, [0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E]);
        assert!(Config::from_connection_string("Server=h;MacAddress=001A2B").is_err());
    }

    #[test]
    fn test_login_record() {
        let config = Config::new()
            .host("db1")
            .credentials("sa", "pw")
            .database("sales")
            .application_name("report");
        let login = config.login();
        assert_eq!(login.tds_version, TdsVersion::V7_1);
        assert_eq!(login.username, "sa");
        assert_eq!(login.database, "sales");
        assert_eq!(login.server_name, "db1");
        assert_eq!(login.app_name, "report");
        assert_eq!(login.packet_size, 4096);
    }
}

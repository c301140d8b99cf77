//! Database containers via testcontainers.

use std::borrow::Cow;

use testcontainers::Image;
use testcontainers::core::{ContainerPort, WaitFor};

/// Server product a container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    /// Microsoft SQL Server.
    SqlServer,
    /// SAP (Sybase) Adaptive Server Enterprise.
    Sybase,
}

/// A TDS server image.
#[derive(Debug, Clone)]
pub struct TdsServerContainer {
    kind: ServerKind,
    /// Administrator password.
    pub password: String,
    /// Container tag (version).
    pub tag: String,
    ports: [ContainerPort; 1],
}

impl Default for TdsServerContainer {
    fn default() -> Self {
        Self::sql_server()
    }
}

impl TdsServerContainer {
    /// SQL Server developer edition.
    #[must_use]
    pub fn sql_server() -> Self {
        Self {
            kind: ServerKind::SqlServer,
            password: "Password123!".to_string(),
            tag: "2019-latest".to_string(),
            ports: [ContainerPort::Tcp(1433)],
        }
    }

    /// Sybase ASE 16 with the `testdb` database.
    #[must_use]
    pub fn sybase() -> Self {
        Self {
            kind: ServerKind::Sybase,
            password: "myPassword".to_string(),
            tag: "latest".to_string(),
            ports: [ContainerPort::Tcp(5000)],
        }
    }

    /// Set the administrator password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the container tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Server product.
    #[must_use]
    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    /// Port the server listens on inside the container.
    #[must_use]
    pub fn internal_port(&self) -> u16 {
        match self.kind {
            ServerKind::SqlServer => 1433,
            ServerKind::Sybase => 5000,
        }
    }

    /// Connection string for the administrator account at a mapped port.
    #[must_use]
    pub fn connection_string(&self, host: &str, port: u16) -> String {
        match self.kind {
            ServerKind::SqlServer => format!(
                "Server={host},{port};User Id=sa;Password={};Database=master;TrustServerCertificate=true",
                self.password
            ),
            ServerKind::Sybase => format!(
                "Server={host},{port};ServerType=sybase;User Id=sa;Password={};Database=testdb",
                self.password
            ),
        }
    }
}

impl Image for TdsServerContainer {
    fn name(&self) -> &str {
        match self.kind {
            ServerKind::SqlServer => "mcr.microsoft.com/mssql/server",
            ServerKind::Sybase => "datagrip/sybase",
        }
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        match self.kind {
            ServerKind::SqlServer => vec![
                WaitFor::message_on_stdout("SQL Server is now ready for client connections"),
                WaitFor::seconds(5),
            ],
            ServerKind::Sybase => vec![
                WaitFor::message_on_stdout("SYBASE INITIALIZED"),
                WaitFor::seconds(5),
            ],
        }
    }

    fn env_vars(
        &self,
    ) -> impl IntoIterator<Item = (impl Into<Cow<'_, str>>, impl Into<Cow<'_, str>>)> {
        match self.kind {
            ServerKind::SqlServer => vec![
                ("ACCEPT_EULA", "Y"),
                ("MSSQL_SA_PASSWORD", self.password.as_str()),
                ("MSSQL_PID", "Developer"),
            ],
            ServerKind::Sybase => vec![("SYBASE_PASSWORD", self.password.as_str())],
        }
    }

    fn expose_ports(&self) -> &[ContainerPort] {
        &self.ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_strings() {
        let sql = TdsServerContainer::sql_server().with_password("pw");
        assert!(sql.connection_string("localhost", 4000).starts_with("Server=localhost,4000;"));

        let sybase = TdsServerContainer::sybase();
        assert_eq!(sybase.internal_port(), 5000);
        assert!(sybase.connection_string("h", 1).contains("ServerType=sybase"));
    }
}

use std::collections::HashSet;
use std::time::Duration;

use super::error::ConfigError;

/// Name of the default query-record database group.
pub const QUERY_RECORD_DB: &str = "queryRecordDb";
/// Name of the default chat-log database group.
pub const CHAT_LOG_DB: &str = "chatLogDb";
/// Name of the default external-service group.
pub const EXTERNAL_SERVICE: &str = "externalService";

/// What kind of downstream resource a group fronts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    /// A session-backed database with a bounded connection pool.
    Database {
        /// Connections the backing store allows at once.
        max_connections: usize,
        /// How long `create_session` waits for a free connection.
        acquire_timeout: Duration,
    },
    /// A slow external service called without a session.
    External {
        /// Simulated latency of one call.
        processing_time: Duration,
    },
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database { .. } => "database",
            Self::External { .. } => "external",
        }
    }
}

/// One declared resource group: a downstream dependency plus the size of the
/// worker pool dedicated to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroupConfig {
    pub name: String,
    /// Worker threads in the group's pool. For a database this should equal
    /// `max_connections`.
    pub pool_size: usize,
    /// Drain timeout for the group's pool at shutdown.
    pub shutdown_timeout: Duration,
    pub kind: ResourceKind,
}

impl ResourceGroupConfig {
    /// A database group whose connection pool matches its worker pool.
    #[must_use]
    pub fn database(name: impl Into<String>, pool_size: usize) -> Self {
        Self {
            name: name.into(),
            pool_size,
            shutdown_timeout: Duration::from_secs(5),
            kind: ResourceKind::Database {
                max_connections: pool_size,
                acquire_timeout: Duration::from_secs(30),
            },
        }
    }

    #[must_use]
    pub fn external(name: impl Into<String>, pool_size: usize) -> Self {
        Self {
            name: name.into(),
            pool_size,
            shutdown_timeout: Duration::from_secs(5),
            kind: ResourceKind::External {
                processing_time: Duration::from_secs(1),
            },
        }
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn is_database(&self) -> bool {
        matches!(self.kind, ResourceKind::Database { .. })
    }
}

/// Server-level configuration, selected once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Every resource group, created in this order.
    pub groups: Vec<ResourceGroupConfig>,
    /// Database group holding query records.
    pub query_group: String,
    /// Database group holding the chat log. May equal `query_group`.
    pub chat_group: String,
    /// External group used for enrichment.
    pub external_group: String,
    /// How long a caller waits for an asynchronously processed request.
    pub request_timeout: Duration,
    /// Ping interval for chat connections. `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            groups: vec![
                ResourceGroupConfig::database(QUERY_RECORD_DB, 10),
                ResourceGroupConfig::database(CHAT_LOG_DB, 10),
                ResourceGroupConfig::external(EXTERNAL_SERVICE, 30),
            ],
            query_group: QUERY_RECORD_DB.to_string(),
            chat_group: CHAT_LOG_DB.to_string(),
            external_group: EXTERNAL_SERVICE.to_string(),
            request_timeout: Duration::from_secs(100),
            keepalive_interval: Some(Duration::from_secs(55)),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&ResourceGroupConfig> {
        self.groups.iter().find(|group| group.name == name)
    }

    /// Rejects configurations that cannot be wired.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: an empty or duplicate group name, a
    /// zero pool size or connection count, or a flow pointing at a group that
    /// is undeclared or of the wrong kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(ConfigError::EmptyGroupName);
            }
            if !seen.insert(group.name.as_str()) {
                return Err(ConfigError::DuplicateGroup {
                    name: group.name.clone(),
                });
            }
            if group.pool_size == 0 {
                return Err(ConfigError::InvalidPoolSize {
                    name: group.name.clone(),
                });
            }
            if let ResourceKind::Database {
                max_connections: 0, ..
            } = group.kind
            {
                return Err(ConfigError::InvalidConnectionCount {
                    name: group.name.clone(),
                });
            }
        }

        self.require("query", &self.query_group, true)?;
        self.require("chat", &self.chat_group, true)?;
        self.require("enrichment", &self.external_group, false)?;
        Ok(())
    }

    fn require(&self, flow: &'static str, name: &str, database: bool) -> Result<(), ConfigError> {
        let group = self.group(name).ok_or_else(|| ConfigError::UnknownGroup {
            name: name.to_string(),
        })?;
        if group.is_database() == database {
            Ok(())
        } else {
            Err(ConfigError::WrongGroupKind {
                flow,
                name: name.to_string(),
                expected: if database { "database" } else { "external" },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_declare_the_three_sample_groups() {
        let config = ServerConfig::default();
        let names: Vec<&str> = config.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["queryRecordDb", "chatLogDb", "externalService"]);
        assert_eq!(config.group("externalService").unwrap().pool_size, 30);
        assert_eq!(
            config.group("queryRecordDb").unwrap().kind,
            ResourceKind::Database {
                max_connections: 10,
                acquire_timeout: Duration::from_secs(30),
            }
        );
        assert_eq!(config.request_timeout, Duration::from_secs(100));
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(55)));
        assert!(config
            .groups
            .iter()
            .all(|g| g.shutdown_timeout == Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn single_database_variant_is_valid() {
        let config = ServerConfig {
            groups: vec![
                ResourceGroupConfig::database(QUERY_RECORD_DB, 4),
                ResourceGroupConfig::external(EXTERNAL_SERVICE, 8),
            ],
            chat_group: QUERY_RECORD_DB.to_string(),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_group_is_rejected() {
        let mut config = ServerConfig::default();
        config.groups.push(ResourceGroupConfig::database(CHAT_LOG_DB, 2));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateGroup { name }) if name == CHAT_LOG_DB
        ));
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut config = ServerConfig::default();
        config.groups[2].pool_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPoolSize { .. })
        ));
    }

    #[test]
    fn zero_connections_are_rejected() {
        let mut config = ServerConfig::default();
        config.groups[0].kind = ResourceKind::Database {
            max_connections: 0,
            acquire_timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConnectionCount { .. })
        ));
    }

    #[test]
    fn undeclared_flow_group_is_rejected() {
        let config = ServerConfig {
            chat_group: "missing".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownGroup { name }) if name == "missing"
        ));
    }

    #[test]
    fn flow_pointing_at_wrong_kind_is_rejected() {
        let config = ServerConfig {
            external_group: QUERY_RECORD_DB.to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WrongGroupKind { expected: "external", .. })
        ));
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut config = ServerConfig::default();
        config.groups[0].name = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyGroupName)));
    }
}

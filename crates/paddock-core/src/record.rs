//! Hypervisor endpoint credentials.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

fn default_pool() -> String {
    "default".into()
}

fn default_port() -> u16 {
    8006
}

fn default_user() -> String {
    "root".into()
}

fn default_realm() -> String {
    "pam".into()
}

fn default_node() -> String {
    "proxmox".into()
}

fn default_true() -> bool {
    true
}

/// Credentials and identity for one hypervisor endpoint.
///
/// Records are built once from configuration and never mutated. A record
/// is either queued in its pool or held by exactly one consumer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    instance_id: String,
    #[serde(default = "default_pool")]
    pool_id: String,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_user")]
    user: String,
    #[serde(default = "default_realm")]
    user_realm: String,
    #[serde(default)]
    password: String,
    #[serde(default = "default_node")]
    node: String,
    #[serde(default = "default_true")]
    verify_tls: bool,
}

impl ResourceRecord {
    /// A record with default port, user, realm and node.
    pub fn new(
        instance_id: impl Into<String>,
        pool_id: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            pool_id: pool_id.into(),
            host: host.into(),
            port: default_port(),
            user: default_user(),
            user_realm: default_realm(),
            password: String::new(),
            node: default_node(),
            verify_tls: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_login(mut self, user: impl Into<String>, realm: impl Into<String>) -> Self {
        self.user = user.into();
        self.user_realm = realm.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Node name VM and storage calls are addressed to.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn verify_tls(&self) -> bool {
        self.verify_tls
    }

    /// `host:port`, the key for per-endpoint locking.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `user@realm` as the ticket endpoint expects it.
    pub fn login_user(&self) -> String {
        format!("{}@{}", self.user, self.user_realm)
    }
}

impl fmt::Debug for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRecord")
            .field("instance_id", &self.instance_id)
            .field("pool_id", &self.pool_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.login_user())
            .field("password", &"<redacted>")
            .field("node", &self.node)
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// The first record for each distinct endpoint, in order.
pub fn distinct_endpoints(records: &[ResourceRecord]) -> Vec<&ResourceRecord> {
    let mut seen = HashSet::new();
    records.iter().filter(|r| seen.insert(r.endpoint())).collect()
}

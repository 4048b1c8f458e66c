use std::fmt;

use anyhow::{Context, Result};

/// Key used to index pooled connections: tenant identity plus target endpoint.
///
/// Endpoints are normalised down to `scheme://host:port` so different paths on
/// the same admin or site origin share one session. Tenant identities compare
/// case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ConnectionKey {
    pub tenant: String,
    pub endpoint: String,
}

impl ConnectionKey {
    /// Build a key from a tenant identity and any URL on the target endpoint.
    pub fn new(tenant: &str, endpoint_url: &str) -> Result<Self> {
        let tenant = tenant.trim().to_lowercase();
        if tenant.is_empty() {
            anyhow::bail!("empty tenant identity for endpoint {endpoint_url}");
        }

        let parsed = url::Url::parse(endpoint_url)
            .with_context(|| format!("invalid endpoint URL: {endpoint_url}"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("endpoint URL missing host: {endpoint_url}"))?
            .to_lowercase();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("endpoint URL missing port and unknown default: {endpoint_url}"))?;

        Ok(Self {
            tenant,
            endpoint: format!("{}://{}:{}", parsed.scheme(), host, port),
        })
    }

    /// String form for logs and persistence: "tenant|endpoint".
    pub fn to_string_key(&self) -> String {
        format!("{}|{}", self.tenant, self.endpoint)
    }

    /// Parse from the string form.
    pub fn from_string_key(s: &str) -> Option<Self> {
        let (tenant, endpoint) = s.split_once('|')?;
        if tenant.is_empty() || endpoint.is_empty() {
            return None;
        }
        Some(Self {
            tenant: tenant.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tenant, self.endpoint)
    }
}

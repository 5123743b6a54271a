use crate::config::{CfgPolicy, ConfigError};

/// Decides whether an envelope sender falls under the Reply-To policy.
///
/// Built once at startup and shared read-only by every session. Matching is
/// case-sensitive on the configured patterns.
#[derive(Debug, Clone)]
pub struct SenderPolicy {
    domains: Vec<String>,
    suffixes: Vec<String>,
}

impl SenderPolicy {
    pub fn new(domains: Vec<String>, suffixes: Vec<String>) -> Result<Self, ConfigError> {
        if domains.is_empty() && suffixes.is_empty() {
            return Err(ConfigError::EmptyPolicy);
        }
        if let Some(bad) = domains
            .iter()
            .chain(&suffixes)
            .find(|pattern| pattern.is_empty() || pattern.contains('@'))
        {
            return Err(ConfigError::InvalidPattern(bad.clone()));
        }

        Ok(Self { domains, suffixes })
    }

    pub fn from_cfg(cfg: &CfgPolicy) -> Result<Self, ConfigError> {
        Self::new(cfg.domains.clone(), cfg.suffixes.clone())
    }

    /// `address` is an envelope sender without the surrounding `<>`.
    pub fn matches(&self, address: &str) -> bool {
        let Some(domain) = extract_domain(address) else {
            return false;
        };

        self.domains.iter().any(|d| d == domain)
            || self
                .suffixes
                .iter()
                .any(|s| domain.len() > s.len() && domain.ends_with(s.as_str()))
    }
}

/// Everything after the last `@`, if non-empty.
fn extract_domain(address: &str) -> Option<&str> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

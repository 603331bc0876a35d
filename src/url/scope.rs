use crate::config::ScopeConfig;
use crate::url::host::host_name;

/// Checks if a host matches a wildcard pattern
///
/// `example.com` matches only itself. `*.example.com` matches the bare
/// domain and any subdomain at any depth. Hosts are expected lowercased.
///
/// ```
/// use lurker::url::matches_wildcard;
///
/// assert!(matches_wildcard("*.example.com", "example.com"));
/// assert!(matches_wildcard("*.example.com", "api.v2.example.com"));
/// assert!(!matches_wildcard("*.example.com", "myexample.com"));
/// ```
pub fn matches_wildcard(pattern: &str, candidate: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(base) => {
            candidate == base
                || (candidate.len() > base.len()
                    && candidate.ends_with(base)
                    && candidate.as_bytes()[candidate.len() - base.len() - 1] == b'.')
        }
        None => candidate == pattern,
    }
}

/// Decides whether a discovered host is followed
#[derive(Debug, Clone, Default)]
pub struct Scope {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl Scope {
    pub fn new(config: &ScopeConfig) -> Self {
        Self {
            allow: config.allow.iter().map(|p| p.to_lowercase()).collect(),
            deny: config.deny.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Returns true if items on `host` may enter the frontier
    ///
    /// Deny patterns win over allow patterns; an empty allow list admits
    /// every host not denied. Ports are ignored.
    pub fn permits(&self, host: &str) -> bool {
        let name = host_name(host);

        if self.deny.iter().any(|p| matches_wildcard(p, name)) {
            return false;
        }

        self.allow.is_empty() || self.allow.iter().any(|p| matches_wildcard(p, name))
    }
}

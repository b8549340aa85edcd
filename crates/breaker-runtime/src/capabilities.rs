//! Host permissions for script registration
//!
//! In dev mode every hostname is allowed. Otherwise deny patterns win over
//! allow patterns, and a missing allow list means all hosts, like an
//! extension declared with `<all_urls>`.

use globset::{GlobSet, GlobSetBuilder};
use serde::Deserialize;

/// Permissions section from breaker.toml
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Permissions {
    pub hosts: Option<HostPermissions>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostPermissions {
    pub allow: Option<Vec<String>>,
    pub deny: Option<Vec<String>>,
}

/// Runtime capabilities checker
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub dev_mode: bool,
    host_allow_patterns: Option<GlobSet>,
    host_deny_patterns: Option<GlobSet>,
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Permission denied: {capability} for {resource}")]
    Denied {
        capability: String,
        resource: String,
    },

    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(String),
}

impl Capabilities {
    /// Create capabilities from configured permissions
    pub fn from_permissions(
        permissions: Option<&Permissions>,
        dev_mode: bool,
    ) -> Result<Self, CapabilityError> {
        let hosts = permissions
            .and_then(|p| p.hosts.clone())
            .unwrap_or_default();

        Ok(Self {
            dev_mode,
            host_allow_patterns: Self::compile_host_patterns(hosts.allow.as_ref())?,
            host_deny_patterns: Self::compile_host_patterns(hosts.deny.as_ref())?,
        })
    }

    /// Everything allowed
    pub fn permissive() -> Self {
        Self {
            dev_mode: true,
            host_allow_patterns: None,
            host_deny_patterns: None,
        }
    }

    /// Compile glob patterns for hostnames (supports *.example.com style wildcards)
    fn compile_host_patterns(
        patterns: Option<&Vec<String>>,
    ) -> Result<Option<GlobSet>, CapabilityError> {
        match patterns {
            None => Ok(None),
            Some(pats) if pats.is_empty() => Ok(None),
            Some(pats) => {
                let mut builder = GlobSetBuilder::new();
                for pat in pats {
                    // . is part of the domain, so no literal separator
                    let glob = globset::GlobBuilder::new(pat)
                        .literal_separator(false)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| CapabilityError::InvalidPattern(e.to_string()))?;
                    builder.add(glob);
                }
                Ok(Some(builder.build().map_err(|e| {
                    CapabilityError::InvalidPattern(e.to_string())
                })?))
            }
        }
    }

    /// Check if breaker scripts may be registered for the given hostname
    pub fn check_host(&self, hostname: &str) -> Result<(), CapabilityError> {
        if self.dev_mode {
            return Ok(());
        }

        let denied = || CapabilityError::Denied {
            capability: "hosts".to_string(),
            resource: hostname.to_string(),
        };

        if let Some(deny_patterns) = &self.host_deny_patterns {
            if deny_patterns.is_match(hostname) {
                return Err(denied());
            }
        }

        match &self.host_allow_patterns {
            None => Ok(()),
            Some(allow_patterns) if allow_patterns.is_match(hostname) => Ok(()),
            Some(_) => Err(denied()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(allow: Option<&[&str]>, deny: Option<&[&str]>) -> Permissions {
        let owned = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Permissions {
            hosts: Some(HostPermissions {
                allow: allow.map(owned),
                deny: deny.map(owned),
            }),
        }
    }

    #[test]
    fn test_dev_mode_allows_all() {
        let perms = hosts(None, Some(&["*"]));
        let caps = Capabilities::from_permissions(Some(&perms), true).unwrap();
        assert!(caps.check_host("any.host.com").is_ok());
    }

    #[test]
    fn test_no_permissions_allows_all_hosts() {
        let caps = Capabilities::from_permissions(None, false).unwrap();
        assert!(caps.check_host("example.com").is_ok());
    }

    #[test]
    fn test_deny_takes_precedence() {
        let perms = hosts(Some(&["*.example.com"]), Some(&["admin.example.com"]));
        let caps = Capabilities::from_permissions(Some(&perms), false).unwrap();

        assert!(caps.check_host("www.example.com").is_ok());
        assert!(caps.check_host("WWW.Example.com").is_ok());
        assert!(caps.check_host("admin.example.com").is_err());
        assert!(caps.check_host("example.org").is_err());
    }

    #[test]
    fn test_invalid_pattern() {
        let perms = hosts(Some(&["[unclosed"]), None);
        let err = Capabilities::from_permissions(Some(&perms), false).unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidPattern(_)));
    }
}

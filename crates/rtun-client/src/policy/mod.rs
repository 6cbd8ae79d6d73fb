//! Host policy (`spec.md` §4.E.1): two pattern sets, `allowed` and `forbidden`, each
//! made of literal `host[:port]` entries, regexes, or CIDR blocks. A target is let
//! through only if no `forbidden` pattern matches it and at least one `allowed`
//! pattern does; deny always wins over allow.

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum PolicyError {
    #[snafu(display("invalid regex pattern {pattern:?}"))]
    Regex { pattern: String, source: regex::Error },

    #[snafu(display("invalid CIDR block {cidr:?}"))]
    Cidr { cidr: String, source: ipnet::AddrParseError },
}

/// Declarative form a pattern is configured in (TOML/JSON); compiled into a
/// [`HostPattern`] once at startup.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostPatternSpec {
    Literal { host: String, port: Option<u16> },
    Regex { pattern: String, port: Option<u16> },
    Cidr { cidr: String, port: Option<u16> },
}

/// One compiled pattern. `Literal` and `Regex` match against the requested hostname as
/// given by the client dialing in; `Cidr` matches the resolved IP literal, since a CIDR
/// block is meaningless against a hostname string (`spec.md` §4.E.1).
pub enum HostPattern {
    Literal { host: String, port: Option<u16> },
    Regex { pattern: Regex, port: Option<u16> },
    Cidr { net: IpNet, port: Option<u16> },
}

impl HostPattern {
    pub fn compile(spec: HostPatternSpec) -> Result<Self, PolicyError> {
        Ok(match spec {
            HostPatternSpec::Literal { host, port } => HostPattern::Literal { host, port },
            HostPatternSpec::Regex { pattern, port } => {
                let compiled = Regex::new(&pattern).context(RegexSnafu { pattern: pattern.clone() })?;
                HostPattern::Regex { pattern: compiled, port }
            }
            HostPatternSpec::Cidr { cidr, port } => {
                let net: IpNet = cidr.parse().context(CidrSnafu { cidr: cidr.clone() })?;
                HostPattern::Cidr { net, port }
            }
        })
    }

    fn port_matches(pattern_port: Option<u16>, target_port: u16) -> bool {
        pattern_port.map_or(true, |p| p == target_port)
    }

    /// `resolved_ip` is `None` when resolution hasn't happened yet or failed; `Cidr`
    /// patterns never match in that case.
    fn matches(&self, host: &str, resolved_ip: Option<IpAddr>, port: u16) -> bool {
        match self {
            HostPattern::Literal { host: pattern_host, port: pattern_port } => {
                pattern_host.eq_ignore_ascii_case(host) && Self::port_matches(*pattern_port, port)
            }
            HostPattern::Regex { pattern, port: pattern_port } => {
                pattern.is_match(host) && Self::port_matches(*pattern_port, port)
            }
            HostPattern::Cidr { net, port: pattern_port } => {
                resolved_ip.is_some_and(|ip| net.contains(&ip)) && Self::port_matches(*pattern_port, port)
            }
        }
    }
}

/// The compiled `allowed`/`forbidden` pattern sets for one Private Client.
#[derive(Default)]
pub struct HostPolicy {
    allowed: Vec<HostPattern>,
    forbidden: Vec<HostPattern>,
}

impl HostPolicy {
    pub fn compile(allowed: Vec<HostPatternSpec>, forbidden: Vec<HostPatternSpec>) -> Result<Self, PolicyError> {
        Ok(Self {
            allowed: allowed.into_iter().map(HostPattern::compile).collect::<Result<_, _>>()?,
            forbidden: forbidden.into_iter().map(HostPattern::compile).collect::<Result<_, _>>()?,
        })
    }

    /// `spec.md` §4.E.1: `(i) no forbidden pattern matches AND (ii) at least one
    /// allowed pattern matches`.
    pub fn is_allowed(&self, host: &str, resolved_ip: Option<IpAddr>, port: u16) -> bool {
        let denied = self.forbidden.iter().any(|p| p.matches(host, resolved_ip, port));
        if denied {
            return false;
        }
        self.allowed.iter().any(|p| p.matches(host, resolved_ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allowed: Vec<HostPatternSpec>, forbidden: Vec<HostPatternSpec>) -> HostPolicy {
        HostPolicy::compile(allowed, forbidden).unwrap()
    }

    #[test]
    fn allows_only_matched_literal() {
        let p = policy(vec![HostPatternSpec::Literal { host: "example.com".into(), port: None }], vec![]);
        assert!(p.is_allowed("example.com", None, 443));
        assert!(!p.is_allowed("evil.com", None, 443));
    }

    #[test]
    fn forbidden_overrides_allowed() {
        let p = policy(
            vec![HostPatternSpec::Regex { pattern: ".*".into(), port: None }],
            vec![HostPatternSpec::Literal { host: "internal.example.com".into(), port: None }],
        );
        assert!(p.is_allowed("example.com", None, 80));
        assert!(!p.is_allowed("internal.example.com", None, 80));
    }

    #[test]
    fn cidr_matches_resolved_ip_only() {
        let p = policy(vec![HostPatternSpec::Cidr { cidr: "10.0.0.0/8".into(), port: None }], vec![]);
        assert!(!p.is_allowed("internal.example.com", None, 80));
        assert!(p.is_allowed("internal.example.com", Some("10.1.2.3".parse().unwrap()), 80));
        assert!(!p.is_allowed("internal.example.com", Some("8.8.8.8".parse().unwrap()), 80));
    }

    #[test]
    fn port_restricted_pattern_only_matches_that_port() {
        let p = policy(vec![HostPatternSpec::Literal { host: "example.com".into(), port: Some(443) }], vec![]);
        assert!(p.is_allowed("example.com", None, 443));
        assert!(!p.is_allowed("example.com", None, 80));
    }
}

//! Outbound URL policy.
//!
//! `assert_safe` decides whether a URL may be requested at all. It checks
//! the scheme, the host shape, the optional host-suffix allowlist and every
//! address the host resolves to. Resolution goes through the policy's
//! resolver so tests can pin DNS without touching the network.
//!
//! Used by: `SafeHttpClient` before the first request and on every redirect.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::sync::Arc;

use url::{Host, Url};

use crate::error::SecurityError;

/// Hostname → addresses. Errors are treated as "did not resolve".
pub type Resolver = Arc<dyn Fn(&str) -> std::io::Result<Vec<IpAddr>> + Send + Sync>;

const LOOPBACK_ALIASES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
];

#[derive(Clone)]
pub struct UrlPolicy {
    pub allowed_schemes: Vec<String>,
    /// Empty means no allowlist beyond the scheme and address checks.
    pub allowed_host_suffixes: Vec<String>,
    pub allow_private_ips: bool,
    pub allow_ip_literal: bool,
    pub resolver: Resolver,
}

impl Default for UrlPolicy {
    /// HTTPS only, public addresses only, hostnames only, system DNS.
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["https".to_string()],
            allowed_host_suffixes: Vec::new(),
            allow_private_ips: false,
            allow_ip_literal: false,
            resolver: system_resolver(),
        }
    }
}

impl fmt::Debug for UrlPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlPolicy")
            .field("allowed_schemes", &self.allowed_schemes)
            .field("allowed_host_suffixes", &self.allowed_host_suffixes)
            .field("allow_private_ips", &self.allow_private_ips)
            .field("allow_ip_literal", &self.allow_ip_literal)
            .finish_non_exhaustive()
    }
}

impl UrlPolicy {
    /// Default policy restricted to hosts under the given suffixes.
    pub fn allowlist<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_host_suffixes: suffixes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_schemes = schemes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_private_ips(mut self, allow: bool) -> Self {
        self.allow_private_ips = allow;
        self
    }

    pub fn with_ip_literals(mut self, allow: bool) -> Self {
        self.allow_ip_literal = allow;
        self
    }
}

/// Resolver backed by the operating system. Blocking; callers on an async
/// runtime run validation on the blocking pool.
pub fn system_resolver() -> Resolver {
    Arc::new(|host: &str| {
        let addrs = (host, 0).to_socket_addrs()?;
        Ok(addrs.map(|a| a.ip()).collect())
    })
}

/// Resolver answering from a fixed table; unknown hosts resolve to nothing.
pub fn static_resolver<I, S>(entries: I) -> Resolver
where
    I: IntoIterator<Item = (S, Vec<IpAddr>)>,
    S: Into<String>,
{
    let table: std::collections::HashMap<String, Vec<IpAddr>> = entries
        .into_iter()
        .map(|(host, addrs)| (host.into().to_ascii_lowercase(), addrs))
        .collect();
    Arc::new(move |host: &str| Ok(table.get(&host.to_ascii_lowercase()).cloned().unwrap_or_default()))
}

/// A URL that passed the policy, with the addresses it was checked against.
#[derive(Debug, Clone)]
pub struct ValidatedUrl {
    pub url: Url,
    /// Present only for hostname URLs; IP literals need no resolution.
    pub host: Option<String>,
    pub addrs: Vec<IpAddr>,
}

pub fn assert_safe_str(url: &str, policy: &UrlPolicy) -> Result<ValidatedUrl, SecurityError> {
    let parsed = Url::parse(url).map_err(|e| SecurityError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    assert_safe(&parsed, policy)
}

pub fn assert_safe(url: &Url, policy: &UrlPolicy) -> Result<ValidatedUrl, SecurityError> {
    let scheme = url.scheme();
    if !policy
        .allowed_schemes
        .iter()
        .any(|s| s.eq_ignore_ascii_case(scheme))
    {
        return Err(SecurityError::SchemeNotAllowed(scheme.to_string()));
    }

    let host = match url.host() {
        Some(host) => host,
        None => return Err(SecurityError::EmptyHost),
    };

    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain.is_empty() {
                return Err(SecurityError::EmptyHost);
            }
            if is_loopback_alias(&domain) {
                return Err(SecurityError::LoopbackHost(domain));
            }
            // Non-special schemes leave IP-shaped hosts as domains.
            if let Ok(ip) = domain.parse::<IpAddr>() {
                check_ip_literal(ip, &domain, policy)?;
                return Ok(ValidatedUrl {
                    url: url.clone(),
                    host: None,
                    addrs: vec![ip],
                });
            }
            if !host_allowed(&domain, &policy.allowed_host_suffixes) {
                return Err(SecurityError::HostNotAllowed(domain));
            }

            let addrs = (policy.resolver)(&domain).unwrap_or_default();
            if addrs.is_empty() {
                return Err(SecurityError::Unresolvable(domain));
            }
            if !policy.allow_private_ips {
                if let Some(addr) = addrs.iter().find(|a| is_internal(a)) {
                    return Err(SecurityError::InternalAddress {
                        host: domain,
                        addr: *addr,
                    });
                }
            }

            Ok(ValidatedUrl {
                url: url.clone(),
                host: Some(domain),
                addrs,
            })
        }
        Host::Ipv4(v4) => {
            let ip = IpAddr::V4(v4);
            check_ip_literal(ip, &v4.to_string(), policy)?;
            Ok(ValidatedUrl {
                url: url.clone(),
                host: None,
                addrs: vec![ip],
            })
        }
        Host::Ipv6(v6) => {
            let ip = IpAddr::V6(v6);
            check_ip_literal(ip, &v6.to_string(), policy)?;
            Ok(ValidatedUrl {
                url: url.clone(),
                host: None,
                addrs: vec![ip],
            })
        }
    }
}

fn check_ip_literal(ip: IpAddr, display: &str, policy: &UrlPolicy) -> Result<(), SecurityError> {
    if ip.is_unspecified() {
        return Err(SecurityError::LoopbackHost(display.to_string()));
    }
    if !policy.allow_private_ips && is_internal(&ip) {
        return Err(SecurityError::InternalAddress {
            host: display.to_string(),
            addr: ip,
        });
    }
    if !policy.allow_ip_literal {
        return Err(SecurityError::IpLiteralNotAllowed(display.to_string()));
    }
    // A bare address can never match a hostname suffix.
    if !policy.allowed_host_suffixes.is_empty() {
        return Err(SecurityError::HostNotAllowed(display.to_string()));
    }
    Ok(())
}

fn is_loopback_alias(host: &str) -> bool {
    LOOPBACK_ALIASES.contains(&host) || host.ends_with(".localhost")
}

/// Case-insensitive suffix match on a label boundary.
pub fn host_allowed(host: &str, suffixes: &[String]) -> bool {
    if suffixes.is_empty() {
        return true;
    }
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    suffixes.iter().any(|suffix| {
        let suffix = suffix.trim_start_matches('.').trim_end_matches('.').to_ascii_lowercase();
        if suffix.is_empty() {
            return false;
        }
        host == suffix
            || (host.len() > suffix.len()
                && host.ends_with(&suffix)
                && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
    })
}

/// Loopback, private, link-local, shared, unspecified, broadcast,
/// documentation, benchmarking and multicast ranges. IPv4-mapped and
/// IPv4-compatible IPv6 addresses are judged by their IPv4 part.
pub fn is_internal(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => is_internal_v6(v6),
    }
}

fn is_internal_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240
}

fn is_internal_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_internal_v4(&v4);
    }
    let segments = ip.segments();
    // ::a.b.c.d (deprecated IPv4-compatible)
    if segments[..6].iter().all(|s| *s == 0) && !ip.is_loopback() && !ip.is_unspecified() {
        let o = ip.octets();
        return is_internal_v4(&Ipv4Addr::new(o[12], o[13], o[14], o[15]));
    }
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (segments[0] & 0xffc0) == 0xfe80
        // fec0::/10 site local (deprecated)
        || (segments[0] & 0xffc0) == 0xfec0
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn public_resolver() -> Resolver {
        Arc::new(|_host: &str| Ok(vec!["140.82.112.6".parse().unwrap()]))
    }

    fn default_deny() -> UrlPolicy {
        UrlPolicy::default()
            .with_schemes(["http", "https"])
            .with_resolver(public_resolver())
    }

    #[test]
    fn rejects_internal_targets_under_default_policy() {
        let policy = default_deny();
        for url in [
            "http://127.0.0.1/",
            "http://169.254.169.254/",
            "http://[::1]/",
            "http://localhost/",
            "http://0.0.0.0/",
            "http://[::ffff:127.0.0.1]/",
            "http://api.localhost/",
            "http://10.0.0.8/",
        ] {
            assert!(assert_safe_str(url, &policy).is_err(), "{} should be rejected", url);
        }
    }

    #[test]
    fn rejects_internal_targets_even_when_literals_are_allowed() {
        let policy = default_deny().with_ip_literals(true);
        let err = assert_safe_str("http://169.254.169.254/latest/meta-data", &policy).unwrap_err();
        assert!(matches!(err, SecurityError::InternalAddress { .. }));
        assert!(assert_safe_str("http://8.8.8.8/", &policy).is_ok());
    }

    #[test]
    fn scheme_must_be_allowed() {
        let err = assert_safe_str("http://github.com/", &UrlPolicy::default().with_resolver(public_resolver()))
            .unwrap_err();
        assert_eq!(err, SecurityError::SchemeNotAllowed("http".into()));
        assert!(assert_safe_str("file:///etc/passwd", &default_deny()).is_err());
    }

    #[test]
    fn allowlist_matches_on_label_boundary() {
        let policy = UrlPolicy::allowlist(["github.com"]).with_resolver(public_resolver());
        assert!(assert_safe_str("https://api.github.com/repos/o/r/commits", &policy).is_ok());
        assert!(assert_safe_str("https://GitHub.com/o/r", &policy).is_ok());

        let err = assert_safe_str("https://evil-github.com.attacker.net/x", &policy).unwrap_err();
        assert!(matches!(err, SecurityError::HostNotAllowed(_)));
        assert!(assert_safe_str("https://evilgithub.com/", &policy).is_err());
    }

    #[test]
    fn allowlist_does_not_override_address_checks() {
        let resolver = static_resolver([("api.github.com", vec!["10.1.2.3".parse().unwrap()])]);
        let policy = UrlPolicy::allowlist(["github.com"]).with_resolver(resolver);
        let err = assert_safe_str("https://api.github.com/", &policy).unwrap_err();
        assert!(matches!(err, SecurityError::InternalAddress { .. }));

        let policy = policy.with_private_ips(true);
        assert!(assert_safe_str("https://api.github.com/", &policy).is_ok());
    }

    #[test]
    fn any_internal_address_rejects_the_host() {
        let resolver = static_resolver([(
            "mixed.example.com",
            vec!["93.184.216.34".parse().unwrap(), "127.0.0.1".parse().unwrap()],
        )]);
        let policy = UrlPolicy::default().with_resolver(resolver);
        assert!(assert_safe_str("https://mixed.example.com/", &policy).is_err());
    }

    #[test]
    fn unresolvable_host_is_rejected() {
        let policy = UrlPolicy::default().with_resolver(static_resolver(Vec::<(String, Vec<IpAddr>)>::new()));
        let err = assert_safe_str("https://nowhere.example/", &policy).unwrap_err();
        assert_eq!(err, SecurityError::Unresolvable("nowhere.example".into()));
    }

    #[test]
    fn validated_url_carries_addresses() {
        let policy = UrlPolicy::default().with_resolver(public_resolver());
        let validated = assert_safe_str("https://api.github.com/", &policy).unwrap();
        assert_eq!(validated.host.as_deref(), Some("api.github.com"));
        assert_eq!(validated.addrs, vec!["140.82.112.6".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn internal_ranges() {
        for ip in ["100.64.0.1", "192.168.1.1", "fd00::1", "fe80::1", "::ffff:10.0.0.1", "::127.0.0.1"] {
            assert!(is_internal(&ip.parse().unwrap()), "{}", ip);
        }
        for ip in ["1.1.1.1", "2606:4700::1111"] {
            assert!(!is_internal(&ip.parse().unwrap()), "{}", ip);
        }
    }
}

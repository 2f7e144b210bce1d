use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use super::error::FetchError;

// ---------------------------------------------------------------------------
// Remote URL limits
// ---------------------------------------------------------------------------

/// Maximum accepted length of a remote URL.
pub const MAX_URL_LENGTH: usize = 2048;

/// Schemes the proxy will fetch.
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Maximum length of a DNS name.
const MAX_DOMAIN_LENGTH: usize = 253;

/// Maximum length of one DNS label.
const MAX_LABEL_LENGTH: usize = 63;

/// Host names that always refer to the local machine or network.
const LOCAL_DOMAINS: &[&str] = &["localhost", "localhost.localdomain"];

/// Suffixes reserved for local resolution.
const LOCAL_SUFFIXES: &[&str] = &[".localhost", ".local", ".internal"];

// ---------------------------------------------------------------------------
// URL filtering (lookup time, no DNS)
// ---------------------------------------------------------------------------

/// Parse and filter a remote URL.
///
/// Rejects anything that is not http(s), whose host is not a well formed
/// public DNS name, or that names an obviously local address. No DNS lookup
/// happens here; the fetch path re-checks the resolved addresses with
/// [`check_resolved_addrs`].
pub fn parse_remote_url(raw: &str) -> Result<Url, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty url".to_string());
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(format!(
            "url length {} exceeds maximum {}",
            raw.len(),
            MAX_URL_LENGTH
        ));
    }

    let url = Url::parse(raw).map_err(|e| format!("malformed url: {}", e))?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err("credentials in url are not allowed".to_string());
    }

    match url.host() {
        None => return Err("url has no host".to_string()),
        Some(Host::Domain(domain)) => validate_domain(domain)?,
        Some(Host::Ipv4(ip)) => {
            if is_blocked_ip(IpAddr::V4(ip)) {
                return Err(format!("blocked address {}", ip));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_blocked_ip(IpAddr::V6(ip)) {
                return Err(format!("blocked address {}", ip));
            }
        }
    }

    Ok(url)
}

/// Syntactic check of a DNS host name plus a TLD sanity check.
pub fn validate_domain(domain: &str) -> Result<(), String> {
    let domain = domain.strip_suffix('.').unwrap_or(domain).to_ascii_lowercase();
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LENGTH {
        return Err(format!("invalid host length: {}", domain.len()));
    }
    if LOCAL_DOMAINS.contains(&domain.as_str())
        || LOCAL_SUFFIXES.iter().any(|s| domain.ends_with(s))
    {
        return Err(format!("local host '{}'", domain));
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(format!("host '{}' has no top-level domain", domain));
    }
    for label in &labels {
        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return Err(format!("invalid label in host '{}'", domain));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("invalid label '{}' in host '{}'", label, domain));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("invalid character in host '{}'", domain));
        }
    }

    // TLD must be alphabetic (or an IDN A-label) and at least two characters.
    let tld = labels[labels.len() - 1];
    let tld_ok = if let Some(idn) = tld.strip_prefix("xn--") {
        !idn.is_empty()
    } else {
        tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
    };
    if !tld_ok {
        return Err(format!("invalid top-level domain '{}'", tld));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Blocked networks (fetch time, after DNS)
// ---------------------------------------------------------------------------

/// Whether an address belongs to a network the proxy must never contact:
/// loopback, unspecified, RFC 1918, link-local, shared (CGNAT), broadcast,
/// multicast, unique-local, and IPv4-mapped forms of all of these.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        // 0.0.0.0/8 "this network"
        || octets[0] == 0
        // 100.64.0.0/10 shared address space
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // 240.0.0.0/4 reserved
        || octets[0] >= 240
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    let segments = ip.segments();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (segments[0] & 0xffc0) == 0xfe80
        // fec0::/10 deprecated site local
        || (segments[0] & 0xffc0) == 0xfec0
}

/// Reject a host if it resolved to nothing or to any blocked address.
pub fn check_resolved_addrs(host: &str, addrs: &[IpAddr]) -> Result<(), FetchError> {
    if addrs.is_empty() || addrs.iter().any(|ip| is_blocked_ip(*ip)) {
        return Err(FetchError::InvalidHost {
            host: host.to_string(),
        });
    }
    Ok(())
}

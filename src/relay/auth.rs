//! Bearer-token authentication and the admin-only channel pin.
//!
//! A raw `Authorization` header value is expected as `Bearer <key>` (the
//! `Bearer ` prefix is optional, mirroring how existing OneAPI-style
//! gateways accept a bare key). A suffix of the form `-<channel_id>` pins
//! the request to a specific channel, but only for Admin/Root tokens;
//! a non-admin key carrying a pin suffix is rejected outright even if the
//! embedded id is syntactically valid.

use std::net::IpAddr;

use crate::error::{RelayError, Result};
use crate::types::{Role, Token, User};

pub struct AuthContext {
    pub token: Token,
    pub user: User,
    pub pinned_channel_id: Option<i64>,
}

/// Strips an optional `Bearer ` prefix and an optional admin-only
/// `-<channel_id>` pin suffix off the raw header value, returning the bare
/// key and the parsed pin (if the suffix was present and numeric).
///
/// A non-numeric suffix is treated as part of the key itself (some keys
/// legitimately contain hyphens), so only a suffix that parses cleanly as
/// `i64` is extracted as a pin.
pub fn parse_key_and_pin(raw_header: &str) -> (&str, Option<i64>) {
    let key = raw_header.strip_prefix("Bearer ").unwrap_or(raw_header).trim();

    if let Some(idx) = key.rfind('-') {
        let (prefix, suffix) = key.split_at(idx);
        let suffix = &suffix[1..];
        if let Ok(channel_id) = suffix.parse::<i64>() {
            return (prefix, Some(channel_id));
        }
    }
    (key, None)
}

/// Validates the parsed key/pin against the looked-up token and user,
/// enforcing: token enabled and not expired, user enabled, the client IP
/// against the token's subnet allowlist (if any), and the admin-only
/// restriction on channel pinning.
pub fn authorize(
    token: Token,
    user: User,
    pinned_channel_id: Option<i64>,
    client_ip: Option<IpAddr>,
    now_ts: i64,
) -> Result<AuthContext> {
    use crate::types::TokenStatus;

    if token.status != TokenStatus::Enabled {
        return Err(RelayError::Authentication("token is not enabled".to_string()));
    }
    if token.expired_time != -1 && token.expired_time < now_ts {
        return Err(RelayError::Authentication("token has expired".to_string()));
    }
    if !user.is_enabled() {
        return Err(RelayError::Authentication("user is not enabled".to_string()));
    }
    if let Some(subnets) = token.subnet.as_deref().filter(|s| !s.is_empty()) {
        match client_ip {
            Some(ip) if ip_in_subnets(ip, subnets) => {}
            Some(ip) => {
                return Err(RelayError::Permission(format!(
                    "token may only be used from subnet '{subnets}', current ip: {ip}"
                )))
            }
            None => {
                return Err(RelayError::Permission(format!(
                    "token may only be used from subnet '{subnets}'"
                )))
            }
        }
    }
    if pinned_channel_id.is_some() && user.role.rank() < Role::Admin.rank() {
        return Err(RelayError::Permission(
            "channel pinning is an admin-only feature".to_string(),
        ));
    }

    Ok(AuthContext {
        token,
        user,
        pinned_channel_id,
    })
}

/// Checks `ip` against a comma-separated list of CIDR ranges (or bare
/// IPs, treated as a /32 or /128). Mixed IPv4/IPv6 entries in the same
/// list are allowed; an entry that fails to parse is skipped rather than
/// treated as a match-everything wildcard.
fn ip_in_subnets(ip: IpAddr, subnets: &str) -> bool {
    subnets.split(',').map(str::trim).filter(|s| !s.is_empty()).any(|entry| cidr_contains(entry, ip))
}

fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    let (network_str, prefix_str) = match cidr.split_once('/') {
        Some((n, p)) => (n, Some(p)),
        None => (cidr, None),
    };
    let Ok(network) = network_str.parse::<IpAddr>() else { return false };

    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let prefix = prefix_str.and_then(|p| p.parse::<u32>().ok()).unwrap_or(32).min(32);
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let prefix = prefix_str.and_then(|p| p.parse::<u32>().ok()).unwrap_or(128).min(128);
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TokenStatus, UserStatus};

    fn sample_token() -> Token {
        Token {
            id: 1,
            user_id: 1,
            key: "sk-abc123".to_string(),
            name: "t".to_string(),
            status: TokenStatus::Enabled,
            remain_quota: 1_000,
            used_quota: 0,
            unlimited_quota: false,
            expired_time: -1,
            subnet: None,
            models: None,
        }
    }

    fn sample_user(role: Role) -> User {
        User {
            id: 1,
            username: "u".to_string(),
            wallet_address: None,
            role,
            status: UserStatus::Enabled,
            quota: 1_000,
            used_quota: 0,
            group: "default".to_string(),
            request_count: 0,
        }
    }

    #[test]
    fn parses_bearer_prefix_and_no_pin() {
        let (key, pin) = parse_key_and_pin("Bearer sk-abc123");
        assert_eq!(key, "sk-abc123");
        assert_eq!(pin, None);
    }

    #[test]
    fn parses_numeric_pin_suffix() {
        let (key, pin) = parse_key_and_pin("sk-abc123-42");
        assert_eq!(key, "sk-abc123");
        assert_eq!(pin, Some(42));
    }

    #[test]
    fn non_numeric_suffix_is_kept_as_part_of_key() {
        let (key, pin) = parse_key_and_pin("sk-abc-def");
        assert_eq!(key, "sk-abc-def");
        assert_eq!(pin, None);
    }

    #[test]
    fn non_admin_pin_is_rejected() {
        let result = authorize(sample_token(), sample_user(Role::Common), Some(7), None, 0);
        assert!(matches!(result, Err(RelayError::Permission(_))));
    }

    #[test]
    fn admin_pin_is_accepted() {
        let result = authorize(sample_token(), sample_user(Role::Admin), Some(7), None, 0);
        assert!(result.is_ok());
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut token = sample_token();
        token.expired_time = 100;
        let result = authorize(token, sample_user(Role::Common), None, None, 200);
        assert!(matches!(result, Err(RelayError::Authentication(_))));
    }

    #[test]
    fn matching_subnet_is_accepted() {
        let mut token = sample_token();
        token.subnet = Some("10.0.0.0/8,192.168.1.1".to_string());
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        let result = authorize(token, sample_user(Role::Common), None, Some(ip), 0);
        assert!(result.is_ok());
    }

    #[test]
    fn non_matching_subnet_is_rejected() {
        let mut token = sample_token();
        token.subnet = Some("10.0.0.0/8".to_string());
        let ip: IpAddr = "172.16.0.1".parse().unwrap();
        let result = authorize(token, sample_user(Role::Common), None, Some(ip), 0);
        assert!(matches!(result, Err(RelayError::Permission(_))));
    }

    #[test]
    fn missing_client_ip_is_rejected_when_subnet_restricted() {
        let mut token = sample_token();
        token.subnet = Some("10.0.0.0/8".to_string());
        let result = authorize(token, sample_user(Role::Common), None, None, 0);
        assert!(matches!(result, Err(RelayError::Permission(_))));
    }

    #[test]
    fn bare_ip_entry_matches_exactly() {
        let mut token = sample_token();
        token.subnet = Some("192.168.1.1".to_string());
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(ip_in_subnets(ip, &token.subnet.unwrap()));
        let other: IpAddr = "192.168.1.2".parse().unwrap();
        assert!(!ip_in_subnets(other, "192.168.1.1"));
    }

    #[test]
    fn no_subnet_restriction_allows_any_ip() {
        let result = authorize(sample_token(), sample_user(Role::Common), None, None, 0);
        assert!(result.is_ok());
    }
}

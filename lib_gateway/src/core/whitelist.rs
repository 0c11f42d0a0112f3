//! # IP Whitelist
//!
//! Maps a remote address to an entry that can narrow the ACL computed for a
//! connection and, optionally, force the identity it runs as.
//!
//! Keys are exact addresses, wildcard IPv4 patterns such as `192.168.1.*`, or
//! the literal `default`. Lookup prefers the exact address, then the wildcard
//! pattern with the most literal octets, then `default`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::acl::{Acl, OtherMask, PermissionMask, USER_PREFIX};

pub const DEFAULT_ENTRY: &str = "default";
pub const AUTH_USER: &str = "auth";

pub type Whitelist = BTreeMap<String, WhitelistEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistEntry {
    /// `auth` keeps the authenticated identity; anything else forces `system.user.<user>`.
    pub user: String,
    pub object: PermissionMask,
    pub state: PermissionMask,
    pub file: PermissionMask,
    pub users: PermissionMask,
    pub other: OtherMask,
}

impl Default for WhitelistEntry {
    fn default() -> Self {
        Self {
            user: AUTH_USER.to_string(),
            object: PermissionMask::default(),
            state: PermissionMask::default(),
            file: PermissionMask::default(),
            users: PermissionMask::default(),
            other: OtherMask::default(),
        }
    }
}

impl WhitelistEntry {
    pub fn forced_user(&self) -> Option<String> {
        if self.user.is_empty() || self.user == AUTH_USER {
            return None;
        }
        if self.user.starts_with(USER_PREFIX) {
            Some(self.user.clone())
        } else {
            Some(format!("{USER_PREFIX}{}", self.user))
        }
    }
}

/// Strips the IPv4-mapped IPv6 prefix and any port.
pub fn normalize_address(addr: &str) -> &str {
    let addr = addr.strip_prefix("::ffff:").unwrap_or(addr);
    match addr.rsplit_once(':') {
        // only strip a port from dotted IPv4 forms; bare IPv6 keeps its colons
        Some((host, port)) if host.contains('.') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

/// Number of literal octets when `key` is a wildcard pattern matching `addr`.
fn wildcard_specificity(key: &str, addr: &str) -> Option<usize> {
    if !key.contains('*') {
        return None;
    }
    let pattern: Vec<&str> = key.split('.').collect();
    let octets: Vec<&str> = addr.split('.').collect();
    if pattern.len() != octets.len() {
        return None;
    }
    let mut literal = 0;
    for (p, o) in pattern.iter().zip(octets.iter()) {
        if *p == "*" {
            continue;
        }
        if p != o {
            return None;
        }
        literal += 1;
    }
    Some(literal)
}

pub fn resolve_entry<'a>(whitelist: &'a Whitelist, remote_addr: &str) -> Option<&'a WhitelistEntry> {
    let addr = normalize_address(remote_addr);
    if let Some(entry) = whitelist.get(addr) {
        return Some(entry);
    }

    let mut best: Option<(usize, &WhitelistEntry)> = None;
    for (key, entry) in whitelist {
        if let Some(score) = wildcard_specificity(key, addr) {
            // strict comparison keeps the lexicographically first key on ties
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, entry));
            }
        }
    }
    if let Some((_, entry)) = best {
        return Some(entry);
    }

    whitelist.get(DEFAULT_ENTRY)
}

/// Narrows `acl` by the entry's masks. Bits the ACL lacks are never set.
pub fn downgrade(acl: &mut Acl, entry: &WhitelistEntry) {
    acl.object.narrow(&entry.object);
    acl.state.narrow(&entry.state);
    acl.file.narrow(&entry.file);
    acl.users.narrow(&entry.users);
    acl.other.narrow(&entry.other);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn whitelist() -> Whitelist {
        serde_json::from_value(json!({
            "default": {"user": "auth"},
            "192.168.1.*": {"user": "auth", "state": {"write": false}},
            "192.168.*.*": {"user": "guest"},
            "192.168.1.20": {"user": "kiosk", "object": {"write": false, "delete": false}}
        }))
        .unwrap()
    }

    #[test]
    fn exact_address_wins() {
        let wl = whitelist();
        let entry = resolve_entry(&wl, "::ffff:192.168.1.20").unwrap();
        assert_eq!(entry.forced_user().as_deref(), Some("system.user.kiosk"));
    }

    #[test]
    fn most_specific_wildcard_wins() {
        let wl = whitelist();
        let entry = resolve_entry(&wl, "192.168.1.7:50123").unwrap();
        assert_eq!(entry.state.write, Some(false));
        assert!(entry.forced_user().is_none());

        let wider = resolve_entry(&wl, "192.168.5.7").unwrap();
        assert_eq!(wider.forced_user().as_deref(), Some("system.user.guest"));
    }

    #[test]
    fn falls_back_to_default() {
        let wl = whitelist();
        let entry = resolve_entry(&wl, "10.0.0.1").unwrap();
        assert_eq!(entry, wl.get("default").unwrap());
    }

    #[test]
    fn downgrade_only_narrows() {
        let mut acl = Acl::none("system.user.x");
        acl.state.read = true;
        let entry = WhitelistEntry {
            state: PermissionMask {
                read: Some(true),
                write: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        downgrade(&mut acl, &entry);
        assert!(acl.state.read);
        assert!(!acl.state.write);

        let mut full = Acl::full("system.user.admin");
        let wl = whitelist();
        downgrade(&mut full, resolve_entry(&wl, "192.168.1.20").unwrap());
        assert!(!full.object.write);
        assert!(!full.object.delete);
        assert!(full.object.read);
    }
}

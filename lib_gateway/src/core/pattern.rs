//! Glob patterns used by subscriptions and pattern queries.
//!
//! A pattern is literal text with `*` wildcards. Each `*` matches any run of
//! characters, including `.` and `/`. A pattern without `*` is an exact match.

use std::fmt;

use regex::Regex;

#[derive(Debug, Clone)]
enum Matcher {
    Any,
    Exact,
    Glob(Regex),
}

#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    matcher: Matcher,
}

impl Pattern {
    pub fn new(raw: impl Into<String>) -> Result<Self, regex::Error> {
        let raw = raw.into();
        let matcher = if raw == "*" {
            Matcher::Any
        } else if !raw.contains('*') {
            Matcher::Exact
        } else {
            let body = raw
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            Matcher::Glob(Regex::new(&format!("^{body}$"))?)
        };
        Ok(Self { raw, matcher })
    }

    pub fn matches(&self, id: &str) -> bool {
        match &self.matcher {
            Matcher::Any => true,
            Matcher::Exact => self.raw == id,
            Matcher::Glob(re) => re.is_match(id),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_wildcard_crosses_dots() {
        let p = Pattern::new("hm-rpc.1.*").unwrap();
        assert!(p.matches("hm-rpc.1.devices.0.TEMPERATURE"));
        assert!(!Pattern::new("hm-rpc.2.*").unwrap().matches("hm-rpc.1.devices.0.TEMPERATURE"));
    }

    #[test]
    fn literals_are_escaped() {
        let p = Pattern::new("a.b*").unwrap();
        assert!(p.matches("a.bc"));
        assert!(!p.matches("aXbc"));
        let brackets = Pattern::new("x[1]+(y)*").unwrap();
        assert!(brackets.matches("x[1]+(y).z"));
    }

    #[test]
    fn inner_and_leading_wildcards() {
        let p = Pattern::new("*.STATE").unwrap();
        assert!(p.matches("hm-rpc.0.ABC.1.STATE"));
        assert!(!p.matches("hm-rpc.0.ABC.1.STATE.ack"));
        let inner = Pattern::new("system.*.alive").unwrap();
        assert!(inner.matches("system.adapter.admin.0.alive"));
    }

    #[test]
    fn exact_and_star() {
        assert!(Pattern::new("*").unwrap().matches(""));
        let exact = Pattern::new("javascript.0.x").unwrap();
        assert!(exact.matches("javascript.0.x"));
        assert!(!exact.matches("javascript.0.xy"));
    }
}

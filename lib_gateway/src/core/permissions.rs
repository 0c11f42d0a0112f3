//! # Permission Table
//!
//! Static mapping from command name to the `{kind, operation}` pair the
//! caller's [`Acl`](crate::core::acl::Acl) must grant. Commands missing from the
//! table are unguarded.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::core::acl::{Operation, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Allowed for any connection that reached dispatch.
    Unrestricted,
    Needs(ResourceKind, Operation),
}

const UNRESTRICTED: &[&str] = &[
    "authEnabled",
    "disconnect",
    "listPermissions",
    "getVersion",
    "getAdapterName",
    "name",
    "logout",
    "getRatings",
    "checkFeatureSupported",
];

const RULES: &[(ResourceKind, Operation, &[&str])] = &[
    (
        ResourceKind::Object,
        Operation::Read,
        &["getObject", "subscribeObjects", "unsubscribeObjects", "getUserPermissions"],
    ),
    (ResourceKind::Object, Operation::List, &["getObjects", "getHostByIp"]),
    (
        ResourceKind::Object,
        Operation::Write,
        &["setObject", "extendObject", "requireLog", "updateLicenses"],
    ),
    (ResourceKind::Object, Operation::Delete, &["delObject"]),
    (ResourceKind::State, Operation::List, &["getStates", "getForeignStates"]),
    (ResourceKind::State, Operation::Read, &["getState", "subscribe", "unsubscribe"]),
    (ResourceKind::State, Operation::Write, &["setState"]),
    (ResourceKind::State, Operation::Delete, &["delState"]),
    (ResourceKind::File, Operation::List, &["readDir"]),
    (
        ResourceKind::File,
        Operation::Read,
        &["readFile", "readFile64", "fileExists", "subscribeFiles", "unsubscribeFiles"],
    ),
    (ResourceKind::File, Operation::Write, &["writeFile", "writeFile64", "rename"]),
    (ResourceKind::File, Operation::Delete, &["deleteFile", "unlink"]),
    (ResourceKind::Users, Operation::Create, &["addUser", "addGroup"]),
    (ResourceKind::Users, Operation::Delete, &["delUser", "delGroup"]),
    (
        ResourceKind::Other,
        Operation::SendTo,
        &["sendTo", "sendToHost", "clientSubscribe", "clientUnsubscribe"],
    ),
    (ResourceKind::Other, Operation::Execute, &["readLogs", "eventsThreshold"]),
];

#[derive(Debug, Clone, Default)]
pub struct PermissionTable {
    rules: HashMap<String, Requirement>,
}

impl PermissionTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The rules every gateway ships with.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        for name in UNRESTRICTED {
            table.set(name, Requirement::Unrestricted);
        }
        for (kind, op, names) in RULES {
            for name in names.iter() {
                table.set(name, Requirement::Needs(*kind, *op));
            }
        }
        table
    }

    pub fn set(&mut self, name: &str, requirement: Requirement) {
        self.rules.insert(name.to_string(), requirement);
    }

    pub fn lookup(&self, name: &str) -> Option<Requirement> {
        self.rules.get(name).copied()
    }

    /// Wire shape answered by `listPermissions`: `{ command: { type, operation } }`.
    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        let mut names: Vec<&String> = self.rules.keys().collect();
        names.sort();
        for name in names {
            let entry = match self.rules[name] {
                Requirement::Unrestricted => json!({"type": "", "operation": ""}),
                Requirement::Needs(kind, op) => json!({"type": kind.as_str(), "operation": op.as_str()}),
            };
            out.insert(name.clone(), entry);
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_rules_cover_table() {
        let table = PermissionTable::standard();
        assert_eq!(
            table.lookup("setState"),
            Some(Requirement::Needs(ResourceKind::State, Operation::Write))
        );
        assert_eq!(
            table.lookup("sendToHost"),
            Some(Requirement::Needs(ResourceKind::Other, Operation::SendTo))
        );
        assert_eq!(table.lookup("getVersion"), Some(Requirement::Unrestricted));
        assert_eq!(table.lookup("changePassword"), None);
    }

    #[test]
    fn serialized_for_clients() {
        let value = PermissionTable::standard().to_value();
        assert_eq!(value["delUser"]["type"], "users");
        assert_eq!(value["delUser"]["operation"], "delete");
        assert_eq!(value["name"]["type"], "");
    }
}

//! # Subscription Registry
//!
//! Reference counts per `(kind, pattern, file pattern)` plus, for every
//! subscriber, the set of keys it holds. The count is what decides when the
//! backend must start or stop delivering a class of change; the per-subscriber
//! sets are used for matching at publish time and for cleanup on disconnect.
//!
//! The registry itself performs no I/O. Every mutation reports the upstream
//! transition it caused as an [`UpstreamChange`] and the caller forwards it to
//! the backend once the lock is released.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::acl::ResourceKind;
use crate::core::connection::ConnectionId;
use crate::core::pattern::Pattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    StateChange,
    ObjectChange,
    FileChange,
    Log,
}

impl EventKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            EventKind::StateChange => "stateChange",
            EventKind::ObjectChange => "objectChange",
            EventKind::FileChange => "fileChange",
            EventKind::Log => "log",
        }
    }

    /// The ACL section that must grant `read` for a connection to receive the event.
    pub fn resource(&self) -> Option<ResourceKind> {
        match self {
            EventKind::StateChange => Some(ResourceKind::State),
            EventKind::ObjectChange => Some(ResourceKind::Object),
            EventKind::FileChange => Some(ResourceKind::File),
            EventKind::Log => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub kind: EventKind,
    pub pattern: String,
    pub file_pattern: Option<String>,
}

impl SubscriptionKey {
    pub fn new(kind: EventKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
            file_pattern: None,
        }
    }

    pub fn file(id: impl Into<String>, file_pattern: impl Into<String>) -> Self {
        Self {
            kind: EventKind::FileChange,
            pattern: id.into(),
            file_pattern: Some(file_pattern.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscriber {
    /// The gateway process itself.
    Process,
    Connection(ConnectionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamChange {
    Start(SubscriptionKey),
    Stop(SubscriptionKey),
}

#[derive(Debug, Clone)]
struct Matcher {
    id: Pattern,
    file: Option<Pattern>,
}

impl Matcher {
    fn compile(key: &SubscriptionKey) -> Result<Self, regex::Error> {
        let file = match &key.file_pattern {
            Some(raw) => Some(Pattern::new(raw.as_str())?),
            None => None,
        };
        Ok(Self {
            id: Pattern::new(key.pattern.as_str())?,
            file,
        })
    }

    fn matches(&self, id: &str, file_name: Option<&str>) -> bool {
        if !self.id.matches(id) {
            return false;
        }
        match (&self.file, file_name) {
            (Some(pattern), Some(name)) => pattern.matches(name),
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    counts: HashMap<SubscriptionKey, usize>,
    held: HashMap<Subscriber, HashMap<SubscriptionKey, Matcher>>,
    /// connection -> instance -> message types
    instances: HashMap<ConnectionId, HashMap<String, HashSet<String>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `key` for `subscriber`. Holding the key already is a no-op.
    pub fn subscribe(
        &mut self,
        subscriber: Subscriber,
        key: SubscriptionKey,
    ) -> Result<Option<UpstreamChange>, regex::Error> {
        let held = self.held.entry(subscriber).or_default();
        if held.contains_key(&key) {
            return Ok(None);
        }
        let matcher = Matcher::compile(&key)?;
        held.insert(key.clone(), matcher);

        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            Ok(Some(UpstreamChange::Start(key)))
        } else {
            Ok(None)
        }
    }

    pub fn unsubscribe(&mut self, subscriber: Subscriber, key: &SubscriptionKey) -> Option<UpstreamChange> {
        let held = self.held.get_mut(&subscriber)?;
        held.remove(key)?;
        if held.is_empty() {
            self.held.remove(&subscriber);
        }
        self.release(key)
    }

    /// Drops every key `subscriber` holds, along with its instance subscriptions.
    pub fn unsubscribe_all(&mut self, subscriber: Subscriber) -> Vec<UpstreamChange> {
        if let Subscriber::Connection(id) = subscriber {
            self.instances.remove(&id);
        }
        let held = match self.held.remove(&subscriber) {
            Some(held) => held,
            None => return Vec::new(),
        };
        held.into_keys().filter_map(|key| self.release(&key)).collect()
    }

    fn release(&mut self, key: &SubscriptionKey) -> Option<UpstreamChange> {
        let count = self.counts.get_mut(key)?;
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.counts.remove(key);
            Some(UpstreamChange::Stop(key.clone()))
        } else {
            None
        }
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Keys of `kind` with a positive count.
    pub fn patterns(&self, kind: EventKind) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self.counts.keys().filter(|k| k.kind == kind).cloned().collect();
        keys.sort_by(|a, b| a.pattern.cmp(&b.pattern).then(a.file_pattern.cmp(&b.file_pattern)));
        keys
    }

    pub fn holds(&self, subscriber: Subscriber, key: &SubscriptionKey) -> bool {
        self.held.get(&subscriber).is_some_and(|held| held.contains_key(key))
    }

    /// Connections holding at least one key of `kind` that matches `id` (and
    /// `file_name` for file changes).
    pub fn interested(&self, kind: EventKind, id: &str, file_name: Option<&str>) -> Vec<ConnectionId> {
        let mut out: Vec<ConnectionId> = self
            .held
            .iter()
            .filter_map(|(subscriber, held)| match subscriber {
                Subscriber::Connection(conn) => held
                    .iter()
                    .any(|(key, matcher)| key.kind == kind && matcher.matches(id, file_name))
                    .then_some(*conn),
                Subscriber::Process => None,
            })
            .collect();
        out.sort_unstable();
        out
    }

    pub fn subscribe_instance(&mut self, conn: ConnectionId, instance: &str, message_type: &str) {
        self.instances
            .entry(conn)
            .or_default()
            .entry(instance.to_string())
            .or_default()
            .insert(message_type.to_string());
    }

    /// Removes one message type, or every type of `instance` when `message_type` is `None`.
    pub fn unsubscribe_instance(&mut self, conn: ConnectionId, instance: &str, message_type: Option<&str>) {
        let Some(by_instance) = self.instances.get_mut(&conn) else {
            return;
        };
        match message_type {
            Some(t) => {
                if let Some(types) = by_instance.get_mut(instance) {
                    types.remove(t);
                    if types.is_empty() {
                        by_instance.remove(instance);
                    }
                }
            }
            None => {
                by_instance.remove(instance);
            }
        }
        if by_instance.is_empty() {
            self.instances.remove(&conn);
        }
    }

    pub fn instance_listeners(&self, instance: &str, message_type: &str) -> Vec<ConnectionId> {
        let mut out: Vec<ConnectionId> = self
            .instances
            .iter()
            .filter(|(_, by_instance)| {
                by_instance
                    .get(instance)
                    .is_some_and(|types| types.contains(message_type))
            })
            .map(|(conn, _)| *conn)
            .collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(p: &str) -> SubscriptionKey {
        SubscriptionKey::new(EventKind::StateChange, p)
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_count() {
        let mut reg = SubscriptionRegistry::new();
        let key = state("hm-rpc.1.*");
        reg.subscribe(Subscriber::Connection(1), key.clone()).unwrap();
        let before = reg.ref_count(&key);

        reg.subscribe(Subscriber::Connection(2), key.clone()).unwrap();
        reg.unsubscribe(Subscriber::Connection(2), &key);
        assert_eq!(reg.ref_count(&key), before);
    }

    #[test]
    fn first_and_last_subscriber_drive_upstream() {
        let mut reg = SubscriptionRegistry::new();
        let key = state("a.*");
        assert_eq!(
            reg.subscribe(Subscriber::Connection(1), key.clone()).unwrap(),
            Some(UpstreamChange::Start(key.clone()))
        );
        assert_eq!(reg.subscribe(Subscriber::Connection(2), key.clone()).unwrap(), None);
        assert_eq!(reg.unsubscribe(Subscriber::Connection(1), &key), None);
        assert_eq!(
            reg.unsubscribe(Subscriber::Connection(2), &key),
            Some(UpstreamChange::Stop(key.clone()))
        );
        assert!(reg.patterns(EventKind::StateChange).is_empty());
    }

    #[test]
    fn duplicate_subscribe_and_stray_unsubscribe_are_noops() {
        let mut reg = SubscriptionRegistry::new();
        let key = state("a.*");
        reg.subscribe(Subscriber::Connection(1), key.clone()).unwrap();
        reg.subscribe(Subscriber::Connection(1), key.clone()).unwrap();
        assert_eq!(reg.ref_count(&key), 1);
        assert_eq!(reg.unsubscribe(Subscriber::Connection(9), &key), None);
        assert_eq!(reg.ref_count(&key), 1);
    }

    #[test]
    fn disconnect_of_all_subscribers_removes_entry() {
        let mut reg = SubscriptionRegistry::new();
        let key = state("x.*");
        for conn in 1..=5 {
            reg.subscribe(Subscriber::Connection(conn), key.clone()).unwrap();
            reg.subscribe(Subscriber::Connection(conn), state(&format!("own.{conn}"))).unwrap();
        }
        assert_eq!(reg.ref_count(&key), 5);

        let mut stops = Vec::new();
        for conn in 1..=5 {
            stops.extend(reg.unsubscribe_all(Subscriber::Connection(conn)));
        }
        assert_eq!(reg.ref_count(&key), 0);
        assert!(reg.patterns(EventKind::StateChange).is_empty());
        assert_eq!(stops.len(), 6);
        assert!(stops.contains(&UpstreamChange::Stop(key)));
    }

    #[test]
    fn interested_matches_kind_and_glob() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(Subscriber::Connection(1), state("hm-rpc.1.*")).unwrap();
        reg.subscribe(Subscriber::Connection(2), state("hm-rpc.2.*")).unwrap();
        reg.subscribe(
            Subscriber::Connection(3),
            SubscriptionKey::new(EventKind::ObjectChange, "*"),
        )
        .unwrap();
        reg.subscribe(Subscriber::Process, state("*")).unwrap();

        let hits = reg.interested(EventKind::StateChange, "hm-rpc.1.devices.0.TEMPERATURE", None);
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn file_keys_match_both_levels() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(Subscriber::Connection(1), SubscriptionKey::file("vis.0", "main/*.json"))
            .unwrap();
        assert_eq!(
            reg.interested(EventKind::FileChange, "vis.0", Some("main/views.json")),
            vec![1]
        );
        assert!(reg
            .interested(EventKind::FileChange, "vis.0", Some("main/img.png"))
            .is_empty());
        assert!(reg
            .interested(EventKind::FileChange, "vis.1", Some("main/views.json"))
            .is_empty());
    }

    #[test]
    fn instance_subscriptions_are_per_connection() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe_instance(1, "cameras.0", "newImage");
        reg.subscribe_instance(2, "cameras.0", "newImage");
        reg.subscribe_instance(2, "cameras.0", "motion");
        assert_eq!(reg.instance_listeners("cameras.0", "newImage"), vec![1, 2]);

        reg.unsubscribe_instance(2, "cameras.0", Some("newImage"));
        assert_eq!(reg.instance_listeners("cameras.0", "newImage"), vec![1]);
        assert_eq!(reg.instance_listeners("cameras.0", "motion"), vec![2]);

        reg.unsubscribe_all(Subscriber::Connection(2));
        assert!(reg.instance_listeners("cameras.0", "motion").is_empty());
    }
}

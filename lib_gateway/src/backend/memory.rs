//! In-memory [`Backend`] and [`SessionStore`].
//!
//! Good enough to run the development server and to drive every scenario in
//! the test suite: it computes ACLs from group objects, only raises change
//! events for patterns somebody subscribed upstream, records every upstream
//! subscribe/unsubscribe call, and answers host commands from a script.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::backend::{
    Backend, BackendError, BackendEvent, CallOptions, FileData, FileEntry, SessionRecord, SessionStore,
};
use crate::core::acl::{Acl, ADMIN_GROUP, GROUP_PREFIX, SUPER_USER};
use crate::core::pattern::Pattern;
use crate::core::registry::EventKind;

/// Initial contents, as read from a seed file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub objects: BTreeMap<String, Value>,
    pub states: BTreeMap<String, Value>,
    pub sessions: BTreeMap<String, SessionRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamCall {
    pub action: UpstreamAction,
    pub kind: EventKind,
    pub pattern: String,
    pub file_pattern: Option<String>,
}

#[derive(Debug, Clone)]
struct ScriptedReply {
    reply: Result<Value, BackendError>,
    delay: Option<Duration>,
}

type UpstreamKey = (EventKind, String, Option<String>);

/// An upstream subscription with its patterns compiled once.
#[derive(Debug)]
struct UpstreamEntry {
    count: usize,
    pattern: Pattern,
    file_pattern: Option<Pattern>,
}

impl UpstreamEntry {
    fn delivers(&self, id: &str, file_name: Option<&str>) -> bool {
        let file_match = match (&self.file_pattern, file_name) {
            (Some(fp), Some(name)) => fp.matches(name),
            _ => true,
        };
        self.pattern.matches(id) && file_match
    }
}

#[derive(Debug, Default)]
struct Store {
    objects: BTreeMap<String, Value>,
    states: BTreeMap<String, Value>,
    files: HashMap<String, BTreeMap<String, Vec<u8>>>,
    passwords: HashMap<String, String>,
    upstream: HashMap<UpstreamKey, UpstreamEntry>,
    upstream_log: Vec<UpstreamCall>,
    scripts: HashMap<(String, String), ScriptedReply>,
    host_calls: HashMap<(String, String), usize>,
}

pub struct MemoryBackend {
    store: Mutex<Store>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendEvent>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn mime_type(name: &str) -> Option<String> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "json" => "application/json",
        "js" => "application/javascript",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "txt" | "log" => "text/plain",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        _ => return None,
    };
    Some(mime.to_string())
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store: Mutex::new(Store::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn with_seed(seed: Seed) -> Self {
        let backend = Self::new();
        {
            let mut store = backend.store.lock();
            store.objects = seed.objects;
            store.states = seed.states;
        }
        backend
    }

    /// The change-event stream. Can be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BackendEvent>> {
        self.events_rx.lock().take()
    }

    pub fn insert_object(&self, id: &str, obj: Value) {
        self.store.lock().objects.insert(id.to_string(), obj);
    }

    pub fn object(&self, id: &str) -> Option<Value> {
        self.store.lock().objects.get(id).cloned()
    }

    pub fn insert_state(&self, id: &str, state: Value) {
        self.store.lock().states.insert(id.to_string(), state);
    }

    pub fn insert_file(&self, id: &str, name: &str, data: impl Into<Vec<u8>>) {
        self.store
            .lock()
            .files
            .entry(id.to_string())
            .or_default()
            .insert(name.to_string(), data.into());
    }

    pub fn password(&self, user: &str) -> Option<String> {
        self.store.lock().passwords.get(user).cloned()
    }

    /// Answers `command` sent to `target` (a host or an instance) with `reply`.
    pub fn script_reply(
        &self,
        target: &str,
        command: &str,
        reply: Result<Value, BackendError>,
        delay: Option<Duration>,
    ) {
        self.store
            .lock()
            .scripts
            .insert((target.to_string(), command.to_string()), ScriptedReply { reply, delay });
    }

    pub fn host_calls(&self, host: &str, command: &str) -> usize {
        self.store
            .lock()
            .host_calls
            .get(&(host.to_string(), command.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn upstream_log(&self) -> Vec<UpstreamCall> {
        self.store.lock().upstream_log.clone()
    }

    /// Patterns of `kind` the backend currently delivers.
    pub fn upstream_patterns(&self, kind: EventKind) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .store
            .lock()
            .upstream
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, p, _)| p.clone())
            .collect();
        patterns.sort();
        patterns
    }

    /// Raises a log entry if log delivery is on.
    pub fn push_log(&self, entry: Value) {
        if self.is_delivered(EventKind::Log, "", None) {
            let _ = self.events_tx.send(BackendEvent::Log(entry));
        }
    }

    fn is_delivered(&self, kind: EventKind, id: &str, file_name: Option<&str>) -> bool {
        let store = self.store.lock();
        store
            .upstream
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .any(|(_, entry)| kind == EventKind::Log || entry.delivers(id, file_name))
    }

    fn raise(&self, event: BackendEvent) {
        let (kind, id, file_name) = match &event {
            BackendEvent::StateChange { id, .. } => (EventKind::StateChange, id.as_str(), None),
            BackendEvent::ObjectChange { id, .. } => (EventKind::ObjectChange, id.as_str(), None),
            BackendEvent::FileChange { id, file_name, .. } => {
                (EventKind::FileChange, id.as_str(), Some(file_name.as_str()))
            }
            BackendEvent::Log(_) => (EventKind::Log, "", None),
        };
        if self.is_delivered(kind, id, file_name) {
            let _ = self.events_tx.send(event);
        }
    }

    fn list_matching(map: &BTreeMap<String, Value>, pattern: &str) -> Result<BTreeMap<String, Value>, BackendError> {
        let pattern = Pattern::new(pattern).map_err(|e| BackendError::Failure(e.to_string()))?;
        Ok(map
            .iter()
            .filter(|(id, _)| pattern.matches(id))
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect())
    }
}

/// ORs the permission sections of a group's `common.acl` into `acl`.
fn merge_group_acl(acl: &mut Acl, group_acl: &Value) {
    if let Ok(parsed) = serde_json::from_value::<Acl>(group_acl.clone()) {
        acl.object.union(&parsed.object);
        acl.state.union(&parsed.state);
        acl.file.union(&parsed.file);
        acl.users.union(&parsed.users);
        acl.other.union(&parsed.other);
    }
}

fn is_member(group: &Value, user: &str) -> bool {
    group
        .pointer("/common/members")
        .and_then(Value::as_array)
        .is_some_and(|members| members.iter().any(|m| m.as_str() == Some(user)))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn calculate_acl(&self, user: &str) -> Result<Acl, BackendError> {
        let store = self.store.lock();
        let groups: Vec<(&String, &Value)> = store
            .objects
            .range(GROUP_PREFIX.to_string()..)
            .take_while(|(id, _)| id.starts_with(GROUP_PREFIX))
            .filter(|(_, group)| is_member(group, user))
            .collect();
        let group_ids: Vec<String> = groups.iter().map(|(id, _)| (*id).clone()).collect();

        if user == SUPER_USER || group_ids.iter().any(|g| g == ADMIN_GROUP) {
            let mut acl = Acl::full(user);
            acl.groups = group_ids;
            return Ok(acl);
        }

        let mut acl = Acl::none(user);
        for (_, group) in &groups {
            if let Some(group_acl) = group.pointer("/common/acl") {
                merge_group_acl(&mut acl, group_acl);
            }
        }
        acl.groups = group_ids;
        Ok(acl)
    }

    async fn subscribe(&self, kind: EventKind, pattern: &str, file_pattern: Option<&str>) -> Result<(), BackendError> {
        let mut store = self.store.lock();
        store.upstream_log.push(UpstreamCall {
            action: UpstreamAction::Subscribe,
            kind,
            pattern: pattern.to_string(),
            file_pattern: file_pattern.map(str::to_string),
        });
        let key = (kind, pattern.to_string(), file_pattern.map(str::to_string));
        if let Some(entry) = store.upstream.get_mut(&key) {
            entry.count += 1;
            return Ok(());
        }
        let compile = |raw: &str| Pattern::new(raw).map_err(|e| BackendError::Failure(e.to_string()));
        let entry = UpstreamEntry {
            count: 1,
            pattern: compile(pattern)?,
            file_pattern: file_pattern.map(compile).transpose()?,
        };
        store.upstream.insert(key, entry);
        Ok(())
    }

    async fn unsubscribe(&self, kind: EventKind, pattern: &str, file_pattern: Option<&str>) -> Result<(), BackendError> {
        let mut store = self.store.lock();
        store.upstream_log.push(UpstreamCall {
            action: UpstreamAction::Unsubscribe,
            kind,
            pattern: pattern.to_string(),
            file_pattern: file_pattern.map(str::to_string),
        });
        let key = (kind, pattern.to_string(), file_pattern.map(str::to_string));
        if let Some(entry) = store.upstream.get_mut(&key) {
            entry.count -= 1;
            if entry.count == 0 {
                store.upstream.remove(&key);
            }
        }
        Ok(())
    }

    async fn get_object(&self, id: &str, _opts: &CallOptions) -> Result<Option<Value>, BackendError> {
        Ok(self.store.lock().objects.get(id).cloned())
    }

    async fn get_objects(&self, pattern: &str, _opts: &CallOptions) -> Result<BTreeMap<String, Value>, BackendError> {
        Self::list_matching(&self.store.lock().objects, pattern)
    }

    async fn set_object(&self, id: &str, obj: Value, _opts: &CallOptions) -> Result<(), BackendError> {
        self.store.lock().objects.insert(id.to_string(), obj.clone());
        self.raise(BackendEvent::ObjectChange {
            id: id.to_string(),
            obj: Some(obj),
        });
        Ok(())
    }

    async fn del_object(&self, id: &str, _opts: &CallOptions) -> Result<(), BackendError> {
        if self.store.lock().objects.remove(id).is_none() {
            return Err(BackendError::NotFound(format!("Object {id} not found")));
        }
        self.raise(BackendEvent::ObjectChange {
            id: id.to_string(),
            obj: None,
        });
        Ok(())
    }

    async fn get_state(&self, id: &str, _opts: &CallOptions) -> Result<Option<Value>, BackendError> {
        Ok(self.store.lock().states.get(id).cloned())
    }

    async fn get_states(&self, pattern: &str, _opts: &CallOptions) -> Result<BTreeMap<String, Value>, BackendError> {
        Self::list_matching(&self.store.lock().states, pattern)
    }

    async fn set_state(&self, id: &str, state: Value, _opts: &CallOptions) -> Result<(), BackendError> {
        self.store.lock().states.insert(id.to_string(), state.clone());
        self.raise(BackendEvent::StateChange {
            id: id.to_string(),
            state: Some(state),
        });
        Ok(())
    }

    async fn del_state(&self, id: &str, _opts: &CallOptions) -> Result<(), BackendError> {
        self.store.lock().states.remove(id);
        self.raise(BackendEvent::StateChange {
            id: id.to_string(),
            state: None,
        });
        Ok(())
    }

    async fn read_dir(&self, id: &str, path: &str, _opts: &CallOptions) -> Result<Vec<FileEntry>, BackendError> {
        let store = self.store.lock();
        let files = store
            .files
            .get(id)
            .ok_or_else(|| BackendError::NotFound(format!("{id} not exists")))?;
        let prefix = match path.trim_matches('/') {
            "" => String::new(),
            p => format!("{p}/"),
        };

        let mut entries: BTreeMap<String, FileEntry> = BTreeMap::new();
        for (name, data) in files.range(prefix.clone()..) {
            let Some(rest) = name.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    entries.entry(dir.to_string()).or_insert_with(|| FileEntry {
                        file: dir.to_string(),
                        is_dir: true,
                        size: 0,
                        modified_at: None,
                    });
                }
                None => {
                    entries.insert(
                        rest.to_string(),
                        FileEntry {
                            file: rest.to_string(),
                            is_dir: false,
                            size: data.len() as u64,
                            modified_at: None,
                        },
                    );
                }
            }
        }
        Ok(entries.into_values().collect())
    }

    async fn read_file(&self, id: &str, name: &str, _opts: &CallOptions) -> Result<FileData, BackendError> {
        let store = self.store.lock();
        let data = store
            .files
            .get(id)
            .and_then(|files| files.get(name.trim_start_matches('/')))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("Not exists: {id}/{name}")))?;
        Ok(FileData {
            data,
            mime_type: mime_type(name),
        })
    }

    async fn write_file(&self, id: &str, name: &str, data: Vec<u8>, _opts: &CallOptions) -> Result<(), BackendError> {
        let name = name.trim_start_matches('/').to_string();
        let size = data.len() as u64;
        self.insert_file(id, &name, data);
        self.raise(BackendEvent::FileChange {
            id: id.to_string(),
            file_name: name,
            size: Some(size),
        });
        Ok(())
    }

    async fn delete_file(&self, id: &str, name: &str, _opts: &CallOptions) -> Result<(), BackendError> {
        let name = name.trim_start_matches('/').to_string();
        let removed = self
            .store
            .lock()
            .files
            .get_mut(id)
            .and_then(|files| files.remove(&name));
        if removed.is_none() {
            return Err(BackendError::NotFound(format!("Not exists: {id}/{name}")));
        }
        self.raise(BackendEvent::FileChange {
            id: id.to_string(),
            file_name: name,
            size: None,
        });
        Ok(())
    }

    async fn rename_file(&self, id: &str, old_name: &str, new_name: &str, _opts: &CallOptions) -> Result<(), BackendError> {
        let old_name = old_name.trim_start_matches('/');
        let new_name = new_name.trim_start_matches('/');
        let mut store = self.store.lock();
        let files = store
            .files
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("{id} not exists")))?;
        let data = files
            .remove(old_name)
            .ok_or_else(|| BackendError::NotFound(format!("Not exists: {id}/{old_name}")))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    async fn file_exists(&self, id: &str, name: &str, _opts: &CallOptions) -> Result<bool, BackendError> {
        Ok(self
            .store
            .lock()
            .files
            .get(id)
            .is_some_and(|files| files.contains_key(name.trim_start_matches('/'))))
    }

    async fn send_to(&self, instance: &str, command: &str, _message: Value) -> Result<Value, BackendError> {
        let script = self
            .store
            .lock()
            .scripts
            .get(&(instance.to_string(), command.to_string()))
            .cloned();
        play(script, instance).await
    }

    async fn send_to_host(&self, host: &str, command: &str, _message: Option<Value>) -> Result<Value, BackendError> {
        let script = {
            let mut store = self.store.lock();
            *store
                .host_calls
                .entry((host.to_string(), command.to_string()))
                .or_insert(0) += 1;
            store.scripts.get(&(host.to_string(), command.to_string())).cloned()
        };
        play(script, host).await
    }

    async fn set_password(&self, user: &str, password: &str) -> Result<(), BackendError> {
        let mut store = self.store.lock();
        if !store.objects.contains_key(user) {
            return Err(BackendError::NotFound(format!("User {user} does not exist")));
        }
        store.passwords.insert(user.to_string(), password.to_string());
        Ok(())
    }
}

async fn play(script: Option<ScriptedReply>, target: &str) -> Result<Value, BackendError> {
    let Some(script) = script else {
        return Err(BackendError::NotFound(format!("{target} is not alive")));
    };
    if let Some(delay) = script.delay {
        tokio::time::sleep(delay).await;
    }
    script.reply
}

#[derive(Debug, Default)]
struct SessionTable {
    records: HashMap<String, SessionRecord>,
    touches: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<SessionTable>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: BTreeMap<String, SessionRecord>) -> Self {
        let store = Self::new();
        store.inner.lock().records.extend(records);
        store
    }

    pub fn insert(&self, key: &str, record: SessionRecord) {
        self.inner.lock().records.insert(key.to_string(), record);
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().records.remove(key);
    }

    /// How many times `key` was touched.
    pub fn touches(&self, key: &str) -> usize {
        self.inner.lock().touches.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<SessionRecord>, BackendError> {
        Ok(self.inner.lock().records.get(key).cloned())
    }

    async fn touch(&self, key: &str, _ttl: Duration) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        if !inner.records.contains_key(key) {
            return Err(BackendError::NotFound(key.to_string()));
        }
        *inner.touches.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn destroy(&self, key: &str) -> Result<(), BackendError> {
        self.inner.lock().records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts() -> CallOptions {
        CallOptions::system()
    }

    #[tokio::test]
    async fn acl_is_union_of_group_acls() {
        let backend = MemoryBackend::new();
        backend.insert_object(
            "system.group.user",
            json!({"common": {"members": ["system.user.bob"], "acl": {
                "state": {"list": true, "read": true},
                "other": {"sendto": true}
            }}}),
        );
        backend.insert_object(
            "system.group.writer",
            json!({"common": {"members": ["system.user.bob"], "acl": {"state": {"write": true}}}}),
        );

        let acl = backend.calculate_acl("system.user.bob").await.unwrap();
        assert!(acl.state.read && acl.state.write);
        assert!(!acl.state.delete);
        assert!(acl.other.sendto);
        assert_eq!(acl.groups, vec!["system.group.user", "system.group.writer"]);

        let admin = backend.calculate_acl(SUPER_USER).await.unwrap();
        assert!(admin.users.delete);
    }

    #[tokio::test]
    async fn events_only_flow_for_upstream_patterns() {
        let backend = MemoryBackend::new();
        let mut events = backend.take_events().unwrap();
        backend.set_state("a.0.x", json!({"val": 1}), &opts()).await.unwrap();
        assert!(events.try_recv().is_err());

        backend.subscribe(EventKind::StateChange, "a.0.*", None).await.unwrap();
        backend.set_state("a.0.x", json!({"val": 2}), &opts()).await.unwrap();
        assert!(matches!(events.try_recv().unwrap(), BackendEvent::StateChange { id, .. } if id == "a.0.x"));

        backend.unsubscribe(EventKind::StateChange, "a.0.*", None).await.unwrap();
        assert!(backend.upstream_patterns(EventKind::StateChange).is_empty());
        assert_eq!(backend.upstream_log().len(), 2);
    }

    #[tokio::test]
    async fn file_events_need_both_patterns_to_match() {
        let backend = MemoryBackend::new();
        let mut events = backend.take_events().unwrap();
        backend.subscribe(EventKind::FileChange, "vis.*", Some("*.json")).await.unwrap();
        backend.subscribe(EventKind::FileChange, "vis.*", Some("*.json")).await.unwrap();

        backend.write_file("vis.0", "main/img.png", vec![1], &opts()).await.unwrap();
        assert!(events.try_recv().is_err());
        backend.write_file("vis.0", "main/views.json", b"{}".to_vec(), &opts()).await.unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            BackendEvent::FileChange { file_name, .. } if file_name == "main/views.json"
        ));

        // two subscribers, one entry
        backend.unsubscribe(EventKind::FileChange, "vis.*", Some("*.json")).await.unwrap();
        assert_eq!(backend.upstream_patterns(EventKind::FileChange), vec!["vis.*"]);
        backend.unsubscribe(EventKind::FileChange, "vis.*", Some("*.json")).await.unwrap();
        assert!(backend.upstream_patterns(EventKind::FileChange).is_empty());
    }

    #[tokio::test]
    async fn read_dir_lists_one_level() {
        let backend = MemoryBackend::new();
        backend.insert_file("vis.0", "main/views.json", "{}");
        backend.insert_file("vis.0", "main/img/a.png", vec![1, 2, 3]);
        backend.insert_file("vis.0", "other.txt", "x");

        let root = backend.read_dir("vis.0", "/", &opts()).await.unwrap();
        let names: Vec<&str> = root.iter().map(|e| e.file.as_str()).collect();
        assert_eq!(names, vec!["main", "other.txt"]);

        let main = backend.read_dir("vis.0", "main", &opts()).await.unwrap();
        assert_eq!(main.len(), 2);
        assert!(main.iter().any(|e| e.file == "img" && e.is_dir));

        let file = backend.read_file("vis.0", "/main/views.json", &opts()).await.unwrap();
        assert_eq!(file.mime_type.as_deref(), Some("application/json"));
    }
}

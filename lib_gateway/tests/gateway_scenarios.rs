//! End-to-end scenarios driven through the transport entry points of a
//! [`Router`] backed by the in-memory backend and session store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use lib_gateway::backend::{BackendCommand, MemoryBackend, MemorySessionStore, Seed, SessionRecord};
use lib_gateway::core::{
    handler, CommandContext, ConnectRequest, ConnectionId, Credential, EventKind, Outbound, SubscriptionKey,
};
use lib_gateway::{GatewayError, GatewaySettings, Router};

struct Harness {
    router: Arc<Router>,
    backend: Arc<MemoryBackend>,
}

fn seed() -> Seed {
    let mut objects = BTreeMap::new();
    objects.insert(
        "system.user.admin".to_string(),
        json!({"type": "user", "common": {"name": "admin", "enabled": true, "dontDelete": true}}),
    );
    objects.insert(
        "system.user.alice".to_string(),
        json!({"type": "user", "common": {"name": "alice", "enabled": true}}),
    );
    objects.insert(
        "system.user.bob".to_string(),
        json!({"type": "user", "common": {"name": "bob", "enabled": true}}),
    );
    objects.insert(
        "system.group.administrator".to_string(),
        json!({"type": "group", "common": {"name": "administrator", "dontDelete": true, "members": ["system.user.admin"]}}),
    );
    objects.insert(
        "system.group.viewers".to_string(),
        json!({"type": "group", "common": {
            "name": "viewers",
            "members": ["system.user.alice"],
            "acl": {
                "object": {"list": true, "read": true},
                "state": {"list": true, "read": true},
                "file": {"list": true, "read": true},
            }
        }}),
    );
    Seed {
        objects,
        ..Default::default()
    }
}

fn harness(settings: GatewaySettings) -> Harness {
    let backend = Arc::new(MemoryBackend::with_seed(seed()));
    let store = Arc::new(MemorySessionStore::new());
    for user in ["admin", "alice", "bob"] {
        store.insert(
            &format!("sid-{user}"),
            SessionRecord {
                user: user.to_string(),
                expires_at_ms: None,
            },
        );
    }
    let router = Router::builder(settings, backend.clone(), store).admin().build();
    Harness { router, backend }
}

fn auth_settings() -> GatewaySettings {
    GatewaySettings {
        auth: true,
        ..Default::default()
    }
}

async fn connect_as(router: &Router, user: &str) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = router
        .handle_connect(ConnectRequest::new(Credential::Session(format!("sid-{user}"))), tx)
        .await;
    (id, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn emitted(events: &[Outbound], name: &str) -> Vec<Vec<Value>> {
    events
        .iter()
        .filter_map(|msg| match msg {
            Outbound::Emit { event, args } if event == name => Some(args.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn unauthenticated_connection_is_told_to_reauthenticate_and_closed() {
    let h = harness(auth_settings());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = h
        .router
        .handle_connect(ConnectRequest::new(Credential::Anonymous).from_addr("10.0.0.7"), tx)
        .await;

    let out = drain(&mut rx);
    assert_eq!(
        out,
        vec![
            Outbound::Emit {
                event: "reauthenticate".into(),
                args: vec![]
            },
            Outbound::Close
        ]
    );
    assert!(h.router.connection(id).is_none());
    assert_eq!(h.router.connection_count(), 0);
}

#[tokio::test]
async fn unknown_session_is_rejected_but_kept_when_transport_cannot_close() {
    let h = harness(GatewaySettings {
        no_disconnect: true,
        ..auth_settings()
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = h
        .router
        .handle_connect(ConnectRequest::new(Credential::Session("sid-nobody".into())), tx)
        .await;

    let out = drain(&mut rx);
    assert_eq!(emitted(&out, "reauthenticate").len(), 1);
    assert!(!out.contains(&Outbound::Close));
    let reply = h.router.handle_message(id, "getVersion", vec![]).await;
    assert_eq!(reply.error.as_deref(), Some("reauthenticate"));
}

#[tokio::test]
async fn add_user_conflicts_and_system_user_is_protected() {
    let h = harness(GatewaySettings::default());
    let (admin, _rx) = connect_as(&h.router, "admin").await;

    let first = h
        .router
        .handle_message(admin, "addUser", vec![json!("benjamin"), json!("pw")])
        .await;
    assert!(first.is_ok(), "{first:?}");
    assert_eq!(h.backend.password("system.user.benjamin").as_deref(), Some("pw"));

    let second = h
        .router
        .handle_message(admin, "addUser", vec![json!("benjamin"), json!("pw")])
        .await;
    assert_eq!(second.error.as_deref(), Some("User \"benjamin\" already exists"));

    let protected = h.router.handle_message(admin, "delUser", vec![json!("admin")]).await;
    assert_eq!(protected.error.as_deref(), Some("User \"admin\" cannot be deleted"));
    assert!(h.backend.object("system.user.admin").is_some());
}

#[tokio::test]
async fn deleting_a_user_removes_group_membership() {
    let h = harness(GatewaySettings::default());
    let (admin, _rx) = connect_as(&h.router, "admin").await;

    let reply = h.router.handle_message(admin, "delUser", vec![json!("alice")]).await;
    assert!(reply.is_ok(), "{reply:?}");
    assert!(h.backend.object("system.user.alice").is_none());
    let viewers = h.backend.object("system.group.viewers").unwrap();
    assert_eq!(viewers["common"]["members"], json!([]));

    let missing = h.router.handle_message(admin, "delUser", vec![json!("alice")]).await;
    assert_eq!(missing.error.as_deref(), Some("User \"alice\" does not exist"));
}

#[tokio::test]
async fn denied_command_never_reaches_its_handler() {
    let h = harness(auth_settings());
    let (bob, _rx) = connect_as(&h.router, "bob").await;
    let key = SubscriptionKey::new(EventKind::StateChange, "hm-rpc.*");

    let reply = h.router.handle_message(bob, "subscribe", vec![json!("hm-rpc.*")]).await;
    assert_eq!(reply.into_args(), vec![json!("permissionError")]);
    assert_eq!(h.router.ref_count(&key), 0);
    assert!(h.backend.upstream_log().is_empty());
}

#[tokio::test]
async fn state_events_reach_only_permitted_subscribers() {
    let h = harness(auth_settings());
    let (alice, mut rx_alice) = connect_as(&h.router, "alice").await;
    let (bob, mut rx_bob) = connect_as(&h.router, "bob").await;

    let reply = h.router.handle_message(alice, "subscribe", vec![json!("hm-rpc.*")]).await;
    assert!(reply.is_ok());
    // bob holds the key without the right to read what it matches
    h.router
        .subscribe(Some(bob), SubscriptionKey::new(EventKind::StateChange, "hm-rpc.*"))
        .await
        .unwrap();

    assert!(h.router.state_change("hm-rpc.0.temp", Some(json!({"val": 21.5, "ack": true}))));
    assert_eq!(
        emitted(&drain(&mut rx_alice), "stateChange"),
        vec![vec![json!("hm-rpc.0.temp"), json!({"val": 21.5, "ack": true})]]
    );
    assert!(drain(&mut rx_bob).is_empty());
}

#[tokio::test]
async fn object_events_honour_the_object_acl() {
    let h = harness(auth_settings());
    let (admin, mut rx_admin) = connect_as(&h.router, "admin").await;
    let (alice, mut rx_alice) = connect_as(&h.router, "alice").await;
    for conn in [admin, alice] {
        let reply = h.router.handle_message(conn, "subscribeObjects", vec![json!("secret.*")]).await;
        assert!(reply.is_ok());
    }

    let obj = json!({
        "type": "state",
        "common": {"name": "vault"},
        "acl": {"owner": "system.user.admin", "ownerGroup": "system.group.administrator", "object": 0x600}
    });
    assert!(h.router.object_change("secret.vault", Some(obj)));
    assert_eq!(emitted(&drain(&mut rx_admin), "objectChange").len(), 1);
    assert!(drain(&mut rx_alice).is_empty());
}

#[tokio::test]
async fn disconnect_releases_upstream_interest() {
    let h = harness(auth_settings());
    let (alice, _rx) = connect_as(&h.router, "alice").await;
    h.router
        .handle_message(alice, "subscribe", vec![json!(["a.*", "b.*"])])
        .await;
    h.router
        .handle_message(alice, "subscribeFiles", vec![json!("vis.0"), json!("*.json")])
        .await;
    assert_eq!(h.backend.upstream_patterns(EventKind::StateChange), vec!["a.*", "b.*"]);
    assert_eq!(h.backend.upstream_patterns(EventKind::FileChange), vec!["vis.0"]);

    h.router.handle_disconnect(alice, "transport closed").await;
    assert!(h.backend.upstream_patterns(EventKind::StateChange).is_empty());
    assert!(h.backend.upstream_patterns(EventKind::FileChange).is_empty());
    assert!(!h.router.state_change("a.1", None));
}

#[tokio::test(start_paused = true)]
async fn idle_session_expires_and_asks_to_reauthenticate() {
    let h = harness(GatewaySettings {
        ttl: 1,
        ..auth_settings()
    });
    let (alice, mut rx) = connect_as(&h.router, "alice").await;
    assert!(h.router.handle_message(alice, "getVersion", vec![]).await.is_ok());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let reply = h.router.handle_message(alice, "getVersion", vec![]).await;
    assert_eq!(reply.error.as_deref(), Some("reauthenticate"));
    assert_eq!(emitted(&drain(&mut rx), "reauthenticate").len(), 1);
}

#[tokio::test]
async fn backend_logout_reaches_token_holders() {
    let tokens = Arc::new(MemorySessionStore::new());
    tokens.insert(
        "a:tok-1",
        SessionRecord {
            user: "alice".into(),
            // 2100-01-01T00:00:00Z
            expires_at_ms: Some(4_102_444_800_000),
        },
    );
    let backend = Arc::new(MemoryBackend::with_seed(seed()));
    let router = Router::builder(auth_settings(), backend, tokens).build();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = router
        .handle_connect(ConnectRequest::new(Credential::Token("tok-1".into())), tx)
        .await;
    assert_eq!(router.connection(id).map(|c| c.user()).as_deref(), Some("system.user.alice"));

    router.send_command(BackendCommand::Logout { token: "tok-1".into() });
    assert_eq!(emitted(&drain(&mut rx), "reauthenticate").len(), 1);
}

#[tokio::test]
async fn panicking_handler_is_reported_and_dispatch_survives() {
    let h = harness(GatewaySettings::default());
    h.router.add_command_handler(
        "explode",
        handler(|_ctx: CommandContext, args: Vec<Value>| async move {
            if args.is_empty() {
                panic!("boom");
            }
            Ok::<_, GatewayError>(args)
        }),
    );
    let (admin, _rx) = connect_as(&h.router, "admin").await;

    let reply = h.router.handle_message(admin, "explode", vec![]).await;
    assert_eq!(reply.error.as_deref(), Some("Command explode failed"));
    let after = h.router.handle_message(admin, "getAdapterName", vec![]).await;
    assert_eq!(after.into_args(), vec![Value::Null, json!("admin")]);
}

#[tokio::test(start_paused = true)]
async fn read_logs_times_out_with_an_empty_list() {
    let h = harness(GatewaySettings::default());
    h.backend.script_reply(
        "system.host.pi",
        "getLogFiles",
        Ok(json!({"list": [{"fileName": "iobroker.log", "size": 10}]})),
        Some(Duration::from_secs(2)),
    );
    let (admin, _rx) = connect_as(&h.router, "admin").await;

    let reply = h.router.handle_message(admin, "readLogs", vec![json!("system.host.pi")]).await;
    assert_eq!(reply.into_args(), vec![json!("timeout"), json!([])]);
}

#[tokio::test]
async fn read_logs_returns_the_host_list_when_it_answers() {
    let h = harness(GatewaySettings::default());
    let files = json!([{"fileName": "iobroker.log", "size": 10}]);
    h.backend
        .script_reply("system.host.pi", "getLogFiles", Ok(json!({"list": files.clone()})), None);
    let (admin, _rx) = connect_as(&h.router, "admin").await;

    let reply = h.router.handle_message(admin, "readLogs", vec![json!("system.host.pi")]).await;
    assert_eq!(reply.into_args(), vec![Value::Null, files]);
}

#[tokio::test]
async fn host_status_queries_share_one_round_trip() {
    let h = harness(GatewaySettings::default());
    h.backend
        .script_reply("system.host.pi", "getHostInfo", Ok(json!({"Platform": "linux"})), None);
    let (admin, _rx) = connect_as(&h.router, "admin").await;

    for _ in 0..3 {
        let reply = h
            .router
            .handle_message(admin, "sendToHost", vec![json!("system.host.pi"), json!("getHostInfo")])
            .await;
        assert_eq!(reply.into_args(), vec![Value::Null, json!({"Platform": "linux"})]);
    }
    assert_eq!(h.backend.host_calls("system.host.pi", "getHostInfo"), 1);
}

#[tokio::test(start_paused = true)]
async fn forced_threshold_is_broadcast_to_every_client() {
    let h = harness(GatewaySettings::default());
    let (admin, _rx_admin) = connect_as(&h.router, "admin").await;
    let (_other, mut rx_other) = connect_as(&h.router, "admin").await;

    let reply = h.router.handle_message(admin, "eventsThreshold", vec![json!(true)]).await;
    assert!(reply.is_ok());
    assert_eq!(emitted(&drain(&mut rx_other), "eventsThreshold"), vec![vec![json!(true)]]);

    h.router.handle_message(admin, "eventsThreshold", vec![json!(false)]).await;
    assert_eq!(emitted(&drain(&mut rx_other), "eventsThreshold"), vec![vec![json!(false)]]);
}

#[tokio::test]
async fn files_round_trip_through_base64() {
    let h = harness(GatewaySettings::default());
    let (admin, _rx) = connect_as(&h.router, "admin").await;

    let write = h
        .router
        .handle_message(admin, "writeFile64", vec![json!("vis.0"), json!("main/view.json"), json!("e30=")])
        .await;
    assert!(write.is_ok(), "{write:?}");
    let read = h
        .router
        .handle_message(admin, "readFile", vec![json!("vis.0"), json!("main/view.json")])
        .await;
    assert_eq!(read.into_args(), vec![Value::Null, json!("{}"), json!("application/json")]);

    let bad = h
        .router
        .handle_message(admin, "writeFile64", vec![json!("vis.0"), json!("x.bin"), json!("***")])
        .await;
    assert!(bad.error.unwrap().starts_with("Invalid base64"));
}

#[tokio::test]
async fn whitelist_entry_narrows_the_acl_of_matching_addresses() {
    let whitelist = serde_json::from_value(json!({
        "10.0.0.*": {"user": "auth", "state": {"write": false}}
    }))
    .unwrap();
    let h = harness(GatewaySettings {
        whitelist: Some(whitelist),
        ..auth_settings()
    });

    let (tx, _rx) = mpsc::unbounded_channel();
    let narrowed = h
        .router
        .handle_connect(
            ConnectRequest::new(Credential::Session("sid-admin".into())).from_addr("10.0.0.9"),
            tx,
        )
        .await;
    let (tx, _rx_lan) = mpsc::unbounded_channel();
    let lan = h
        .router
        .handle_connect(
            ConnectRequest::new(Credential::Session("sid-admin".into())).from_addr("192.168.1.5"),
            tx,
        )
        .await;

    let denied = h
        .router
        .handle_message(narrowed, "setState", vec![json!("hm-rpc.0.lamp"), json!(true)])
        .await;
    assert_eq!(denied.into_args(), vec![json!("permissionError")]);
    let stored = h.router.handle_message(lan, "getState", vec![json!("hm-rpc.0.lamp")]).await;
    assert_eq!(stored.into_args(), vec![Value::Null, Value::Null]);

    // only the cleared bit is gone
    let read = h.router.handle_message(narrowed, "getState", vec![json!("hm-rpc.0.lamp")]).await;
    assert_eq!(read.error, None);
    let written = h
        .router
        .handle_message(lan, "setState", vec![json!("hm-rpc.0.lamp"), json!(true)])
        .await;
    assert_eq!(written.into_args(), vec![Value::Null, json!("hm-rpc.0.lamp")]);
}

#[tokio::test]
async fn token_gone_from_the_store_asks_to_reauthenticate() {
    let tokens = Arc::new(MemorySessionStore::new());
    tokens.insert(
        "a:tok-2",
        SessionRecord {
            user: "alice".into(),
            expires_at_ms: Some(chrono::Utc::now().timestamp_millis() + 5_000),
        },
    );
    let backend = Arc::new(MemoryBackend::with_seed(seed()));
    let router = Router::builder(auth_settings(), backend, tokens.clone()).build();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = router
        .handle_connect(ConnectRequest::new(Credential::Token("tok-2".into())), tx)
        .await;
    drain(&mut rx);

    tokens.remove("a:tok-2");
    // close to expiry, so this call re-queries the store in the background
    let reply = router.handle_message(id, "getVersion", vec![]).await;
    assert_eq!(reply.error, None);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(emitted(&drain(&mut rx), "reauthenticate").len(), 1);
}

#[tokio::test]
async fn empty_pattern_list_is_invalid_input() {
    let h = harness(GatewaySettings::default());
    let (admin, _rx) = connect_as(&h.router, "admin").await;

    for command in ["getStates", "getObjects"] {
        let reply = h.router.handle_message(admin, command, vec![json!([])]).await;
        assert_eq!(reply.into_args(), vec![json!("Invalid pattern")], "{command}");
    }
}

#[tokio::test]
async fn pattern_lists_are_queried_and_merged() {
    let h = harness(GatewaySettings::default());
    let (admin, _rx) = connect_as(&h.router, "admin").await;

    let reply = h
        .router
        .handle_message(
            admin,
            "getObjects",
            vec![json!(["system.user.alice", "system.group.*"])],
        )
        .await;
    let args = reply.into_args();
    assert_eq!(args[0], Value::Null);
    let ids: Vec<&String> = args[1].as_object().unwrap().keys().collect();
    assert_eq!(
        ids,
        vec!["system.group.administrator", "system.group.viewers", "system.user.alice"]
    );
}

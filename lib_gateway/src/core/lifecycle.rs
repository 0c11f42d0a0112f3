//! # Connection Lifecycle Manager
//!
//! Owns every live [`Connection`] and drives it through
//! `Connecting -> Authenticating -> Authorized -> Active -> Disconnected`.
//!
//! Two session models keep an identity fresh without re-authenticating on every
//! message:
//!
//! - **Legacy sessions** expire after `ttl` seconds without activity. Activity
//!   bumps a local timestamp, and the backing store record is touched at most
//!   once per [`SESSION_REFRESH_DEBOUNCE`] by a per-connection timer task.
//! - **Tokens** carry an absolute expiry. When a check lands within
//!   [`TOKEN_REFRESH_WINDOW_MS`] of it, the store is re-queried in the
//!   background for an updated expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, SessionStore, TOKEN_KEY_PREFIX};
use crate::configs::GatewaySettings;
use crate::core::acl::USER_PREFIX;
use crate::core::connection::{
    ConnectRequest, Connection, ConnectionId, ConnectionPhase, Credential, Outbound, SessionBinding,
};
use crate::core::whitelist::{self, Whitelist};
use crate::error::{GatewayError, COMMAND_RE_AUTHENTICATE};

pub const SESSION_REFRESH_DEBOUNCE: Duration = Duration::from_secs(60);
pub const TOKEN_REFRESH_WINDOW_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Expired,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `admin` -> `system.user.admin`; prefixed ids are kept.
pub fn qualify_user(user: &str) -> String {
    if user.starts_with(USER_PREFIX) {
        user.to_string()
    } else {
        format!("{USER_PREFIX}{user}")
    }
}

pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    auth: bool,
    default_user: String,
    ttl: Duration,
    whitelist: Option<Whitelist>,
    backend: Arc<dyn Backend>,
    store: Arc<dyn SessionStore>,
}

impl ConnectionManager {
    pub fn new(settings: &GatewaySettings, backend: Arc<dyn Backend>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            auth: settings.auth,
            default_user: qualify_user(&settings.default_user),
            ttl: settings.session_ttl(),
            whitelist: settings.whitelist.clone(),
            backend,
            store,
        }
    }

    /// Registers a new connection in `Connecting`, or `Authenticating` when auth is on.
    pub fn accept(&self, request: &ConnectRequest, outbound: mpsc::UnboundedSender<Outbound>) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, request, outbound));
        if self.auth {
            conn.set_phase(ConnectionPhase::Authenticating);
        }
        self.connections.write().insert(id, Arc::clone(&conn));
        info!(
            conn = id,
            addr = request.remote_addr.as_deref().unwrap_or("-"),
            "Connection accepted"
        );
        conn
    }

    /// Resolves the identity and ACL of `conn`, leaving it `Authorized`.
    pub async fn authenticate(&self, conn: &Arc<Connection>, credential: &Credential) -> Result<(), GatewayError> {
        let entry = self
            .whitelist
            .as_ref()
            .and_then(|wl| whitelist::resolve_entry(wl, conn.remote_addr().unwrap_or("")));

        let (user, session) = match entry.and_then(|e| e.forced_user()) {
            Some(forced) => (forced, SessionBinding::Unbound),
            None if !self.auth => (self.default_user.clone(), SessionBinding::Unbound),
            None => self.lookup(credential).await?,
        };

        let mut acl = self.backend.calculate_acl(&user).await?;
        acl.user = user;
        if let Some(entry) = entry {
            whitelist::downgrade(&mut acl, entry);
        }

        let mut state = conn.state.lock();
        if state.phase == ConnectionPhase::Disconnected {
            // the transport went away while we were waiting on the store
            return Err(GatewayError::Unauthenticated);
        }
        debug!(conn = conn.id(), user = %acl.user, "Connection authorized");
        state.acl = acl;
        state.session = session;
        state.phase = ConnectionPhase::Authorized;
        Ok(())
    }

    async fn lookup(&self, credential: &Credential) -> Result<(String, SessionBinding), GatewayError> {
        let (key, is_token) = match credential {
            Credential::Anonymous => return Err(GatewayError::Unauthenticated),
            Credential::Session(sid) if sid.is_empty() => {
                return Err(GatewayError::invalid("Cannot detect session id"));
            }
            Credential::Session(sid) => (sid.clone(), false),
            Credential::Token(token) => (format!("{TOKEN_KEY_PREFIX}{token}"), true),
        };

        let record = match self.store.get(&key).await {
            Ok(Some(record)) if !record.user.is_empty() => record,
            Ok(_) => return Err(GatewayError::Unauthenticated),
            Err(e) => {
                warn!(error = %e, "Session store lookup failed");
                return Err(GatewayError::Unauthenticated);
            }
        };

        let user = qualify_user(&record.user);
        let binding = if is_token {
            let expires_at_ms = record.expires_at_ms.unwrap_or(i64::MAX);
            if expires_at_ms <= now_ms() {
                return Err(GatewayError::Unauthenticated);
            }
            SessionBinding::Token {
                token: key[TOKEN_KEY_PREFIX.len()..].to_string(),
                expires_at_ms,
                refreshing: false,
            }
        } else {
            SessionBinding::Legacy {
                session_id: key,
                last_activity: Instant::now(),
                refresh: None,
            }
        };
        Ok((user, binding))
    }

    pub fn activate(&self, conn: &Connection) {
        let mut state = conn.state.lock();
        if matches!(state.phase, ConnectionPhase::Authorized | ConnectionPhase::Connecting) {
            state.phase = ConnectionPhase::Active;
        }
    }

    /// Re-validates `conn` on an inbound command and schedules store refreshes.
    pub fn refresh(&self, conn: &Arc<Connection>) -> Freshness {
        let mut state = conn.state.lock();
        match &mut state.session {
            SessionBinding::Unbound => Freshness::Fresh,
            SessionBinding::Legacy {
                session_id,
                last_activity,
                refresh,
            } => {
                let now = Instant::now();
                if now.duration_since(*last_activity) > self.ttl {
                    return Freshness::Expired;
                }
                *last_activity = now;
                if refresh.is_none() {
                    let token = CancellationToken::new();
                    *refresh = Some(token.clone());
                    tokio::spawn(debounced_touch(
                        Arc::downgrade(conn),
                        Arc::clone(&self.store),
                        session_id.clone(),
                        self.ttl,
                        token,
                    ));
                }
                Freshness::Fresh
            }
            SessionBinding::Token {
                token,
                expires_at_ms,
                refreshing,
            } => {
                let now = now_ms();
                if *expires_at_ms <= now {
                    return Freshness::Expired;
                }
                if *expires_at_ms - now < TOKEN_REFRESH_WINDOW_MS && !*refreshing {
                    *refreshing = true;
                    tokio::spawn(requery_token(Arc::downgrade(conn), Arc::clone(&self.store), token.clone()));
                }
                Freshness::Fresh
            }
        }
    }

    /// Non-mutating freshness check used on the publish path.
    pub fn is_fresh(&self, conn: &Connection) -> bool {
        match &conn.state.lock().session {
            SessionBinding::Unbound => true,
            SessionBinding::Legacy { last_activity, .. } => last_activity.elapsed() <= self.ttl,
            SessionBinding::Token { expires_at_ms, .. } => *expires_at_ms > now_ms(),
        }
    }

    /// Removes `id` and cancels its refresh timer. Idempotent.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let conn = self.connections.write().remove(&id)?;
        conn.cancel_refresh();
        conn.set_phase(ConnectionPhase::Disconnected);
        Some(conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        conns.sort_by_key(|c| c.id());
        conns
    }

    pub fn active(&self) -> Vec<Arc<Connection>> {
        self.all()
            .into_iter()
            .filter(|c| c.phase() == ConnectionPhase::Active)
            .collect()
    }

    pub fn with_token(&self, token: &str) -> Vec<Arc<Connection>> {
        self.all()
            .into_iter()
            .filter(|c| c.token().as_deref() == Some(token))
            .collect()
    }

    /// Returns how many connections were updated.
    pub fn update_token_expiration(&self, token: &str, new_expiry_ms: i64) -> usize {
        let mut updated = 0;
        for conn in self.with_token(token) {
            if let SessionBinding::Token {
                expires_at_ms,
                refreshing,
                ..
            } = &mut conn.state.lock().session
            {
                *expires_at_ms = new_expiry_ms;
                *refreshing = false;
                updated += 1;
            }
        }
        updated
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn debounced_touch(
    conn: Weak<Connection>,
    store: Arc<dyn SessionStore>,
    session_id: String,
    ttl: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sleep(SESSION_REFRESH_DEBOUNCE) => {
            let Some(conn) = conn.upgrade() else { return };
            if let SessionBinding::Legacy { refresh, .. } = &mut conn.state.lock().session {
                *refresh = None;
            }
            match store.get(&session_id).await {
                Ok(Some(_)) => {
                    if let Err(e) = store.touch(&session_id, ttl).await {
                        warn!(conn = conn.id(), error = %e, "Failed to extend session");
                    }
                }
                _ => {
                    debug!(conn = conn.id(), "Session vanished from store");
                    conn.emit(COMMAND_RE_AUTHENTICATE, Vec::new());
                }
            }
        }
    }
}

async fn requery_token(conn: Weak<Connection>, store: Arc<dyn SessionStore>, token: String) {
    let record = store.get(&format!("{TOKEN_KEY_PREFIX}{token}")).await;
    let Some(conn) = conn.upgrade() else { return };
    let renewed = match record {
        Ok(Some(record)) => record.expires_at_ms,
        _ => None,
    };
    let lost = {
        let mut state = conn.state.lock();
        match &mut state.session {
            SessionBinding::Token {
                expires_at_ms,
                refreshing,
                ..
            } => {
                *refreshing = false;
                match renewed {
                    Some(expiry) => {
                        *expires_at_ms = expiry;
                        false
                    }
                    None => true,
                }
            }
            _ => false,
        }
    };
    if lost {
        conn.emit(COMMAND_RE_AUTHENTICATE, Vec::new());
    }
}

//! # Connection Record
//!
//! One [`Connection`] exists per live transport session. The transport only
//! sees the receiving half of its outbound channel; everything the gateway
//! says to a client, replies excluded, goes through [`Connection::emit`].

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::acl::Acl;

pub type ConnectionId = u64;

/// A message for the transport to deliver, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Emit { event: String, args: Vec<Value> },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    Authorized,
    Active,
    Disconnected,
}

/// Credential pre-parsed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Session(String),
    Token(String),
}

/// What the transport knows when a connection arrives.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub remote_addr: Option<String>,
    pub credential: Credential,
    /// The connection arrived through a trusted channel.
    pub secure: bool,
}

impl ConnectRequest {
    pub fn new(credential: Credential) -> Self {
        Self {
            remote_addr: None,
            credential,
            secure: false,
        }
    }

    pub fn from_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }
}

#[derive(Debug)]
pub enum SessionBinding {
    /// Authentication disabled, or identity forced by the whitelist.
    Unbound,
    Legacy {
        session_id: String,
        last_activity: Instant,
        /// Pending debounced store refresh.
        refresh: Option<CancellationToken>,
    },
    Token {
        token: String,
        expires_at_ms: i64,
        refreshing: bool,
    },
}

#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub phase: ConnectionPhase,
    pub acl: Acl,
    pub session: SessionBinding,
    pub name: Option<String>,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<String>,
    secure: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
    pub(crate) state: Mutex<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        request: &ConnectRequest,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id,
            remote_addr: request.remote_addr.clone(),
            secure: request.secure,
            outbound,
            state: Mutex::new(ConnectionState {
                phase: ConnectionPhase::Connecting,
                acl: Acl::none(""),
                session: SessionBinding::Unbound,
                name: None,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.lock().phase
    }

    pub(crate) fn set_phase(&self, phase: ConnectionPhase) {
        self.state.lock().phase = phase;
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.phase(), ConnectionPhase::Disconnected) && !self.outbound.is_closed()
    }

    pub fn user(&self) -> String {
        self.state.lock().acl.user.clone()
    }

    pub fn acl(&self) -> Acl {
        self.state.lock().acl.clone()
    }

    pub fn name(&self) -> Option<String> {
        self.state.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state.lock().name = Some(name.into());
    }

    pub fn token(&self) -> Option<String> {
        match &self.state.lock().session {
            SessionBinding::Token { token, .. } => Some(token.clone()),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        match &self.state.lock().session {
            SessionBinding::Legacy { session_id, .. } => Some(session_id.clone()),
            _ => None,
        }
    }

    /// Queues an event. Returns `false` once the transport has gone away.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        self.outbound
            .send(Outbound::Emit {
                event: event.to_string(),
                args,
            })
            .is_ok()
    }

    /// Asks the transport to close the socket.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Cancels the pending session refresh, if any.
    pub(crate) fn cancel_refresh(&self) {
        if let SessionBinding::Legacy { refresh, .. } = &mut self.state.lock().session {
            if let Some(token) = refresh.take() {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(7, &ConnectRequest::new(Credential::Anonymous), tx);
        assert!(conn.emit("stateChange", vec![json!("a"), json!(1)]));
        assert!(conn.emit("stateChange", vec![json!("a"), json!(2)]));
        conn.close();

        let first = rx.try_recv().unwrap();
        assert_eq!(
            first,
            Outbound::Emit {
                event: "stateChange".into(),
                args: vec![json!("a"), json!(1)]
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Emit { args, .. } if args[1] == json!(2)));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[test]
    fn emit_fails_after_receiver_drops() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(1, &ConnectRequest::new(Credential::Anonymous), tx);
        drop(rx);
        assert!(!conn.emit("log", vec![]));
        assert!(!conn.is_connected());
    }
}

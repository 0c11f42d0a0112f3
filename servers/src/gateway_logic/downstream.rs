use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::StreamExt;
use lib_gateway::Router as GatewayRouter;
use lib_gateway::core::{ConnectRequest, ConnectionId, Credential, Outbound};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway_logic::config::Config;
use crate::gateway_logic::model::{ClientFrame, ServerFrame};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<GatewayRouter>,
    pub shutdown: CancellationToken,
}

/// Query parameters of the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    sid: Option<String>,
    token: Option<String>,
}

impl ConnectParams {
    fn credential(self) -> Credential {
        match (self.token, self.sid) {
            (Some(token), _) => Credential::Token(token),
            (None, Some(sid)) => Credential::Session(sid),
            (None, None) => Credential::Anonymous,
        }
    }
}

pub async fn run(config: Config, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Downstream server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Downstream server shutting down");
        })
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let request = ConnectRequest::new(params.credential()).from_addr(addr.to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, request))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode frame");
            true
        }
    }
}

fn spawn_command(state: &AppState, id: ConnectionId, frame: ClientFrame, replies: mpsc::UnboundedSender<ServerFrame>) {
    let router = Arc::clone(&state.router);
    tokio::spawn(async move {
        let reply = router.handle_message(id, &frame.command, frame.args).await;
        let _ = replies.send(ServerFrame::Reply {
            id: frame.id,
            args: reply.into_args(),
        });
    });
}

async fn handle_socket(mut socket: WebSocket, state: AppState, request: ConnectRequest) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let id = state.router.handle_connect(request, outbound_tx).await;

    let reason = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break "server shutdown";
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => spawn_command(&state, id, frame, reply_tx.clone()),
                        Err(e) => debug!(conn = id, error = %e, "Ignoring malformed frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break "client disconnect",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(conn = id, error = %e, "Socket error");
                        break "transport error";
                    }
                }
            }
            Some(outbound) = outbound_rx.recv() => {
                match outbound {
                    Outbound::Emit { event, args } => {
                        if !send_frame(&mut socket, &ServerFrame::Event { event, args }).await {
                            break "transport error";
                        }
                    }
                    Outbound::Close => {
                        let _ = socket.send(Message::Close(None)).await;
                        break "server disconnect";
                    }
                }
            }
            Some(reply) = reply_rx.recv() => {
                if !send_frame(&mut socket, &reply).await {
                    break "transport error";
                }
            }
        }
    };

    state.router.handle_disconnect(id, reason).await;
}

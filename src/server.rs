//! 라우터 및 WebSocket 연결 처리

use crate::handlers::{self, ConnectParams, ConnectionEvent, SignalingConnection};
use crate::protocol::Outbound;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderValue,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// 전체 라우터 구성
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/api/rooms", post(handlers::create_room))
        .route("/api/rooms/by-code/:code", get(handlers::get_room_by_code))
        .route("/api/rooms/:id/join", post(handlers::join_room))
        .layer(cors_layer(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if state.config.allows_any_origin() {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

/// 기존 클라이언트는 서버 루트로 WebSocket을 연다
async fn index_handler(
    ws: Option<WebSocketUpgrade>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, params)),
        None => Json(serde_json::json!({
            "ok": true,
            "message": "StudyMate signaling server. Open a WebSocket with ?roomId=...&nickname=...",
            "endpoints": [
                "POST /api/rooms",
                "GET /api/rooms/by-code/:code",
                "POST /api/rooms/:id/join",
                "GET /ws?roomId=...&nickname=...",
                "GET /health",
            ],
        }))
        .into_response(),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "server": "studymate-signaling",
        "timestamp": SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
        "rooms": state.registry.len(),
        "liveRooms": state.channels.len(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    // roomId 없는 연결은 정책 위반으로 즉시 종료
    let Some(room_id) = params.room_id().map(str::to_string) else {
        tracing::warn!(nickname = %params.nickname(), "Rejected signaling connection without roomId");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::Borrowed("roomId required"),
            })))
            .await;
        return;
    };

    let mut conn = SignalingConnection::new(room_id, params.nickname());
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    conn.handle(&state, ConnectionEvent::Admit(tx));

    // 송신 태스크
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Some(text) = frame.into_text() {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    // 수신 처리
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => conn.handle(&state, ConnectionEvent::Inbound(&text)),
            Ok(Message::Close(_)) => break,
            Err(err) => {
                tracing::debug!(conn_id = %conn.conn_id, error = %err, "WebSocket receive error");
                break;
            }
            _ => {}
        }
    }

    // 연결 해제
    conn.handle(&state, ConnectionEvent::Close);
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(Config::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr, path_and_query: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}{path_and_query}")).await.unwrap();
        ws
    }

    async fn join(addr: SocketAddr, room: &str, nickname: &str) -> (Client, Value) {
        let mut ws = connect(addr, &format!("/ws?roomId={room}&nickname={nickname}")).await;
        let snapshot = next_json(&mut ws).await;
        (ws, snapshot)
    }

    async fn next_json(ws: &mut Client) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for message")
                .expect("stream ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn assert_silent(ws: &mut Client) {
        let next = timeout(Duration::from_millis(200), ws.next()).await;
        assert!(next.is_err(), "unexpected message: {next:?}");
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn missing_room_id_is_closed_with_policy_violation() {
        let (addr, state) = spawn_server().await;
        let mut ws = connect(addr, "/ws?nickname=Ann").await;

        let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        match msg {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1008);
                assert_eq!(frame.reason, "roomId required");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(state.channels.is_empty());
    }

    #[tokio::test]
    async fn members_snapshot_and_member_joined_fan_out() {
        let (addr, _state) = spawn_server().await;

        let (mut a, snap_a) = join(addr, "room-1", "A").await;
        assert_eq!(snap_a, json!({"type": "members", "members": []}));
        let (mut b, snap_b) = join(addr, "room-1", "B").await;
        assert_eq!(snap_b, json!({"type": "members", "members": ["A"]}));
        assert_eq!(next_json(&mut a).await, json!({"type": "member_joined", "nickname": "B"}));

        let (mut other, _) = join(addr, "room-2", "Z").await;

        let (_n, snap_n) = join(addr, "room-1", "N").await;
        assert_eq!(snap_n, json!({"type": "members", "members": ["A", "B"]}));
        assert_eq!(next_json(&mut a).await, json!({"type": "member_joined", "nickname": "N"}));
        assert_eq!(next_json(&mut b).await, json!({"type": "member_joined", "nickname": "N"}));

        assert_silent(&mut a).await;
        assert_silent(&mut b).await;
        assert_silent(&mut other).await;
    }

    #[tokio::test]
    async fn relay_reaches_room_peers_with_server_stamped_from() {
        let (addr, _state) = spawn_server().await;
        let (mut ann, _) = join(addr, "r", "Ann").await;
        let (mut ben, _) = join(addr, "r", "Ben").await;
        next_json(&mut ann).await;
        let (mut zed, _) = join(addr, "elsewhere", "Zed").await;

        ann.send(WsMessage::Text("garbage{".into())).await.unwrap();
        ann.send(WsMessage::Text(r#"{"type":"chat","text":"hi","from":"Ben"}"#.into()))
            .await
            .unwrap();

        assert_eq!(
            next_json(&mut ben).await,
            json!({"type": "chat", "text": "hi", "from": "Ann"})
        );
        assert_silent(&mut ann).await;
        assert_silent(&mut zed).await;
    }

    #[tokio::test]
    async fn last_close_removes_room_channel() {
        let (addr, state) = spawn_server().await;
        let (mut ann, _) = join(addr, "solo", "Ann").await;
        assert!(state.channels.contains_key("solo"));

        ann.close(None).await.unwrap();
        wait_until(|| !state.channels.contains_key("solo")).await;

        let (_again, snapshot) = join(addr, "solo", "Ben").await;
        assert_eq!(snapshot, json!({"type": "members", "members": []}));
    }

    #[tokio::test]
    async fn root_path_accepts_signaling_and_serves_index() {
        let (addr, _state) = spawn_server().await;
        let mut ws = connect(addr, "/?roomId=lobby").await;
        assert_eq!(next_json(&mut ws).await, json!({"type": "members", "members": []}));

        let (_second, snapshot) = join(addr, "lobby", "Kim").await;
        assert_eq!(snapshot, json!({"type": "members", "members": ["Anonymous"]}));
        assert_eq!(
            next_json(&mut ws).await,
            json!({"type": "member_joined", "nickname": "Kim"})
        );
    }
}

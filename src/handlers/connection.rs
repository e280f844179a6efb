//! 시그널링 연결 상태 머신
//!
//! `Connecting → Open → Closed`. 모든 전이는 [`SignalingConnection::handle`]
//! 한 곳에서 일어난다.

use crate::protocol::{Outbound, ServerMessage};
use crate::state::{AppState, RoomChannel, RoomPeer};
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

pub const DEFAULT_NICKNAME: &str = "Anonymous";

/// 연결 쿼리 파라미터 (`?roomId=...&nickname=...`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "roomId")]
    pub room_id: Option<String>,
    pub nickname: Option<String>,
}

impl ConnectParams {
    /// 비어 있는 roomId는 없는 것으로 본다
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn nickname(&self) -> &str {
        self.nickname
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_NICKNAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// 연결 이벤트
pub enum ConnectionEvent<'a> {
    /// 방 식별자 검증 후 입장
    Admit(UnboundedSender<Outbound>),
    /// 텍스트 프레임 수신
    Inbound(&'a str),
    /// 어느 쪽이든 전송 종료
    Close,
}

pub struct SignalingConnection {
    pub conn_id: String,
    pub room_id: String,
    pub nickname: String,
    state: ConnectionState,
}

impl SignalingConnection {
    pub fn new(room_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            conn_id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            nickname: nickname.into(),
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&mut self, state: &AppState, event: ConnectionEvent<'_>) {
        match (self.state, event) {
            (ConnectionState::Connecting, ConnectionEvent::Admit(sender)) => {
                admit(state, self, sender);
                self.state = ConnectionState::Open;
            }
            (ConnectionState::Open, ConnectionEvent::Inbound(text)) => {
                super::relay::relay_message(state, self, text);
            }
            (ConnectionState::Open, ConnectionEvent::Close) => {
                release(state, self);
                self.state = ConnectionState::Closed;
            }
            (ConnectionState::Connecting, ConnectionEvent::Close) => {
                self.state = ConnectionState::Closed;
            }
            (current, _) => {
                tracing::trace!(conn_id = %self.conn_id, state = ?current, "Ignored connection event");
            }
        }
    }
}

/// 방 연결 집합에 등록하고 입장 알림을 보낸다.
///
/// 스냅샷과 입장 알림은 방 엔트리 락 안에서 함께 처리된다.
fn admit(state: &AppState, conn: &SignalingConnection, sender: UnboundedSender<Outbound>) {
    let mut room = state
        .channels
        .entry(conn.room_id.clone())
        .or_insert_with(|| {
            tracing::info!(room_id = %conn.room_id, "Room channel created");
            RoomChannel::new()
        });

    let others = room.nicknames();
    let _ = sender.send(Outbound::Server(ServerMessage::Members {
        members: others.clone(),
    }));

    let joined = ServerMessage::MemberJoined {
        nickname: conn.nickname.clone(),
    };
    for peer in room.peers.iter() {
        if !peer.send(Outbound::Server(joined.clone())) {
            tracing::debug!(target_conn = %peer.conn_id, "Skipped member_joined to closed connection");
        }
    }

    room.peers.push(RoomPeer {
        conn_id: conn.conn_id.clone(),
        nickname: conn.nickname.clone(),
        sender,
    });

    tracing::info!(
        room_id = %conn.room_id,
        nickname = %conn.nickname,
        conn_id = %conn.conn_id,
        existing = ?others,
        "Signaling connection opened"
    );
}

/// 연결 제거. 방이 비면 채널 항목도 제거한다. 남은 멤버에게 알리지 않는다.
fn release(state: &AppState, conn: &SignalingConnection) {
    let now_empty = match state.channels.get_mut(&conn.room_id) {
        Some(mut room) => {
            room.peers.retain(|p| p.conn_id != conn.conn_id);
            room.peers.is_empty()
        }
        None => false,
    };

    if now_empty
        && state
            .channels
            .remove_if(&conn.room_id, |_, room| room.peers.is_empty())
            .is_some()
    {
        tracing::info!(room_id = %conn.room_id, "Room channel removed");
    }

    tracing::info!(
        room_id = %conn.room_id,
        nickname = %conn.nickname,
        conn_id = %conn.conn_id,
        "Signaling connection closed"
    );
}

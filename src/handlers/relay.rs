//! 방 메시지 중계
//!
//! 내용과 무관하게 JSON 객체를 같은 방의 다른 열린 연결 전부에 보낸다.
//! `target` 필드로 수신자를 거르지 않는다.

use super::connection::SignalingConnection;
use crate::protocol::{stamp_sender, Outbound};
use crate::state::AppState;

/// 수신 메시지 중계. 형식이 잘못된 메시지는 조용히 버린다.
pub fn relay_message(state: &AppState, conn: &SignalingConnection, raw: &str) {
    let Some(stamped) = stamp_sender(raw, &conn.nickname) else {
        tracing::debug!(
            room_id = %conn.room_id,
            from = %conn.nickname,
            "Dropped malformed relay payload"
        );
        return;
    };

    let delivered = broadcast_to_room_except(state, &conn.room_id, &conn.conn_id, &stamped);

    tracing::debug!(
        room_id = %conn.room_id,
        from = %conn.nickname,
        delivered = delivered,
        "Relayed message"
    );
}

/// 방의 특정 연결을 제외하고 브로드캐스트. 전달한 연결 수를 돌려준다.
fn broadcast_to_room_except(state: &AppState, room_id: &str, except_conn_id: &str, text: &str) -> usize {
    let Some(room) = state.channels.get(room_id) else {
        return 0;
    };
    room.others(except_conn_id)
        .filter(|peer| peer.send(Outbound::Relay(text.to_string())))
        .count()
}

//! 클라이언트-서버 메시지 프로토콜 정의
//!
//! 서버는 `members` / `member_joined` 두 종류만 직접 만들고,
//! 나머지 JSON 객체는 `from`만 덮어써서 같은 방의 다른 연결로 중계한다.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// 서버 → 클라이언트 알림
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// 새로 입장한 연결에게 보내는 기존 멤버 목록
    Members { members: Vec<String> },
    /// 기존 멤버들에게 보내는 입장 알림
    MemberJoined { nickname: String },
}

/// 연결별 송신 큐에 들어가는 프레임
#[derive(Debug, Clone)]
pub enum Outbound {
    Server(ServerMessage),
    /// 이미 직렬화된 중계 메시지
    Relay(String),
}

impl Outbound {
    pub fn into_text(self) -> Option<String> {
        match self {
            Outbound::Server(msg) => serde_json::to_string(&msg).ok(),
            Outbound::Relay(text) => Some(text),
        }
    }
}

/// 수신한 원문에 보낸 사람을 찍는다. JSON 객체가 아니면 `None`.
///
/// 클라이언트가 넣은 `from` 값은 항상 덮어쓴다.
pub fn stamp_sender(raw: &str, from: &str) -> Option<String> {
    let mut object: Map<String, Value> = match serde_json::from_str(raw).ok()? {
        Value::Object(object) => object,
        _ => return None,
    };
    object.insert("from".to_string(), Value::String(from.to_string()));
    serde_json::to_string(&object).ok()
}

/// 피어 협상 페이로드 (`webrtc` 메시지의 `payload`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: RTCSessionDescription },
    Answer { sdp: RTCSessionDescription },
    Ice { candidate: RTCIceCandidateInit },
    /// offer를 보내지 않는 쪽이 재협상을 요청할 때
    Renegotiate,
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Ice { .. } => "ice",
            SignalPayload::Renegotiate => "renegotiate",
        }
    }
}

/// 특정 멤버를 향한 협상 메시지. `target`은 권고용이며 서버는 걸러내지 않는다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub const KIND: &'static str = "webrtc";

    pub fn new(target: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            target: target.into(),
            from: None,
            payload,
        }
    }
}

/// 클라이언트 측에서 해석하는 방 이벤트. 모르는 타입은 `Other`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    Members {
        members: Vec<String>,
    },
    MemberJoined {
        nickname: String,
    },
    Webrtc {
        target: Option<String>,
        from: Option<String>,
        payload: SignalPayload,
    },
    #[serde(other)]
    Other,
}

impl RoomEvent {
    /// 해석할 수 없는 메시지(형식 오류 포함)는 `Other`로 취급
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or(RoomEvent::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_messages_use_snake_case_tags() {
        let members = ServerMessage::Members {
            members: vec!["Ann".into()],
        };
        assert_eq!(
            serde_json::to_value(&members).unwrap(),
            json!({"type": "members", "members": ["Ann"]})
        );
        let joined = ServerMessage::MemberJoined {
            nickname: "Ben".into(),
        };
        assert_eq!(
            serde_json::to_value(&joined).unwrap(),
            json!({"type": "member_joined", "nickname": "Ben"})
        );
    }

    #[test]
    fn stamp_sender_overwrites_spoofed_from() {
        let stamped = stamp_sender(r#"{"type":"chat","text":"hi","from":"Mallory"}"#, "Ann").unwrap();
        let value: Value = serde_json::from_str(&stamped).unwrap();
        assert_eq!(value, json!({"type": "chat", "text": "hi", "from": "Ann"}));
    }

    #[test]
    fn stamp_sender_rejects_non_objects() {
        assert!(stamp_sender("not json", "Ann").is_none());
        assert!(stamp_sender("[1,2,3]", "Ann").is_none());
        assert!(stamp_sender("42", "Ann").is_none());
        assert!(stamp_sender("{}", "Ann").is_some());
    }

    #[test]
    fn webrtc_envelope_matches_browser_shape() {
        let sdp: RTCSessionDescription =
            serde_json::from_value(json!({"type": "offer", "sdp": "v=0"})).unwrap();
        let envelope = SignalEnvelope::new("Ben", SignalPayload::Offer { sdp });
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "type": "webrtc",
                "target": "Ben",
                "payload": {"type": "offer", "sdp": {"type": "offer", "sdp": "v=0"}}
            })
        );
    }

    #[test]
    fn renegotiate_request_has_no_body() {
        let envelope = SignalEnvelope::new("Ann", SignalPayload::Renegotiate);
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"type": "webrtc", "target": "Ann", "payload": {"type": "renegotiate"}})
        );
        let event = RoomEvent::from_value(json!({
            "type": "webrtc", "target": "Ann", "from": "Ben", "payload": {"type": "renegotiate"}
        }));
        assert!(matches!(event, RoomEvent::Webrtc { payload: SignalPayload::Renegotiate, .. }));
    }

    #[test]
    fn room_event_parses_known_and_unknown_types() {
        let event = RoomEvent::from_value(json!({"type": "members", "members": ["A", "B"]}));
        assert!(matches!(event, RoomEvent::Members { members } if members == ["A", "B"]));

        let event = RoomEvent::from_value(json!({
            "type": "webrtc",
            "target": "Ann",
            "from": "Ben",
            "payload": {"type": "ice", "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0}}
        }));
        match event {
            RoomEvent::Webrtc { target, from, payload: SignalPayload::Ice { candidate } } => {
                assert_eq!(target.as_deref(), Some("Ann"));
                assert_eq!(from.as_deref(), Some("Ben"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(matches!(
            RoomEvent::from_value(json!({"type": "timer", "timeLeft": 300})),
            RoomEvent::Other
        ));
        assert!(matches!(
            RoomEvent::from_value(json!({"type": "members", "members": "nope"})),
            RoomEvent::Other
        ));
    }
}

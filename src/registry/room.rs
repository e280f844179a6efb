//! 방/멤버 데이터 모델

use serde::{Deserialize, Serialize};

/// 아바타 설명자 (기본 형태, 색상, 선택적 머리/옷 변형)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avatar {
    pub base: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clothes: Option<String>,
}

impl Default for Avatar {
    fn default() -> Self {
        Self {
            base: "animal".to_string(),
            color: "#B9E5FB".to_string(),
            emoji: None,
            head: Some("head1".to_string()),
            clothes: Some("clothes1".to_string()),
        }
    }
}

/// 방 멤버. 클라이언트가 보낸 값을 그대로 신뢰한다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub nickname: String,
    pub avatar: Avatar,
}

impl Member {
    pub fn new(nickname: impl Into<String>, avatar: Avatar) -> Self {
        Self {
            nickname: nickname.into(),
            avatar,
        }
    }
}

/// 스터디 방
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub invite_code: String,
    pub name: String,
    pub host_nickname: String,
    pub members: Vec<Member>,
    /// 분 단위
    pub duration: u32,
    pub max_members: usize,
}

impl Room {
    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_members
    }
}

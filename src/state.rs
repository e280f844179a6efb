//! 애플리케이션 상태 관리

use crate::config::Config;
use crate::protocol::Outbound;
use crate::registry::RoomRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// 전역 애플리케이션 상태
pub struct AppState {
    /// 방 엔티티 (HTTP 게이트웨이가 변경)
    pub registry: RoomRegistry,
    /// 방별 라이브 시그널링 연결 (room_id -> RoomChannel)
    pub channels: DashMap<String, RoomChannel>,
    /// 설정
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            registry: RoomRegistry::new(config.room.clone()),
            channels: DashMap::new(),
            config: Arc::new(config),
        }
    }

    /// 방의 현재 연결 닉네임 목록 (입장 순)
    pub fn live_members(&self, room_id: &str) -> Vec<String> {
        self.channels
            .get(room_id)
            .map(|room| room.nicknames())
            .unwrap_or_default()
    }
}

/// 한 방의 열린 연결 집합. 마지막 연결이 닫히면 통째로 제거된다.
pub struct RoomChannel {
    pub peers: Vec<RoomPeer>,
}

impl RoomChannel {
    pub fn new() -> Self {
        Self { peers: Vec::new() }
    }

    pub fn nicknames(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.nickname.clone()).collect()
    }

    /// 자신을 제외한 연결들
    pub fn others<'a>(&'a self, conn_id: &'a str) -> impl Iterator<Item = &'a RoomPeer> + 'a {
        self.peers.iter().filter(move |p| p.conn_id != conn_id)
    }
}

impl Default for RoomChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// 방에 등록된 열린 연결
pub struct RoomPeer {
    pub conn_id: String,
    pub nickname: String,
    pub sender: UnboundedSender<Outbound>,
}

impl RoomPeer {
    /// 송신 큐가 닫힌 연결은 건너뛴다
    pub fn send(&self, frame: Outbound) -> bool {
        if self.sender.is_closed() {
            return false;
        }
        self.sender.send(frame).is_ok()
    }
}

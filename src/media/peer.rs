//! 피어 링크 추상화

use super::{LocalTrack, MediaError, MediaKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// 원격 멤버 한 명과의 피어 연결
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError>;
    async fn remove_track(&self, track: &LocalTrack) -> Result<(), MediaError>;
    async fn create_offer(&self) -> Result<RTCSessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<RTCSessionDescription, MediaError>;
    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<(), MediaError>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), MediaError>;
    /// `kind` 미디어를 받을 수 있게 한다. 보내는 트랙이 없어도 offer에 해당 섹션이 생긴다.
    async fn receive(&self, kind: MediaKind) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), MediaError>;
    async fn close(&self) -> Result<(), MediaError>;
}

/// 피어 링크 생성기. 링크의 이벤트는 `events`로 보고해야 한다.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_link(&self, events: LinkEvents) -> Result<Arc<dyn PeerLink>, MediaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

/// 원격에서 도착한 트랙
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    LocalCandidate(RTCIceCandidateInit),
    RemoteTrack(RemoteTrack),
    StateChanged(LinkState),
}

/// 링크 이벤트. `link_id`로 같은 이름의 이전 링크 이벤트를 걸러낸다.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub remote: String,
    pub link_id: u64,
    pub kind: LinkEventKind,
}

/// 링크 하나에 묶인 이벤트 송신기
#[derive(Debug, Clone)]
pub struct LinkEvents {
    remote: String,
    link_id: u64,
    tx: UnboundedSender<LinkEvent>,
}

impl LinkEvents {
    pub fn new(remote: impl Into<String>, link_id: u64, tx: UnboundedSender<LinkEvent>) -> Self {
        Self {
            remote: remote.into(),
            link_id,
            tx,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn local_candidate(&self, candidate: RTCIceCandidateInit) {
        self.emit(LinkEventKind::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.emit(LinkEventKind::RemoteTrack(track));
    }

    pub fn state_changed(&self, state: LinkState) {
        self.emit(LinkEventKind::StateChanged(state));
    }

    fn emit(&self, kind: LinkEventKind) {
        // 오케스트레이터가 종료된 뒤의 이벤트는 버린다
        let _ = self.tx.send(LinkEvent {
            remote: self.remote.clone(),
            link_id: self.link_id,
            kind,
        });
    }
}

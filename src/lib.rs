//! StudyMate 실시간 스터디 룸 시그널링
//!
//! - [`registry`]: 인메모리 방 레지스트리
//! - [`handlers`]: HTTP 게이트웨이, 시그널링 연결 상태 머신, 메시지 중계
//! - [`media`]: 클라이언트 측 피어 연결 오케스트레이터
//! - [`client`]: 시그널링 채널 WebSocket 클라이언트

pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;

//! 시그널링 채널 메시지 프로토콜

mod messages;

pub use messages::*;

//! 핸들러 모듈

pub mod connection;
pub mod relay;
pub mod room;

pub use connection::{ConnectParams, ConnectionEvent, ConnectionState, SignalingConnection};
pub use room::{create_room, get_room_by_code, join_room};

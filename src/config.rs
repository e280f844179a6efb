//! 환경 변수 기반 설정 관리

use std::env;
use std::str::FromStr;

/// 서버 설정
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
    pub room: RoomConfig,
    pub media: MediaConfig,
    pub log_level: String,
}

/// 방 설정
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_members: usize,
    pub default_duration: u32,
    pub min_duration: u32,
    pub max_duration: u32,
    pub invite_prefix: String,
}

impl RoomConfig {
    /// 모순된 값을 기본값으로 되돌린다.
    /// 범위가 뒤집혔거나 0이면 기본 범위를 쓰고, 기본 시간은 범위 안으로 맞춘다.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        if self.min_duration == 0 || self.min_duration > self.max_duration {
            tracing::warn!(
                min = self.min_duration,
                max = self.max_duration,
                "Invalid room duration bounds, using defaults"
            );
            self.min_duration = defaults.min_duration;
            self.max_duration = defaults.max_duration;
        }
        self.default_duration = self.default_duration.max(self.min_duration).min(self.max_duration);
        if self.max_members == 0 {
            tracing::warn!("ROOM_MAX_MEMBERS must be positive, using default");
            self.max_members = defaults.max_members;
        }
        self
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_members: 5,
            default_duration: 25,
            min_duration: 5,
            max_duration: 60,
            invite_prefix: "CLD-".to_string(),
        }
    }
}

/// 피어 연결 설정 (room-peer 클라이언트용)
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// 비어 있으면 host 후보만 쓴다
    pub ice_servers: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            host: "0.0.0.0".to_string(),
            cors_origins: vec!["*".to_string()],
            room: RoomConfig::default(),
            media: MediaConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 환경 변수에서 설정 로드
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Config::default();
        let room = defaults.room;

        Self {
            port: parse_var("PORT", defaults.port),
            host: env::var("HOST").unwrap_or(defaults.host),
            cors_origins: list_var("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
            room: RoomConfig {
                max_members: parse_var("ROOM_MAX_MEMBERS", room.max_members),
                default_duration: parse_var("ROOM_DEFAULT_DURATION", room.default_duration),
                min_duration: parse_var("ROOM_MIN_DURATION", room.min_duration),
                max_duration: parse_var("ROOM_MAX_DURATION", room.max_duration),
                invite_prefix: env::var("INVITE_CODE_PREFIX").unwrap_or(room.invite_prefix),
            }
            .validated(),
            media: MediaConfig {
                ice_servers: list_var("ICE_SERVERS").unwrap_or(defaults.media.ice_servers),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    /// CORS 허용 origin이 전체(`*`)인지 여부
    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn list_var(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

//! 인메모리 방 레지스트리
//!
//! 방은 프로세스가 살아있는 동안 유지되며 삭제되지 않는다.
//! 식별자와 초대 코드 두 인덱스로 조회할 수 있다.

mod room;

pub use room::{Avatar, Member, Room};

use crate::config::RoomConfig;
use crate::error::RegistryError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;

/// 생성 코드의 숫자 범위
const CODE_MIN: u32 = 1000;
const CODE_MAX: u32 = 9999;
/// 무작위 시도 횟수. 이후에는 순차 탐색으로 빈 코드를 찾는다.
const RANDOM_CODE_ATTEMPTS: usize = 32;

/// 방 생성 요청
#[derive(Debug, Clone, Default)]
pub struct NewRoom {
    pub name: String,
    pub host_nickname: String,
    /// `None` 또는 0이면 기본 시간 사용
    pub duration: Option<u32>,
    pub invite_code: Option<String>,
}

pub struct RoomRegistry {
    /// room_id -> Room
    rooms: DashMap<String, Room>,
    /// invite_code -> room_id
    codes: DashMap<String, String>,
    config: RoomConfig,
}

impl RoomRegistry {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            codes: DashMap::new(),
            config,
        }
    }

    /// 방 생성. 생성 가능한 초대 코드가 모두 쓰였으면 `CodesExhausted`.
    pub fn create_room(&self, request: NewRoom) -> Result<Room, RegistryError> {
        let id = generate_room_id();
        let duration = self.clamp_duration(request.duration);

        let requested = request
            .invite_code
            .as_deref()
            .map(normalize_code)
            .filter(|c| !c.is_empty());
        let code = self.reserve_code(requested, &id)?;

        let room = Room {
            id: id.clone(),
            invite_code: code,
            name: request.name,
            host_nickname: request.host_nickname,
            members: Vec::new(),
            duration,
            max_members: self.config.max_members,
        };
        self.rooms.insert(id, room.clone());

        tracing::info!(
            room_id = %room.id,
            invite_code = %room.invite_code,
            duration = room.duration,
            "Room created"
        );
        Ok(room)
    }

    /// 초대 코드로 조회 (대소문자/공백 정규화)
    pub fn get_by_code(&self, code: &str) -> Result<Room, RegistryError> {
        let code = normalize_code(code);
        let id = self
            .codes
            .get(&code)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::NotFound)?;
        self.get_by_id(&id)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Room, RegistryError> {
        self.rooms
            .get(id)
            .map(|room| room.value().clone())
            .ok_or(RegistryError::NotFound)
    }

    /// 멤버 추가. 정원이 찬 방은 변경 없이 거절한다.
    pub fn join(&self, id: &str, member: Member) -> Result<(Room, Member), RegistryError> {
        let mut room = self.rooms.get_mut(id).ok_or(RegistryError::NotFound)?;

        if room.is_full() {
            tracing::warn!(room_id = %id, nickname = %member.nickname, "Room full, rejected join");
            return Err(RegistryError::CapacityExceeded {
                max_members: room.max_members,
            });
        }

        room.members.push(member.clone());
        tracing::info!(
            room_id = %id,
            nickname = %member.nickname,
            members = room.members.len(),
            "Member joined room"
        );
        Ok((room.clone(), member))
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    fn clamp_duration(&self, requested: Option<u32>) -> u32 {
        let minutes = match requested {
            Some(m) if m > 0 => m,
            _ => self.config.default_duration,
        };
        minutes.max(self.config.min_duration).min(self.config.max_duration)
    }

    /// 요청한 코드가 남아 있으면 그것을, 아니면 새 코드를 예약한다
    fn reserve_code(&self, requested: Option<String>, id: &str) -> Result<String, RegistryError> {
        if let Some(code) = requested {
            if self.try_reserve(&code, id) {
                return Ok(code);
            }
            tracing::debug!(invite_code = %code, "Invite code taken, regenerating");
        }

        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_CODE_ATTEMPTS {
            let code = self.invite_code(rng.gen_range(CODE_MIN..=CODE_MAX));
            if self.try_reserve(&code, id) {
                return Ok(code);
            }
        }

        // 거의 다 찬 경우: 임의 지점부터 한 바퀴 훑는다
        let span = CODE_MAX - CODE_MIN + 1;
        let start = rng.gen_range(0..span);
        for offset in 0..span {
            let code = self.invite_code(CODE_MIN + (start + offset) % span);
            if self.try_reserve(&code, id) {
                return Ok(code);
            }
        }

        tracing::error!(prefix = %self.config.invite_prefix, "Invite code space exhausted");
        Err(RegistryError::CodesExhausted)
    }

    fn try_reserve(&self, code: &str, id: &str) -> bool {
        match self.codes.entry(code.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(id.to_string());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    fn invite_code(&self, n: u32) -> String {
        normalize_code(&format!("{}{}", self.config.invite_prefix, n))
    }
}

/// 초대 코드 정규화: 대문자 변환 + 모든 공백 제거
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn generate_room_id() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

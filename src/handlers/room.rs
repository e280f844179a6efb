//! 방 HTTP 게이트웨이 (생성 / 초대 코드 조회 / 참여)

use crate::error::ApiError;
use crate::registry::{Avatar, Member, NewRoom, Room};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const DEFAULT_ROOM_NAME: &str = "Study Room";
const DEFAULT_HOST_NICKNAME: &str = "Host";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub name: Option<String>,
    pub host_nickname: Option<String>,
    /// 숫자 또는 숫자 문자열
    pub duration: Option<Value>,
    pub invite_code: Option<String>,
}

/// 필드 하나가 잘못돼도 나머지는 살린다
#[derive(Debug, Default, Deserialize)]
pub struct JoinRoomRequest {
    /// 문자열이 아니면 기본 닉네임
    #[serde(default)]
    pub nickname: Value,
    #[serde(default)]
    pub avatar: Value,
}

/// 부분적으로 채워진 아바타도 받아들인다
#[derive(Debug, Default, Deserialize)]
pub struct AvatarInput {
    pub base: Option<String>,
    pub color: Option<String>,
    pub emoji: Option<String>,
    pub head: Option<String>,
    pub clothes: Option<String>,
}

impl From<AvatarInput> for Avatar {
    fn from(input: AvatarInput) -> Self {
        let defaults = Avatar::default();
        Avatar {
            base: input.base.unwrap_or(defaults.base),
            color: input.color.unwrap_or(defaults.color),
            emoji: input.emoji,
            head: input.head,
            clothes: input.clothes,
        }
    }
}

/// 방 응답. `timeLeft`는 항상 설정 시간과 같다 (타이머는 클라이언트가 돌린다).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    #[serde(flatten)]
    pub room: Room,
    pub time_left: u32,
}

impl From<Room> for RoomView {
    fn from(room: Room) -> Self {
        let time_left = room.duration;
        Self { room, time_left }
    }
}

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub room: RoomView,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub room: RoomView,
    pub member: Member,
}

/// POST /api/rooms
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateRoomRequest>>,
) -> Result<(StatusCode, Json<RoomResponse>), ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let room = state.registry.create_room(NewRoom {
        name: text_or(request.name, DEFAULT_ROOM_NAME),
        host_nickname: text_or(request.host_nickname, DEFAULT_HOST_NICKNAME),
        duration: request.duration.as_ref().and_then(parse_duration),
        invite_code: request.invite_code,
    })?;

    Ok((
        StatusCode::CREATED,
        Json(RoomResponse { room: room.into() }),
    ))
}

/// GET /api/rooms/by-code/:code
pub async fn get_room_by_code(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let room = state.registry.get_by_code(&code).map_err(|_| {
        ApiError::NotFound("Room not found. Check the code and try again.".to_string())
    })?;
    Ok(Json(RoomResponse { room: room.into() }))
}

/// POST /api/rooms/:id/join
pub async fn join_room(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<JoinRoomRequest>>,
) -> Result<Json<JoinResponse>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let nickname = request.nickname.as_str().map(str::to_string);
    let member = Member::new(
        text_or(nickname, crate::handlers::connection::DEFAULT_NICKNAME),
        parse_avatar(request.avatar),
    );

    let (room, member) = state.registry.join(&id, member)?;
    Ok(Json(JoinResponse {
        room: room.into(),
        member,
    }))
}

/// 형식이 맞지 않는 아바타는 기본 아바타로 대체
fn parse_avatar(value: Value) -> Avatar {
    if value.is_null() {
        return Avatar::default();
    }
    match serde_json::from_value::<AvatarInput>(value) {
        Ok(input) => input.into(),
        Err(err) => {
            tracing::debug!(error = %err, "Ignoring malformed avatar");
            Avatar::default()
        }
    }
}

/// 비어 있으면 기본값, 아니면 trim
fn text_or(value: Option<String>, default: &str) -> String {
    match value {
        Some(v) if !v.is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

/// 분 단위 시간 해석. 0이나 해석 불가 값은 `None` (기본값 사용).
fn parse_duration(value: &Value) -> Option<u32> {
    let minutes = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64))?,
        Value::String(s) => leading_integer(s)?,
        _ => return None,
    };
    match minutes {
        0 => None,
        m => Some(m.clamp(1, i64::from(u32::MAX)) as u32),
    }
}

/// "45min" -> 45, "-3" -> -3
fn leading_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

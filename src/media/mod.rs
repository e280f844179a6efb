//! 클라이언트 측 피어 미디어
//!
//! 방 방문 한 번에 [`Orchestrator`] 하나가 원격 멤버마다 피어 링크를 하나씩
//! 만들고 협상한다. 실제 전송 계층은 [`PeerFactory`] / [`MediaDevices`] 뒤에 숨긴다.

mod devices;
mod orchestrator;
mod peer;
pub mod rtc;

pub use devices::{pump_samples, MediaDevices, SampleDevices};
pub use orchestrator::{MediaCommand, Orchestrator, RoomMediaView};
pub use peer::{LinkEvent, LinkEventKind, LinkEvents, LinkState, PeerFactory, PeerLink, RemoteTrack};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// 미디어 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// 로컬 송신 트랙 (마이크 또는 화면 공유)
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

struct LocalTrackInner {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended: watch::Sender<bool>,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind_label(kind), Uuid::new_v4());
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_string(),
        ));
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(LocalTrackInner {
                id,
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                ended,
                rtp,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Relaxed)
    }

    /// 캡처 중지. 이후 샘플은 버려지고 `ended()`가 깨어난다.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
        self.inner.ended.send_replace(true);
    }

    /// `stop()` 될 때까지 대기
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.rtp.clone()
    }

    /// 비활성(음소거) 또는 중지된 트랙은 샘플을 쓰지 않는다
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        self.inner.rtp.write_sample(sample).await?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// 로컬 미디어 스트림
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(kinds: &[MediaKind]) -> Self {
        let id = Uuid::new_v4().to_string();
        let tracks = kinds.iter().map(|kind| LocalTrack::new(*kind, &id)).collect();
        Self { id, tracks }
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

fn kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

//! 로컬 미디어 장치

use super::{LocalStream, LocalTrack, MediaError, MediaKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use webrtc::media::Sample;

/// opus 무음 프레임 (20ms)
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];
const AUDIO_FRAME: Duration = Duration::from_millis(20);
/// 빈 화면 자리표시 프레임
const BLANK_FRAME: [u8; 10] = [0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];
const VIDEO_FRAME: Duration = Duration::from_millis(100);

/// 마이크 / 화면 캡처 획득
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn microphone(&self) -> Result<LocalStream, MediaError>;
    async fn screen(&self) -> Result<LocalStream, MediaError>;
}

/// 샘플 기반 장치. 트랙에 샘플을 쓰는 것은 호출자의 몫이다.
#[derive(Debug, Clone)]
pub struct SampleDevices {
    microphone: bool,
    screen: bool,
    feed: Option<UnboundedSender<LocalStream>>,
}

impl Default for SampleDevices {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl SampleDevices {
    /// `false`인 장치는 권한 거부 / 사용 불가로 응답한다
    pub fn new(microphone: bool, screen: bool) -> Self {
        Self {
            microphone,
            screen,
            feed: None,
        }
    }

    /// 획득된 스트림을 받아볼 수 있는 채널을 붙인다 (샘플 펌프용)
    pub fn with_feed(mut self) -> (Self, UnboundedReceiver<LocalStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feed = Some(tx);
        (self, rx)
    }

    fn hand_out(&self, stream: LocalStream) -> LocalStream {
        if let Some(feed) = &self.feed {
            let _ = feed.send(stream.clone());
        }
        stream
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn microphone(&self) -> Result<LocalStream, MediaError> {
        if !self.microphone {
            return Err(MediaError::PermissionDenied(
                "Microphone access denied".to_string(),
            ));
        }
        Ok(self.hand_out(LocalStream::new(&[MediaKind::Audio])))
    }

    async fn screen(&self) -> Result<LocalStream, MediaError> {
        if !self.screen {
            return Err(MediaError::Unavailable("Screen capture not available".to_string()));
        }
        Ok(self.hand_out(LocalStream::new(&[MediaKind::Video])))
    }
}

/// 받은 스트림마다 트랙이 멈출 때까지 고정 프레임을 쓴다.
/// 오디오는 opus 무음, 비디오는 빈 화면 자리표시 프레임.
pub async fn pump_samples(mut streams: UnboundedReceiver<LocalStream>) {
    while let Some(stream) = streams.recv().await {
        for track in stream.tracks.iter().cloned() {
            tokio::spawn(pump_track(track));
        }
    }
}

async fn pump_track(track: LocalTrack) {
    let (data, duration): (&'static [u8], Duration) = match track.kind() {
        MediaKind::Audio => (&OPUS_SILENCE[..], AUDIO_FRAME),
        MediaKind::Video => (&BLANK_FRAME[..], VIDEO_FRAME),
    };
    let sample = Sample {
        data: Bytes::from_static(data),
        duration,
        ..Default::default()
    };
    let mut ticker = tokio::time::interval(duration);
    while !track.is_stopped() {
        ticker.tick().await;
        if let Err(err) = track.write_sample(&sample).await {
            tracing::debug!(track_id = %track.id(), error = %err, "Failed to write sample");
        }
    }
    tracing::trace!(track_id = %track.id(), "Sample pump stopped");
}

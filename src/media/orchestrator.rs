//! 피어 연결 오케스트레이터
//!
//! 시그널링 메시지를 받아 원격 멤버마다 피어 링크를 하나씩 만들고 협상한다.
//! 상태는 이 구조체 하나가 소유하며 모든 이벤트는 `run` 루프에서 순서대로 처리된다.
//!
//! offer 충돌을 피하기 위해 닉네임이 사전순으로 앞선 쪽만 offer를 보낸다.
//! 뒤쪽은 상대의 offer를 기다리고, 재협상이 필요하면 `renegotiate` 요청을 보낸다.

use super::{
    LinkEvent, LinkEventKind, LinkEvents, LinkState, LocalStream, LocalTrack, MediaDevices,
    MediaError, MediaKind, PeerFactory, PeerLink, RemoteTrack,
};
use crate::protocol::{RoomEvent, SignalEnvelope, SignalPayload};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// UI에 노출되는 미디어 상태
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomMediaView {
    /// 원격 음성 (닉네임 -> 트랙)
    pub remote_voices: HashMap<String, RemoteTrack>,
    /// 원격 화면 공유 (닉네임 -> 트랙)
    pub remote_screens: HashMap<String, RemoteTrack>,
    /// 연결이 수립된 멤버
    pub connected: BTreeSet<String>,
    pub is_sharing_screen: bool,
    pub mic_error: Option<String>,
}

/// UI 명령
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCommand {
    SetMuted(bool),
    StartScreenShare,
    StopScreenShare,
    Leave,
}

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    link_id: u64,
    /// 보낸 offer의 answer를 기다리는 중
    awaiting_answer: bool,
    /// 한 번이라도 협상이 끝났는지. 이후 재협상 실패는 링크를 유지한다.
    negotiated: bool,
    /// answer를 받은 뒤 다시 offer해야 함
    renegotiate: bool,
}

pub struct Orchestrator {
    nickname: String,
    factory: Arc<dyn PeerFactory>,
    devices: Arc<dyn MediaDevices>,
    signals: UnboundedSender<SignalEnvelope>,
    peers: HashMap<String, PeerEntry>,
    next_link_id: u64,
    link_tx: UnboundedSender<LinkEvent>,
    link_rx: Option<UnboundedReceiver<LinkEvent>>,
    screen_end_tx: UnboundedSender<String>,
    screen_end_rx: Option<UnboundedReceiver<String>>,
    microphone: Option<LocalStream>,
    /// 마이크 획득 시도가 끝났는지 (실패 포함)
    media_ready: bool,
    pending: Vec<String>,
    screen: Option<LocalStream>,
    muted: bool,
    view: watch::Sender<RoomMediaView>,
}

impl Orchestrator {
    pub fn new(
        nickname: impl Into<String>,
        factory: Arc<dyn PeerFactory>,
        devices: Arc<dyn MediaDevices>,
        signals: UnboundedSender<SignalEnvelope>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (screen_end_tx, screen_end_rx) = mpsc::unbounded_channel();
        let (view, _) = watch::channel(RoomMediaView::default());
        Self {
            nickname: nickname.into(),
            factory,
            devices,
            signals,
            peers: HashMap::new(),
            next_link_id: 0,
            link_tx,
            link_rx: Some(link_rx),
            screen_end_tx,
            screen_end_rx: Some(screen_end_rx),
            microphone: None,
            media_ready: false,
            pending: Vec::new(),
            screen: None,
            muted: false,
            view,
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomMediaView> {
        self.view.subscribe()
    }

    pub fn view(&self) -> RoomMediaView {
        self.view.borrow().clone()
    }

    pub fn has_link(&self, remote: &str) -> bool {
        self.peers.contains_key(remote)
    }

    pub fn link_count(&self) -> usize {
        self.peers.len()
    }

    /// 메인 루프. `Leave` 명령이나 시그널링 채널 종료 시 정리 후 반환한다.
    pub async fn run(
        mut self,
        mut inbound: UnboundedReceiver<Value>,
        mut commands: UnboundedReceiver<MediaCommand>,
    ) {
        let (Some(mut link_rx), Some(mut screen_end_rx)) =
            (self.link_rx.take(), self.screen_end_rx.take())
        else {
            tracing::warn!(nickname = %self.nickname, "Orchestrator already running");
            return;
        };

        let devices = self.devices.clone();
        let mut microphone = devices.microphone();
        let mut mic_pending = true;

        loop {
            tokio::select! {
                result = &mut microphone, if mic_pending => {
                    mic_pending = false;
                    self.on_microphone(result).await;
                }
                message = inbound.recv() => match message {
                    Some(value) => self.handle_message(value).await,
                    None => {
                        tracing::info!(nickname = %self.nickname, "Signaling channel closed");
                        break;
                    }
                },
                Some(event) = link_rx.recv() => self.on_link_event(event).await,
                Some(stream_id) = screen_end_rx.recv() => self.on_screen_ended(&stream_id).await,
                command = commands.recv() => match command {
                    Some(MediaCommand::SetMuted(muted)) => self.set_muted(muted),
                    Some(MediaCommand::StartScreenShare) => self.start_screen_share().await,
                    Some(MediaCommand::StopScreenShare) => self.stop_screen_share().await,
                    Some(MediaCommand::Leave) | None => break,
                },
            }
        }

        self.shutdown().await;
    }

    /// 마이크 획득 후 대기 중인 멤버와 연결
    pub async fn acquire_microphone(&mut self) {
        let result = self.devices.microphone().await;
        self.on_microphone(result).await;
    }

    async fn on_microphone(&mut self, result: Result<LocalStream, MediaError>) {
        if self.media_ready {
            return;
        }
        match result {
            Ok(stream) => {
                for track in stream.tracks_of(MediaKind::Audio) {
                    track.set_enabled(!self.muted);
                }
                tracing::info!(nickname = %self.nickname, stream_id = %stream.id, "Microphone ready");
                self.microphone = Some(stream);
                self.view.send_modify(|v| v.mic_error = None);
            }
            Err(err) => {
                tracing::warn!(nickname = %self.nickname, error = %err, "Microphone unavailable, continuing without audio");
                let message = err.to_string();
                self.view.send_modify(|v| v.mic_error = Some(message));
            }
        }
        self.media_ready = true;

        // 마이크 준비 전에 만들어진 링크에는 오디오를 붙이고 재협상
        let audio: Vec<LocalTrack> = self
            .microphone
            .iter()
            .flat_map(|s| s.tracks_of(MediaKind::Audio).cloned())
            .collect();
        if !audio.is_empty() {
            let existing: Vec<String> = self.peers.keys().cloned().collect();
            for remote in existing {
                self.attach_and_renegotiate(&remote, &audio).await;
            }
        }

        let pending = std::mem::take(&mut self.pending);
        for remote in pending {
            self.connect_to(&remote).await;
        }
    }

    /// 시그널링 채널에서 받은 JSON 처리
    pub async fn handle_message(&mut self, value: Value) {
        self.handle_event(RoomEvent::from_value(value)).await;
    }

    pub async fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Members { members } => {
                let names: Vec<String> = members
                    .into_iter()
                    .filter(|name| *name != self.nickname)
                    .collect();
                if self.media_ready {
                    for remote in names {
                        self.connect_to(&remote).await;
                    }
                } else {
                    self.pending.clear();
                    for remote in names {
                        self.queue(remote);
                    }
                }
            }
            RoomEvent::MemberJoined { nickname } => {
                if nickname == self.nickname {
                    return;
                }
                // 링크가 남아 있으면 재입장: 이전 링크는 버린다
                if self.peers.contains_key(&nickname) {
                    tracing::info!(remote = %nickname, "Member rejoined, replacing peer link");
                    self.teardown(&nickname).await;
                }
                if self.media_ready {
                    self.connect_to(&nickname).await;
                } else {
                    self.queue(nickname);
                }
            }
            RoomEvent::Webrtc {
                target,
                from,
                payload,
            } => {
                if target.as_deref() != Some(self.nickname.as_str()) {
                    return;
                }
                let Some(from) = from else {
                    return;
                };
                match payload {
                    SignalPayload::Offer { sdp } => self.handle_offer(&from, sdp).await,
                    SignalPayload::Answer { sdp } => self.handle_answer(&from, sdp).await,
                    SignalPayload::Ice { candidate } => self.handle_ice(&from, candidate).await,
                    SignalPayload::Renegotiate => self.handle_renegotiate_request(&from).await,
                }
            }
            RoomEvent::Other => {}
        }
    }

    fn queue(&mut self, remote: String) {
        if !self.pending.contains(&remote) {
            self.pending.push(remote);
        }
    }

    /// 처음 offer를 보낼 쪽인지
    fn initiates_with(&self, remote: &str) -> bool {
        self.nickname.as_str() < remote
    }

    async fn connect_to(&mut self, remote: &str) {
        if self.peers.contains_key(remote) {
            return;
        }
        if !self.initiates_with(remote) {
            tracing::debug!(nickname = %self.nickname, remote = %remote, "Waiting for offer from remote member");
            return;
        }
        let Some(link) = self.ensure_link(remote).await else {
            return;
        };
        // 상대가 나중에 보낼 트랙도 이 offer의 섹션으로 받는다
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if let Err(err) = link.receive(kind).await {
                tracing::warn!(remote = %remote, kind = ?kind, error = %err, "Failed to prepare receiver");
            }
        }
        self.send_offer(remote).await;
    }

    /// 로컬 트랙 변경 후 재협상. offer는 보내는 쪽만 만든다.
    async fn renegotiate(&mut self, remote: &str) {
        if !self.initiates_with(remote) {
            tracing::debug!(remote = %remote, "Requesting renegotiation");
            self.signal(remote, SignalPayload::Renegotiate);
            return;
        }
        match self.peers.get_mut(remote) {
            Some(entry) if entry.awaiting_answer => entry.renegotiate = true,
            Some(_) => self.send_offer(remote).await,
            None => {}
        }
    }

    async fn handle_renegotiate_request(&mut self, from: &str) {
        if !self.initiates_with(from) || !self.peers.contains_key(from) {
            tracing::debug!(remote = %from, "Ignoring renegotiation request");
            return;
        }
        self.renegotiate(from).await;
    }

    /// 링크가 없으면 만들고 로컬 트랙을 붙인다
    async fn ensure_link(&mut self, remote: &str) -> Option<Arc<dyn PeerLink>> {
        if let Some(entry) = self.peers.get(remote) {
            return Some(entry.link.clone());
        }

        self.next_link_id += 1;
        let link_id = self.next_link_id;
        let events = LinkEvents::new(remote, link_id, self.link_tx.clone());
        let link = match self.factory.create_link(events).await {
            Ok(link) => link,
            Err(err) => {
                tracing::warn!(remote = %remote, error = %err, "Failed to create peer link");
                return None;
            }
        };

        for track in self.outgoing_tracks() {
            if let Err(err) = link.add_track(&track).await {
                tracing::warn!(remote = %remote, track_id = %track.id(), error = %err, "Failed to attach local track");
            }
        }

        self.peers.insert(
            remote.to_string(),
            PeerEntry {
                link: link.clone(),
                link_id,
                awaiting_answer: false,
                negotiated: false,
                renegotiate: false,
            },
        );
        tracing::info!(nickname = %self.nickname, remote = %remote, link_id, "Peer link created");
        Some(link)
    }

    fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        let audio = self
            .microphone
            .iter()
            .flat_map(|s| s.tracks_of(MediaKind::Audio).cloned());
        let screen = self.screen.iter().flat_map(|s| s.tracks.iter().cloned());
        audio.chain(screen).collect()
    }

    async fn send_offer(&mut self, remote: &str) {
        let Some(link) = self.link(remote) else {
            return;
        };
        let result = async {
            let offer = link.create_offer().await?;
            link.set_local_description(offer.clone()).await?;
            Ok::<_, MediaError>(offer)
        }
        .await;

        match result {
            Ok(offer) => {
                if let Some(entry) = self.peers.get_mut(remote) {
                    entry.awaiting_answer = true;
                }
                tracing::debug!(remote = %remote, "Sending offer");
                self.signal(remote, SignalPayload::Offer { sdp: offer });
            }
            Err(err) => self.negotiation_failed(remote, "offer", err).await,
        }
    }

    async fn handle_offer(&mut self, from: &str, sdp: RTCSessionDescription) {
        if self.peers.get(from).is_some_and(|e| e.awaiting_answer) {
            tracing::debug!(remote = %from, "Ignoring colliding offer");
            return;
        }

        let Some(link) = self.ensure_link(from).await else {
            return;
        };
        let result = async {
            link.set_remote_description(sdp).await?;
            let answer = link.create_answer().await?;
            link.set_local_description(answer.clone()).await?;
            Ok::<_, MediaError>(answer)
        }
        .await;

        match result {
            Ok(answer) => {
                if let Some(entry) = self.peers.get_mut(from) {
                    entry.negotiated = true;
                }
                tracing::debug!(remote = %from, "Sending answer");
                self.signal(from, SignalPayload::Answer { sdp: answer });
            }
            Err(err) => self.negotiation_failed(from, "answer", err).await,
        }
    }

    async fn handle_answer(&mut self, from: &str, sdp: RTCSessionDescription) {
        let Some(link) = self.link(from) else {
            tracing::debug!(remote = %from, "Answer for unknown peer link");
            return;
        };
        match link.set_remote_description(sdp).await {
            Ok(()) => {
                let mut again = false;
                if let Some(entry) = self.peers.get_mut(from) {
                    entry.awaiting_answer = false;
                    entry.negotiated = true;
                    again = std::mem::take(&mut entry.renegotiate);
                }
                if again {
                    self.send_offer(from).await;
                }
            }
            Err(err) => self.negotiation_failed(from, "remote answer", err).await,
        }
    }

    /// 원격 설명 전에 도착한 후보 등은 버린다
    async fn handle_ice(&mut self, from: &str, candidate: RTCIceCandidateInit) {
        let Some(link) = self.link(from) else {
            return;
        };
        if let Err(err) = link.add_ice_candidate(candidate).await {
            tracing::debug!(remote = %from, error = %err, "Discarded ICE candidate");
        }
    }

    /// 첫 협상 실패는 링크 제거, 재협상 실패는 기록만 한다
    async fn negotiation_failed(&mut self, remote: &str, step: &str, err: MediaError) {
        let negotiated = self.peers.get(remote).is_some_and(|e| e.negotiated);
        tracing::warn!(remote = %remote, step = %step, error = %err, negotiated, "Negotiation failed");
        if !negotiated {
            self.teardown(remote).await;
        }
    }

    pub async fn on_link_event(&mut self, event: LinkEvent) {
        let current = self.peers.get(&event.remote).map(|e| e.link_id);
        if current != Some(event.link_id) {
            tracing::trace!(remote = %event.remote, link_id = event.link_id, "Stale link event");
            return;
        }

        let remote = event.remote;
        match event.kind {
            LinkEventKind::LocalCandidate(candidate) => {
                self.signal(&remote, SignalPayload::Ice { candidate });
            }
            LinkEventKind::RemoteTrack(track) => {
                tracing::info!(remote = %remote, kind = ?track.kind, "Remote track arrived");
                self.view.send_modify(|v| match track.kind {
                    MediaKind::Audio => {
                        v.remote_voices.insert(remote.clone(), track);
                    }
                    MediaKind::Video => {
                        v.remote_screens.insert(remote.clone(), track);
                    }
                });
            }
            LinkEventKind::StateChanged(state) => {
                tracing::debug!(remote = %remote, state = ?state, "Peer link state changed");
                let connected = state == LinkState::Connected;
                self.view.send_if_modified(|v| {
                    if connected {
                        v.connected.insert(remote.clone())
                    } else {
                        v.connected.remove(&remote)
                    }
                });
                if state.is_terminal() {
                    self.teardown(&remote).await;
                }
            }
        }
    }

    /// 링크 제거 및 해당 멤버의 원격 스트림 정리
    async fn teardown(&mut self, remote: &str) {
        let Some(entry) = self.peers.remove(remote) else {
            return;
        };
        if let Err(err) = entry.link.close().await {
            tracing::debug!(remote = %remote, error = %err, "Error closing peer link");
        }
        self.view.send_modify(|v| {
            v.remote_voices.remove(remote);
            v.remote_screens.remove(remote);
            v.connected.remove(remote);
        });
        tracing::info!(nickname = %self.nickname, remote = %remote, "Peer link torn down");
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(stream) = &self.microphone {
            for track in stream.tracks_of(MediaKind::Audio) {
                track.set_enabled(!muted);
            }
        }
    }

    /// 화면 공유 시작: 모든 링크에 비디오 트랙을 붙이고 재협상
    pub async fn start_screen_share(&mut self) {
        if self.screen.is_some() {
            tracing::debug!("Screen share already active");
            return;
        }
        let stream = match self.devices.screen().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "Screen capture failed");
                return;
            }
        };

        self.watch_screen_end(&stream);
        self.screen = Some(stream.clone());
        self.view.send_modify(|v| v.is_sharing_screen = true);
        tracing::info!(stream_id = %stream.id, links = self.peers.len(), "Screen share started");

        let remotes: Vec<String> = self.peers.keys().cloned().collect();
        for remote in remotes {
            self.attach_and_renegotiate(&remote, &stream.tracks).await;
        }
    }

    async fn attach_and_renegotiate(&mut self, remote: &str, tracks: &[LocalTrack]) {
        let Some(link) = self.link(remote) else {
            return;
        };
        for track in tracks {
            if let Err(err) = link.add_track(track).await {
                tracing::warn!(remote = %remote, track_id = %track.id(), error = %err, "Failed to attach local track");
            }
        }
        self.renegotiate(remote).await;
    }

    fn watch_screen_end(&self, stream: &LocalStream) {
        let Some(track) = stream.tracks_of(MediaKind::Video).next().cloned() else {
            return;
        };
        let stream_id = stream.id.clone();
        let tx = self.screen_end_tx.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = tx.send(stream_id);
        });
    }

    async fn on_screen_ended(&mut self, stream_id: &str) {
        if self.screen.as_ref().is_some_and(|s| s.id == stream_id) {
            tracing::info!("Screen capture ended");
            self.stop_screen_share().await;
        }
    }

    /// 화면 공유 중지: 캡처를 멈추고 송신 트랙만 떼어낸다 (링크 유지)
    pub async fn stop_screen_share(&mut self) {
        let Some(stream) = self.screen.take() else {
            return;
        };
        stream.stop();
        for (remote, entry) in &self.peers {
            for track in &stream.tracks {
                if let Err(err) = entry.link.remove_track(track).await {
                    tracing::debug!(remote = %remote, error = %err, "Failed to detach screen track");
                }
            }
        }
        self.view.send_modify(|v| v.is_sharing_screen = false);
        tracing::info!(stream_id = %stream.id, "Screen share stopped");
    }

    /// 방 퇴장: 모든 링크를 닫고 로컬 트랙을 멈춘다
    pub async fn shutdown(&mut self) {
        let peers: Vec<(String, PeerEntry)> = self.peers.drain().collect();
        for (remote, entry) in peers {
            if let Err(err) = entry.link.close().await {
                tracing::debug!(remote = %remote, error = %err, "Error closing peer link");
            }
        }
        if let Some(mic) = self.microphone.take() {
            mic.stop();
        }
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        self.pending.clear();
        self.view.send_modify(|v| {
            v.remote_voices.clear();
            v.remote_screens.clear();
            v.connected.clear();
            v.is_sharing_screen = false;
        });
        tracing::info!(nickname = %self.nickname, "Room media shut down");
    }

    fn link(&self, remote: &str) -> Option<Arc<dyn PeerLink>> {
        self.peers.get(remote).map(|e| e.link.clone())
    }

    fn signal(&self, target: &str, payload: SignalPayload) {
        let kind = payload.kind();
        if self.signals.send(SignalEnvelope::new(target, payload)).is_err() {
            tracing::trace!(target_member = %target, kind, "Signaling channel closed, dropped signal");
        }
    }
}

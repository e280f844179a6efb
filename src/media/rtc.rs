//! webrtc-rs 기반 피어 링크

use super::{
    LinkEvents, LinkState, LocalTrack, MediaError, MediaKind, PeerFactory, PeerLink, RemoteTrack,
};
use crate::config::MediaConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;

/// 설정된 ICE 서버로 피어 연결을 만든다
pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(config: &MediaConfig) -> Result<Self, MediaError> {
        Self::with_settings(config, SettingEngine::default())
    }

    /// 네트워크 설정(포트 범위, 가상 네트워크 등)을 직접 지정
    pub fn with_settings(config: &MediaConfig, settings: SettingEngine) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create_link(&self, events: LinkEvents) -> Result<Arc<dyn PeerLink>, MediaError> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);
        wire_events(&pc, events);
        Ok(Arc::new(RtcLink {
            pc,
            senders: Mutex::new(HashMap::new()),
            drained: Mutex::new(Vec::new()),
        }))
    }
}

fn wire_events(pc: &Arc<RTCPeerConnection>, events: LinkEvents) {
    let ice_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let events = ice_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.local_candidate(init),
                Err(err) => {
                    tracing::debug!(remote = %events.remote(), error = %err, "Failed to serialize ICE candidate")
                }
            }
        })
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events = track_events.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Video => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            tracing::debug!(remote = %events.remote(), track_id = %track.id(), kind = ?kind, "Remote track arrived");
            events.remote_track(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            });

            // 재생 계층이 없으므로 RTP는 읽어서 버린다
            let remote = events.remote().to_string();
            tokio::spawn(async move {
                while track.read_rtp().await.is_ok() {}
                tracing::trace!(remote = %remote, "Remote track ended");
            });
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            events.state_changed(map_state(state));
        })
    }));
}

fn map_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

/// RTCPeerConnection 래퍼. 트랙 제거를 위해 송신자를 트랙 id로 보관한다.
///
/// 트랙을 뗀 송신자는 멈추지 않고 비워 둔다. 다음 트랙은 같은 종류의 빈
/// 트랜시버를 다시 쓰므로 offer를 만들지 않는 쪽도 이미 협상된 섹션으로 보낼 수 있다.
pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    /// RTCP를 읽고 있는 송신자
    drained: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl RtcLink {
    /// 보내는 트랙이 없는 같은 종류의 트랜시버
    async fn idle_transceiver(&self, kind: MediaKind) -> Option<(Arc<RTCRtpTransceiver>, Arc<RTCRtpSender>)> {
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() != codec_type(kind) {
                continue;
            }
            let sender = transceiver.sender().await;
            if sender.track().await.is_none() {
                return Some((transceiver, sender));
            }
        }
        None
    }

    async fn transceiver_of(&self, sender: &Arc<RTCRtpSender>) -> Option<Arc<RTCRtpTransceiver>> {
        for transceiver in self.pc.get_transceivers().await {
            if Arc::ptr_eq(&transceiver.sender().await, sender) {
                return Some(transceiver);
            }
        }
        None
    }

    /// RTCP를 읽어야 인터셉터가 동작한다
    async fn drain_rtcp(&self, sender: &Arc<RTCRtpSender>) {
        let mut drained = self.drained.lock().await;
        if drained.iter().any(|s| Arc::ptr_eq(s, sender)) {
            return;
        }
        drained.push(sender.clone());
        let rtcp = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let mut senders = self.senders.lock().await;
        if senders.contains_key(track.id()) {
            return Ok(());
        }
        let local: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        let sender = match self.idle_transceiver(track.kind()).await {
            Some((transceiver, sender)) => {
                sender.replace_track(Some(local)).await?;
                let direction =
                    RTCRtpTransceiverDirection::from_send_recv(true, transceiver.direction().has_recv());
                transceiver.set_direction(direction).await;
                sender
            }
            None => self.pc.add_track(local).await?,
        };
        self.drain_rtcp(&sender).await;
        senders.insert(track.id().to_string(), sender);
        Ok(())
    }

    async fn remove_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let sender = self.senders.lock().await.remove(track.id());
        let Some(sender) = sender else {
            return Ok(());
        };
        sender.replace_track(None).await?;
        if let Some(transceiver) = self.transceiver_of(&sender).await {
            let direction =
                RTCRtpTransceiverDirection::from_send_recv(false, transceiver.direction().has_recv());
            transceiver.set_direction(direction).await;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, MediaError> {
        Ok(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, MediaError> {
        Ok(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<(), MediaError> {
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), MediaError> {
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn receive(&self, kind: MediaKind) -> Result<(), MediaError> {
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() == codec_type(kind) {
                return Ok(());
            }
        }
        self.pc
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), MediaError> {
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.senders.lock().await.clear();
        self.drained.lock().await.clear();
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{pump_samples, MediaCommand, Orchestrator, RoomMediaView, SampleDevices};
    use crate::protocol::SignalEnvelope;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};
    use tokio::task::JoinHandle;
    use webrtc::ice::mdns::MulticastDnsMode;
    use webrtc::util::vnet::net::{Net, NetConfig};
    use webrtc::util::vnet::router::{Router, RouterConfig};

    fn factory() -> RtcPeerFactory {
        RtcPeerFactory::new(&MediaConfig::default()).unwrap()
    }

    #[test]
    fn connection_states_map_to_link_states() {
        assert_eq!(map_state(RTCPeerConnectionState::Connected), LinkState::Connected);
        assert!(map_state(RTCPeerConnectionState::Failed).is_terminal());
        assert!(map_state(RTCPeerConnectionState::Closed).is_terminal());
        assert!(!map_state(RTCPeerConnectionState::Disconnected).is_terminal());
        assert_eq!(map_state(RTCPeerConnectionState::New), LinkState::New);
    }

    #[test]
    fn configuration_uses_configured_ice_servers() {
        let config = factory().configuration();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(
            config.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
    }

    #[test]
    fn empty_server_list_means_host_candidates_only() {
        let factory = RtcPeerFactory::new(&MediaConfig {
            ice_servers: Vec::new(),
        })
        .unwrap();
        assert!(factory.configuration().ice_servers.is_empty());
    }

    #[tokio::test]
    async fn receiving_video_adds_a_video_section() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory()
            .create_link(LinkEvents::new("Ben", 1, tx))
            .await
            .unwrap();
        let track = LocalTrack::new(MediaKind::Audio, "stream");
        link.add_track(&track).await.unwrap();
        link.receive(MediaKind::Audio).await.unwrap();
        link.receive(MediaKind::Video).await.unwrap();
        link.receive(MediaKind::Video).await.unwrap();

        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.sdp.matches("m=audio").count(), 1);
        assert_eq!(offer.sdp.matches("m=video").count(), 1);
        assert!(offer.sdp.contains("a=recvonly"));
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn tracks_reuse_idle_sections() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory()
            .create_link(LinkEvents::new("Ben", 1, tx))
            .await
            .unwrap();
        link.receive(MediaKind::Video).await.unwrap();
        let first = LocalTrack::new(MediaKind::Video, "screen-1");
        link.add_track(&first).await.unwrap();
        link.remove_track(&first).await.unwrap();
        // 공유를 다시 시작해도 새 섹션은 생기지 않는다
        let second = LocalTrack::new(MediaKind::Video, "screen-2");
        link.add_track(&second).await.unwrap();

        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.sdp.matches("m=video").count(), 1);
        assert!(offer.sdp.contains("a=sendrecv"));
        link.close().await.unwrap();
    }

    struct Member {
        view: watch::Receiver<RoomMediaView>,
        inbound: mpsc::UnboundedSender<Value>,
        commands: mpsc::UnboundedSender<MediaCommand>,
        task: JoinHandle<()>,
    }

    /// 가상 라우터에 고정 IP로 붙은 네트워크 설정
    async fn vnet_settings(wan: &Arc<Mutex<Router>>, ip: &str) -> SettingEngine {
        let net = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![ip.to_owned()],
            ..Default::default()
        })));
        let nic = net.get_nic().unwrap();
        wan.lock().await.add_net(Arc::clone(&nic)).await.unwrap();
        nic.lock().await.set_router(Arc::clone(wan)).await.unwrap();

        let mut settings = SettingEngine::default();
        settings.set_vnet(Some(net));
        settings.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
        settings
    }

    fn spawn_member(nickname: &str, settings: SettingEngine) -> (Member, mpsc::UnboundedReceiver<SignalEnvelope>) {
        let factory = RtcPeerFactory::with_settings(
            &MediaConfig {
                ice_servers: Vec::new(),
            },
            settings,
        )
        .unwrap();
        let (devices, streams) = SampleDevices::default().with_feed();
        tokio::spawn(pump_samples(streams));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let orch = Orchestrator::new(nickname, Arc::new(factory), Arc::new(devices), signal_tx);
        let view = orch.subscribe();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(orch.run(inbound_rx, command_rx));
        (
            Member {
                view,
                inbound,
                commands,
                task,
            },
            signal_rx,
        )
    }

    /// 서버 중계를 흉내: `from`을 찍어서 상대에게 전달
    fn relay(from: &'static str, mut signals: mpsc::UnboundedReceiver<SignalEnvelope>, to: mpsc::UnboundedSender<Value>) {
        tokio::spawn(async move {
            while let Some(envelope) = signals.recv().await {
                let mut value = serde_json::to_value(&envelope).unwrap();
                value["from"] = json!(from);
                if to.send(value).is_err() {
                    break;
                }
            }
        });
    }

    async fn wait_until(view: &mut watch::Receiver<RoomMediaView>, what: &str, f: impl FnMut(&RoomMediaView) -> bool) {
        tokio::time::timeout(Duration::from_secs(20), view.wait_for(f))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .map(|_| ())
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn members_connect_and_responder_screen_arrives() {
        let wan = Arc::new(Mutex::new(
            Router::new(RouterConfig {
                cidr: "10.0.0.0/24".to_owned(),
                ..Default::default()
            })
            .unwrap(),
        ));
        let ann_settings = vnet_settings(&wan, "10.0.0.1").await;
        let ben_settings = vnet_settings(&wan, "10.0.0.2").await;
        wan.lock().await.start().await.unwrap();

        let (mut ann, ann_signals) = spawn_member("Ann", ann_settings);
        let (mut ben, ben_signals) = spawn_member("Ben", ben_settings);
        relay("Ann", ann_signals, ben.inbound.clone());
        relay("Ben", ben_signals, ann.inbound.clone());

        ann.inbound.send(json!({"type": "members", "members": []})).unwrap();
        ben.inbound.send(json!({"type": "members", "members": ["Ann"]})).unwrap();
        ann.inbound.send(json!({"type": "member_joined", "nickname": "Ben"})).unwrap();

        wait_until(&mut ann.view, "Ann to hear Ben", |v| {
            v.connected.contains("Ben") && v.remote_voices.contains_key("Ben")
        })
        .await;
        wait_until(&mut ben.view, "Ben to hear Ann", |v| {
            v.connected.contains("Ann") && v.remote_voices.contains_key("Ann")
        })
        .await;

        // offer를 보내지 않는 쪽의 화면도 도착해야 한다
        ben.commands.send(MediaCommand::StartScreenShare).unwrap();
        wait_until(&mut ann.view, "Ben's screen at Ann", |v| v.remote_screens.contains_key("Ben")).await;
        assert!(ben.view.borrow().is_sharing_screen);
        assert!(ann.view.borrow().connected.contains("Ben"));

        ann.commands.send(MediaCommand::Leave).unwrap();
        ben.commands.send(MediaCommand::Leave).unwrap();
        tokio::time::timeout(Duration::from_secs(5), ann.task).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), ben.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn offer_includes_added_audio_track() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory()
            .create_link(LinkEvents::new("Ben", 1, tx))
            .await
            .unwrap();
        let track = LocalTrack::new(MediaKind::Audio, "stream");
        link.add_track(&track).await.unwrap();
        // 같은 트랙을 두 번 붙여도 송신자는 하나
        link.add_track(&track).await.unwrap();

        let offer = link.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        link.remove_track(&track).await.unwrap();
        link.close().await.unwrap();
    }
}

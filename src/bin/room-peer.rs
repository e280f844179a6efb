//! 헤드리스 방 참가자
//!
//! 시그널링 서버에 접속해 다른 멤버들과 피어 연결을 맺는다.
//! 마이크 대신 opus 무음 프레임, 화면 대신 빈 프레임을 보낸다.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use studymate_signaling::client::SignalingClient;
use studymate_signaling::config::Config;
use studymate_signaling::media::rtc::RtcPeerFactory;
use studymate_signaling::media::{pump_samples, MediaCommand, Orchestrator, SampleDevices};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "room-peer")]
#[command(about = "Headless StudyMate room participant")]
struct Args {
    #[arg(long, default_value = "http://localhost:3001", value_name = "URL", help = "Signaling server base URL")]
    server: String,
    #[arg(long = "room-id", value_name = "ID", help = "Room to join")]
    room_id: String,
    #[arg(long, default_value = "Anonymous", help = "Display name")]
    nickname: String,
    #[arg(long, help = "Join with the microphone muted")]
    muted: bool,
    #[arg(long, help = "Behave as if microphone access was denied")]
    no_mic: bool,
    #[arg(long, help = "Share a (blank) screen after joining")]
    screen: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let factory = RtcPeerFactory::new(&config.media).context("failed to initialize WebRTC")?;
    let (devices, streams) = SampleDevices::new(!args.no_mic, true).with_feed();
    tokio::spawn(pump_samples(streams));

    let client = SignalingClient::connect(&args.server, &args.room_id, &args.nickname)
        .await
        .context("failed to connect to signaling server")?;
    tracing::info!(room_id = %args.room_id, nickname = %args.nickname, "Joined room channel");

    let orchestrator = Orchestrator::new(
        args.nickname.clone(),
        Arc::new(factory),
        Arc::new(devices),
        client.outbound.clone(),
    );
    let mut view = orchestrator.subscribe();
    let (commands, command_rx) = mpsc::unbounded_channel();
    if args.muted {
        let _ = commands.send(MediaCommand::SetMuted(true));
    }
    if args.screen {
        let _ = commands.send(MediaCommand::StartScreenShare);
    }

    let SignalingClient { inbound, .. } = client;
    let mut run = tokio::spawn(orchestrator.run(inbound, command_rx));

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = view.borrow_and_update().clone();
                let mut voices: Vec<&String> = snapshot.remote_voices.keys().collect();
                voices.sort();
                let mut screens: Vec<&String> = snapshot.remote_screens.keys().collect();
                screens.sort();
                tracing::info!(
                    connected = ?snapshot.connected,
                    voices = ?voices,
                    screens = ?screens,
                    sharing = snapshot.is_sharing_screen,
                    mic_error = ?snapshot.mic_error,
                    "Room media updated"
                );
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "Failed to listen for shutdown signal");
                }
                let _ = commands.send(MediaCommand::Leave);
                break;
            }
            _ = &mut run => {
                tracing::info!("Room session ended");
                return Ok(());
            }
        }
    }

    run.await.context("orchestrator task failed")?;
    tracing::info!("Left room");
    Ok(())
}

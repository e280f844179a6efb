//! 시그널링 WebSocket 클라이언트

use crate::protocol::SignalEnvelope;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// 방 채널에 연결된 클라이언트
pub struct SignalingClient {
    /// 수신한 JSON 객체
    pub inbound: UnboundedReceiver<Value>,
    /// 보낼 협상 메시지
    pub outbound: UnboundedSender<SignalEnvelope>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(base_url: &str, room_id: &str, nickname: &str) -> Result<Self, ClientError> {
        let url = channel_url(base_url, room_id, nickname)?;
        let (ws_stream, _) = connect_async(url.to_string()).await?;
        tracing::info!(url = %url, "Connected to signaling server");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Value>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to serialize signal: {}", e);
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value @ Value::Object(_)) => {
                            if inbound_tx.send(value).is_err() {
                                break;
                            }
                        }
                        _ => tracing::debug!("Ignoring non-object message"),
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            tracing::info!(code = u16::from(frame.code), reason = %frame.reason, "Server closed channel");
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            inbound,
            outbound,
            reader,
            writer,
        })
    }

    /// 채널 종료. 남은 송신 메시지는 버린다.
    pub fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// `http(s)://` 주소는 `ws(s)://`로 바꾸고 `/ws?roomId=..&nickname=..`를 붙인다
pub fn channel_url(base_url: &str, room_id: &str, nickname: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ClientError::UnsupportedScheme(other.to_string())),
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
    }
    url.set_path("/ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("roomId", room_id)
        .append_pair("nickname", nickname);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::SignalPayload;
    use crate::server::build_router;
    use crate::state::AppState;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

    #[test]
    fn channel_url_encodes_query() {
        let url = channel_url("http://localhost:3001", "room 1", "Ann & Co").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:3001/ws?roomId=room+1&nickname=Ann+%26+Co"
        );
        let url = channel_url("https://study.example/api", "r", "n").unwrap();
        assert_eq!(url.as_str(), "wss://study.example/ws?roomId=r&nickname=n");
        assert!(matches!(
            channel_url("ftp://x", "r", "n"),
            Err(ClientError::UnsupportedScheme(_))
        ));
        assert!(matches!(channel_url("not a url", "r", "n"), Err(ClientError::InvalidUrl(_))));
    }

    async fn spawn_server() -> String {
        let state = Arc::new(AppState::new(Config::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn next(client: &mut SignalingClient) -> Value {
        tokio::time::timeout(Duration::from_secs(2), client.inbound.recv())
            .await
            .expect("message in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn clients_exchange_signals_through_server() {
        let base = spawn_server().await;
        let mut ann = SignalingClient::connect(&base, "room-1", "Ann").await.unwrap();
        assert_eq!(next(&mut ann).await, json!({"type": "members", "members": []}));

        let mut ben = SignalingClient::connect(&base, "room-1", "Ben").await.unwrap();
        assert_eq!(next(&mut ben).await, json!({"type": "members", "members": ["Ann"]}));
        assert_eq!(next(&mut ann).await, json!({"type": "member_joined", "nickname": "Ben"}));

        let candidate = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".into(),
            ..Default::default()
        };
        ann.outbound
            .send(SignalEnvelope::new("Ben", SignalPayload::Ice { candidate }))
            .unwrap();

        let relayed = next(&mut ben).await;
        assert_eq!(relayed["type"], "webrtc");
        assert_eq!(relayed["target"], "Ben");
        assert_eq!(relayed["from"], "Ann");
        assert_eq!(relayed["payload"]["type"], "ice");

        ann.close();
        ben.close();
    }
}

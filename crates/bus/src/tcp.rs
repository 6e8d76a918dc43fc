//! JSON-lines-over-TCP bus client.
//!
//! One TCP connection to the bus fabric carries both directions. Each line is
//! one frame: `{"channel": c, "message": {"method": m, "params": …}}` for
//! traffic, `{"subscribe": c}` to register interest in a channel. A dedicated
//! writer task serializes all outgoing lines; a reader task fans incoming
//! frames out to local subscribers.

use std::{collections::HashMap, sync::Arc};

use {
    futures::{SinkExt, stream::StreamExt},
    serde::{Deserialize, Serialize},
    tokio::{
        net::TcpStream,
        sync::{RwLock, mpsc},
    },
    tokio_util::codec::{FramedRead, FramedWrite, LinesCodec},
    tracing::{debug, warn},
};

use wsbridge_protocol::BusMessage;

use crate::{Bus, BusError};

// ── Wire frames ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireFrame {
    Publish { channel: String, message: BusMessage },
    Subscribe { subscribe: String },
}

type Subscribers = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<BusMessage>>>>;

// ── TCP bus ──────────────────────────────────────────────────────────────────

/// Bus client over a single TCP connection.
pub struct TcpBus {
    outgoing: mpsc::UnboundedSender<String>,
    subscribers: Subscribers,
}

impl TcpBus {
    /// Connect to the bus fabric. A failure here is fatal to the process.
    pub async fn connect(host: &str, port: u16) -> Result<Self, BusError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(BusError::Connect)?;
        let (read_half, write_half) = stream.into_split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));

        // Writer: the only task that touches the write half.
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, LinesCodec::new());
            while let Some(line) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    warn!(error = %e, "bus write failed");
                    break;
                }
            }
        });

        // Reader: fans incoming frames out to subscribers.
        let reader_subscribers = Arc::clone(&subscribers);
        tokio::spawn(async move {
            let mut lines = FramedRead::new(read_half, LinesCodec::new());
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "bus read failed");
                        break;
                    },
                };
                let frame: WireFrame = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "undecodable bus frame");
                        continue;
                    },
                };
                let WireFrame::Publish { channel, message } = frame else {
                    continue;
                };
                let guard = reader_subscribers.read().await;
                match guard.get(&channel) {
                    Some(sender) => {
                        let _ = sender.send(message);
                    },
                    None => debug!(channel, "bus message for channel without subscriber"),
                }
            }
            // Dropping the senders ends every subscriber stream.
            reader_subscribers.write().await.clear();
        });

        Ok(Self {
            outgoing,
            subscribers,
        })
    }

    fn send_line(&self, frame: &WireFrame) -> Result<(), BusError> {
        let line = serde_json::to_string(frame)?;
        self.outgoing.send(line).map_err(|_| BusError::Closed)
    }
}

#[async_trait::async_trait]
impl Bus for TcpBus {
    async fn publish(&self, channel: &str, message: BusMessage) -> Result<(), BusError> {
        self.send_line(&WireFrame::Publish {
            channel: channel.to_string(),
            message,
        })
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, BusError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .insert(channel.to_string(), sender);
        self.send_line(&WireFrame::Subscribe {
            subscribe: channel.to_string(),
        })?;
        Ok(receiver)
    }
}

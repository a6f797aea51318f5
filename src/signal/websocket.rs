//! Signaling socket
//!
//! The signal client talks to the socket through `SignalConnector` and
//! `SignalSocket`. Inbound frames and the final close are delivered in order
//! on the receiver returned by `connect`.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(Frame),
    /// Terminal; `None` when the close was clean
    Closed(Option<Error>),
}

pub trait SignalSocket: Send + Sync {
    fn send(&self, frame: Frame) -> Result<()>;

    fn close(&self);
}

#[async_trait]
pub trait SignalConnector: Send + Sync {
    async fn connect(
        &self,
        url: &Url,
    ) -> Result<(Arc<dyn SignalSocket>, mpsc::UnboundedReceiver<SocketEvent>)>;
}

/// tokio-tungstenite backed connector
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

struct WebSocketHandle {
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
}

impl SignalSocket for WebSocketHandle {
    fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Socket("socket is closed".to_string()));
        }
        let msg = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.outbound
            .send(msg)
            .map_err(|_| Error::Socket("socket writer is gone".to_string()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Message::Close(None));
        }
    }
}

#[async_trait]
impl SignalConnector for WebSocketConnector {
    async fn connect(
        &self,
        url: &Url,
    ) -> Result<(Arc<dyn SignalSocket>, mpsc::UnboundedReceiver<SocketEvent>)> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        debug!("Signal socket connected to {}", url.host_str().unwrap_or_default());

        let (write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut write = write;
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Signal socket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let pong_tx = outbound_tx.clone();
        tokio::spawn(async move {
            let mut close_error = None;
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let _ = event_tx.send(SocketEvent::Message(Frame::Text(text.to_string())));
                    }
                    Ok(Message::Binary(data)) => {
                        let _ = event_tx.send(SocketEvent::Message(Frame::Binary(data.to_vec())));
                    }
                    Ok(Message::Ping(ping)) => {
                        let _ = pong_tx.send(Message::Pong(ping));
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Frame(_)) => {}
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            debug!("Signal socket closed by server: {} {}", frame.code, frame.reason);
                        }
                        break;
                    }
                    Err(e) => {
                        warn!("Signal socket error: {}", e);
                        close_error = Some(Error::from(e));
                        break;
                    }
                }
            }
            let _ = event_tx.send(SocketEvent::Closed(close_error));
        });

        let handle = WebSocketHandle {
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(handle), event_rx))
    }
}

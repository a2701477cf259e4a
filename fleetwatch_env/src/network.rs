//! Push-channel transport abstraction for live fleet events.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EnvError;
use crate::types::AgencyId;

/// A single frame delivered by the push channel.
///
/// The payload is opaque bytes; decoding into typed events happens once, in
/// the reconciler, at the channel boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFrame {
    /// Raw event bytes (JSON in production)
    pub payload: Vec<u8>,
}

impl LiveFrame {
    /// Creates a new frame from payload bytes.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Abstraction for opening the server-initiated event stream of an agency.
///
/// # Implementations
///
/// - **Production**: a websocket / SSE adapter feeding a `LiveSender`
/// - **Simulation**: `SimLiveTransport`, driven by test code
///
/// # Frame Flow
///
/// ```text
/// Backend                  LiveSender                 LiveChannel
///   |-- event ---------------->|                          |
///   |                          |-- frame ---------------->|-- recv() -> Ok(frame)
///   |-- error ---------------->|-- fail(err) ------------>|-- recv() -> Err(err)
///   |-- close ---------------->| (dropped)                |-- recv() -> None
/// ```
#[async_trait]
pub trait LiveTransport: Send + Sync + 'static {
    /// Opens a long-lived channel for all vehicles of `agency`.
    ///
    /// # Returns
    /// * `Ok(channel)` - The channel is connected and joined to the agency group
    /// * `Err(EnvError)` - The connection could not be established
    async fn open_live_channel(&self, agency: &AgencyId) -> Result<LiveChannel, EnvError>;
}

/// Receiving end of a live event channel.
#[derive(Debug)]
pub struct LiveChannel {
    rx: mpsc::Receiver<Result<LiveFrame, EnvError>>,
}

impl LiveChannel {
    /// Creates a connected sender/channel pair with the given buffer size.
    pub fn pair(buffer: usize) -> (LiveSender, LiveChannel) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (LiveSender { tx }, LiveChannel { rx })
    }

    /// Receives the next frame.
    ///
    /// # Returns
    /// * `Some(Ok(frame))` - A frame arrived
    /// * `Some(Err(e))` - The channel reported an error; treat it as broken
    /// * `None` - The channel was closed
    pub async fn recv(&mut self) -> Option<Result<LiveFrame, EnvError>> {
        self.rx.recv().await
    }

    /// Closes the receiving side. Pending frames are discarded.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Sending end of a live event channel, held by the transport adapter.
#[derive(Debug, Clone)]
pub struct LiveSender {
    tx: mpsc::Sender<Result<LiveFrame, EnvError>>,
}

impl LiveSender {
    /// Delivers a frame to the channel.
    pub async fn send(&self, frame: LiveFrame) -> Result<(), EnvError> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| EnvError::channel_closed("receiver dropped"))
    }

    /// Reports a channel error to the receiver.
    pub async fn fail(&self, error: EnvError) -> Result<(), EnvError> {
        self.tx
            .send(Err(error))
            .await
            .map_err(|_| EnvError::channel_closed("receiver dropped"))
    }

    /// Returns true once the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

//! Simulated push-channel transport with fault injection.

use async_trait::async_trait;
use fleetwatch_core::LiveEvent;
use fleetwatch_env::{AgencyId, EnvError, LiveChannel, LiveFrame, LiveSender, LiveTransport};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct TransportState {
    /// Sender of the currently open channel
    current: Option<LiveSender>,

    /// Upcoming opens to refuse
    refuse_next: u32,

    /// Refuse every open while set
    refuse_all: bool,

    opens: u32,
    refused: u32,
}

/// [`LiveTransport`] whose channel is driven by test code.
///
/// # Fault Model
///
/// ```text
/// refuse_next(n)  -> the next n opens fail
/// refuse_all(b)   -> every open fails while set
/// drop_channel()  -> server closes: recv() yields None
/// fail_channel(e) -> server errors: recv() yields Err(e)
/// ```
pub struct SimLiveTransport {
    buffer: usize,
    state: Mutex<TransportState>,
}

impl SimLiveTransport {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            state: Mutex::new(TransportState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self) -> Result<LiveSender, EnvError> {
        self.state()
            .current
            .clone()
            .ok_or_else(|| EnvError::channel_closed("no open channel"))
    }

    /// Delivers a typed event on the open channel.
    pub async fn push(&self, event: &LiveEvent) -> Result<(), EnvError> {
        let frame = event
            .encode()
            .map_err(|e| EnvError::ContextError(e.to_string()))?;
        self.push_frame(frame).await
    }

    /// Delivers raw bytes, for malformed-frame tests.
    pub async fn push_frame(&self, frame: LiveFrame) -> Result<(), EnvError> {
        let sender = self.sender()?;
        sender.send(frame).await
    }

    /// Closes the open channel from the server side.
    pub fn drop_channel(&self) -> bool {
        self.state().current.take().is_some()
    }

    /// Reports an error on the open channel, then forgets it.
    pub async fn fail_channel(&self, error: EnvError) -> Result<(), EnvError> {
        let sender = self.state().current.take().ok_or_else(|| EnvError::channel_closed("no open channel"))?;
        sender.fail(error).await
    }

    pub fn refuse_next(&self, opens: u32) {
        self.state().refuse_next = opens;
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.state().refuse_all = refuse;
    }

    /// Total open attempts, refused ones included.
    pub fn open_count(&self) -> u32 {
        self.state().opens
    }

    pub fn refused_count(&self) -> u32 {
        self.state().refused
    }

    /// True while a channel is open and its receiver is still alive.
    pub fn is_connected(&self) -> bool {
        self.state().current.as_ref().map_or(false, |tx| !tx.is_closed())
    }
}

#[async_trait]
impl LiveTransport for SimLiveTransport {
    async fn open_live_channel(&self, agency: &AgencyId) -> Result<LiveChannel, EnvError> {
        let mut state = self.state();
        state.opens += 1;

        if state.refuse_all || state.refuse_next > 0 {
            state.refuse_next = state.refuse_next.saturating_sub(1);
            state.refused += 1;
            return Err(EnvError::network(format!("live hub refused connection for agency {agency}")));
        }

        let (tx, channel) = LiveChannel::pair(self.buffer);
        state.current = Some(tx);
        Ok(channel)
    }
}

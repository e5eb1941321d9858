use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StreamError;

/// Raw per-tick output of the feature extractor, before normalization.
///
/// `data` is a rolling buffer of `frame_size`-wide time steps, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrogramFrame {
    pub frame_size: usize,
    pub data: Vec<f32>,
}

impl SpectrogramFrame {
    pub fn new(frame_size: usize, data: Vec<f32>) -> Self {
        Self { frame_size, data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamMode {
    LabeledCollection,
    Classification,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ListenOptions {
    pub overlap_factor: f32,
    pub probability_threshold: Option<f32>,
    pub invoke_on_noise_and_unknown: bool,
}

/// Source of feature frames. At most one activation may be outstanding.
pub trait FeatureStream {
    fn start(&mut self, mode: StreamMode, options: &ListenOptions) -> Result<Subscription, StreamError>;

    /// Deactivate immediately. Frames already queued may still be read from
    /// a subscription the caller kept around.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Receiving end of one stream activation. Frames arrive in emission order.
pub struct Subscription {
    receiver: Receiver<SpectrogramFrame>,
    mode: StreamMode,
}

impl Subscription {
    pub fn new(receiver: Receiver<SpectrogramFrame>, mode: StreamMode) -> Self {
        Self { receiver, mode }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Try to read a frame (non-blocking)
    pub fn try_next(&self) -> Result<Option<SpectrogramFrame>, StreamError> {
        match self.receiver.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(StreamError::Closed),
        }
    }

    /// Read a frame, waiting at most `timeout`
    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<SpectrogramFrame>, StreamError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::Closed),
        }
    }
}

#[derive(Default)]
struct Shared {
    sender: Option<SyncSender<SpectrogramFrame>>,
    mode: Option<StreamMode>,
    options: Option<ListenOptions>,
    activations: Vec<StreamMode>,
}

/// Feature stream backed by a bounded channel per activation.
///
/// Producers (an extractor thread, a replay loop, a test) push frames through
/// a [`FrameFeeder`]; the frames land in whichever activation is current.
pub struct ChannelStream {
    shared: Arc<Mutex<Shared>>,
    capacity: usize,
}

impl ChannelStream {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn feeder(&self) -> FrameFeeder {
        FrameFeeder {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Mode of every activation so far, in start order.
    pub fn activation_log(&self) -> Vec<StreamMode> {
        lock(&self.shared).activations.clone()
    }

    pub fn current_options(&self) -> Option<ListenOptions> {
        lock(&self.shared).options
    }
}

impl FeatureStream for ChannelStream {
    fn start(&mut self, mode: StreamMode, options: &ListenOptions) -> Result<Subscription, StreamError> {
        let mut shared = lock(&self.shared);
        if shared.sender.is_some() {
            return Err(StreamError::AlreadyActive);
        }

        let (sender, receiver) = mpsc::sync_channel(self.capacity);
        shared.sender = Some(sender);
        shared.mode = Some(mode);
        shared.options = Some(*options);
        shared.activations.push(mode);
        debug!(?mode, activation = shared.activations.len(), "feature stream started");

        Ok(Subscription::new(receiver, mode))
    }

    fn stop(&mut self) {
        let mut shared = lock(&self.shared);
        if shared.sender.take().is_some() {
            debug!(mode = ?shared.mode, "feature stream stopped");
        }
        shared.mode = None;
        shared.options = None;
    }

    fn is_active(&self) -> bool {
        lock(&self.shared).sender.is_some()
    }
}

/// Producer handle for a [`ChannelStream`].
#[derive(Clone)]
pub struct FrameFeeder {
    shared: Arc<Mutex<Shared>>,
}

impl FrameFeeder {
    /// Deliver a frame to the current activation.
    ///
    /// Blocks while the channel is full. Returns `false` when no activation
    /// is outstanding or the consumer has gone away.
    pub fn push(&self, frame: SpectrogramFrame) -> bool {
        // Clone the sender so a blocked send never holds the lock
        let sender = match lock(&self.shared).sender.clone() {
            Some(sender) => sender,
            None => return false,
        };
        sender.send(frame).is_ok()
    }

    pub fn active_mode(&self) -> Option<StreamMode> {
        lock(&self.shared).mode
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // A panicked producer cannot leave `Shared` half-written
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#![allow(dead_code)]

use kws_rs::display::RecordingDisplay;
use kws_rs::{
    ChannelStream, Config, FrameFeeder, MemoryModelStore, SessionController, SpectrogramFrame,
};

pub type TestSession = SessionController<ChannelStream, MemoryModelStore, RecordingDisplay>;

pub const FRAMES: usize = 3;
pub const BINS: usize = 8;

/// Small window so a full training run stays fast.
pub const CONFIG: &str = r#"
    [session]
    classes = ["yes", "no", "Other"]
    threshold = 0.5
    seed = 23

    [stream]
    frames = 3
    bins = 8
    channel_capacity = 256
"#;

pub fn config() -> Config {
    CONFIG.parse().expect("test config parses")
}

pub fn session_with_store(config: &Config, store: MemoryModelStore) -> (TestSession, FrameFeeder) {
    let stream = ChannelStream::new(config.stream.channel_capacity);
    let feeder = stream.feeder();
    let session = SessionController::new(config, stream, store, RecordingDisplay::new())
        .expect("session builds");
    (session, feeder)
}

pub fn session() -> (TestSession, FrameFeeder) {
    session_with_store(&config(), MemoryModelStore::new())
}

/// Flat frame at `level` dB.
pub fn frame(level: f32) -> SpectrogramFrame {
    SpectrogramFrame::new(BINS, vec![level; FRAMES * BINS])
}

/// Frame with energy in a band that identifies `label`.
pub fn class_frame(label: usize) -> SpectrogramFrame {
    let data = (0..FRAMES * BINS)
        .map(|i| if (i % BINS) / 2 == label { -80.0 } else { -105.0 })
        .collect();
    SpectrogramFrame::new(BINS, data)
}

/// Push frames into the active stream and let the controller consume them.
pub fn deliver(session: &mut TestSession, feeder: &FrameFeeder, frames: &[SpectrogramFrame]) -> usize {
    for frame in frames {
        assert!(feeder.push(frame.clone()), "stream is not active");
    }
    session.process_pending().expect("frames are accepted")
}

/// Collect `count` frames for every class in turn.
pub fn collect_examples(session: &mut TestSession, feeder: &FrameFeeder, count: usize) {
    for label in 0..session.classes().len() {
        session.collect(Some(label)).unwrap();
        let frames = vec![class_frame(label); count];
        assert_eq!(deliver(session, feeder, &frames), count);
        session.collect(None).unwrap();
    }
}

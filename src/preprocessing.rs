use crate::error::StreamError;
use crate::stream::SpectrogramFrame;
use crate::{NORMALIZE_MEAN, NORMALIZE_STD};

/// Most recent `frames` time steps of a spectrogram frame.
pub fn extract_window(
    frame: &SpectrogramFrame,
    frames: usize,
    bins: usize,
) -> Result<&[f32], StreamError> {
    if frame.frame_size != bins {
        return Err(StreamError::FrameSize {
            expected: bins,
            actual: frame.frame_size,
        });
    }

    let needed = bins * frames;
    if frame.data.len() < needed {
        return Err(StreamError::ShortFrame {
            needed,
            actual: frame.data.len(),
        });
    }

    Ok(&frame.data[frame.data.len() - needed..])
}

/// Map raw dB values into the range the network was trained on.
pub fn normalize(window: &[f32]) -> Vec<f32> {
    window
        .iter()
        .map(|&x| (x - NORMALIZE_MEAN) / NORMALIZE_STD)
        .collect()
}

/// Cut the latest window out of `frame` and normalize it.
pub fn prepare_window(
    frame: &SpectrogramFrame,
    frames: usize,
    bins: usize,
) -> Result<Vec<f32>, StreamError> {
    extract_window(frame, frames, bins).map(normalize)
}

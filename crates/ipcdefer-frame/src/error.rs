/// Ways a byte stream can fail to yield frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header does not start with `"DV"`; the stream is out of sync.
    #[error("bad frame magic, expected \"DV\" (0x4456)")]
    InvalidMagic,

    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// End of stream with a partial frame buffered.
    #[error("stream ended mid-frame")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, FrameError>;

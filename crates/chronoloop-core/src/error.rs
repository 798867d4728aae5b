//! Error types for the chronoloop runtime and media clock.

use thiserror::Error;

use crate::message::FieldType;

/// Result type alias for chronoloop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an anchor update was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnchorRejection {
    /// The anchor media time or anchor real time was negative.
    NegativeInput,
    /// The anchor would make the current media time negative.
    NegativeMediaTime,
}

impl std::fmt::Display for AnchorRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnchorRejection::NegativeInput => write!(f, "anchor time is negative"),
            AnchorRejection::NegativeMediaTime => {
                write!(f, "anchor leads to negative media time")
            }
        }
    }
}

/// Errors reported by loopers, messages and the media clock.
///
/// Every variant is local and recoverable; nothing here is fatal to the process.
#[derive(Debug, Error)]
pub enum Error {
    /// The message is unbound, or its handler/looper no longer exists.
    #[error("target handler or looper is gone")]
    TargetGone,

    /// `start()` was called on a looper that is already running.
    #[error("looper '{0}' is already running")]
    AlreadyRunning(String),

    /// `stop()` was called on a looper that is not running.
    #[error("looper '{0}' is not running")]
    NotRunning(String),

    /// The message field table is full.
    #[error("message field table is full ({capacity} fields), cannot add '{name}'")]
    FieldCapacityExceeded { name: String, capacity: usize },

    /// A field exists under the name but holds another type.
    #[error("field '{name}' holds {found:?}, not {expected:?}")]
    FieldTypeMismatch {
        name: String,
        expected: FieldType,
        found: FieldType,
    },

    /// No field exists under the name.
    #[error("field '{0}' not found")]
    FieldNotFound(String),

    /// The media clock has no anchor yet.
    #[error("media clock has no anchor")]
    NoAnchor,

    /// The playback rate is zero, so media time does not advance.
    #[error("playback rate is zero")]
    RateIsZero,

    /// An anchor update was refused.
    #[error("anchor update rejected: {0}")]
    RejectedAnchorUpdate(AnchorRejection),

    /// Playback rates must be finite and non-negative.
    #[error("invalid playback rate {0}")]
    InvalidPlaybackRate(f32),

    /// The worker thread could not be spawned.
    #[error("failed to spawn looper thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

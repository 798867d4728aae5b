//! Chronoloop Core - message loopers and an anchor-based media clock.
//!
//! This crate provides:
//!
//! - **Messages** - owned envelopes with a kind and up to 64 typed named fields
//! - **Loopers** - one worker thread per looper, delivering messages in
//!   deadline order
//! - **Handlers** - registered delivery targets addressed through
//!   non-owning [`HandlerRef`]s
//! - **MediaClock** - real-time to media-time mapping with media-time timers
//! - **Config** - TOML configuration for loopers and clocks
//!
//! # Architecture
//!
//! A [`Message`] is bound to a handler and posted with an optional delay. The
//! handler's [`Looper`] keeps it in a time-ordered queue and hands it back on
//! its own thread once due. A [`MediaClock`] is itself a handler on a private
//! looper: it schedules self-addressed wake-ups stamped with a generation
//! counter and ignores any wake-up made stale by a later anchor or rate change.
//!
//! ```no_run
//! use chronoloop_core::{Looper, MediaClock, TimerReason, UNBOUNDED_MEDIA_US};
//!
//! # fn main() -> chronoloop_core::Result<()> {
//! let looper = Looper::new("app");
//! looper.start()?;
//! let (handler, rx) = looper.register_channel();
//!
//! let clock = MediaClock::new()?;
//! clock.update_anchor(0, chronoloop_core::time::now_us(), UNBOUNDED_MEDIA_US)?;
//! clock.add_timer(handler.message(1), 500_000, 0);
//!
//! let fired = rx.recv().expect("timer");
//! assert_eq!(TimerReason::from_message(&fired), Some(TimerReason::Reached));
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod runtime;
pub mod time;

pub use clock::{
    Anchor, AnchorUpdate, MediaClock, TimerReason, ANCHOR_MEDIA_US_FIELD, ANCHOR_REAL_US_FIELD,
    KEEP_MAX_MEDIA_US, PLAYBACK_RATE_FIELD, REASON_FIELD, UNBOUNDED_MEDIA_US,
};
pub use config::{ClockConfig, Config, LooperConfig, DEFAULT_ANCHOR_JITTER_TOLERANCE_US};
pub use error::{AnchorRejection, Error, Result};
pub use message::{FieldType, FieldValue, Message, Pointer, Rect, MAX_FIELDS};
pub use runtime::{Handler, HandlerId, HandlerIdAllocator, HandlerRef, Looper, WeakLooper};
pub use time::{ClockSource, ManualClock, MonotonicClock, SharedClock};

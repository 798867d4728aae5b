//! Anchor-based media clock.
//!
//! A [`MediaClock`] maps real (monotonic) time onto media time through an
//! anchor pair and a playback rate, and fires timer messages when media time
//! reaches their targets. It runs a private looper and schedules
//! generation-stamped wake-ups on it; any anchor, rate or reset change bumps the
//! generation, which turns older wake-ups into no-ops.

mod state;

pub use state::Anchor;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use state::ClockState;

use crate::config::ClockConfig;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::runtime::{Handler, HandlerIdAllocator, Looper};
use crate::time::{MonotonicClock, SharedClock};

/// `max_media_us` meaning "no upper bound".
pub const UNBOUNDED_MEDIA_US: i64 = i64::MAX;

/// Pass as `max_media_us` to `update_anchor` to keep the current bound.
pub const KEEP_MAX_MEDIA_US: i64 = -1;

/// Field stamped on timer notifications, holding a [`TimerReason`].
pub const REASON_FIELD: &str = "reason";

/// Discontinuity notification field: anchor media time, -1 when cleared.
pub const ANCHOR_MEDIA_US_FIELD: &str = "anchor-media-us";

/// Discontinuity notification field: anchor real time, -1 when cleared.
pub const ANCHOR_REAL_US_FIELD: &str = "anchor-real-us";

/// Discontinuity notification field: playback rate as `f32`.
pub const PLAYBACK_RATE_FIELD: &str = "playback-rate";

/// Kind of the clock's self-addressed wake-up messages.
pub(crate) const WHAT_TIME_IS_UP: u32 = u32::from_be_bytes(*b"tIsU");

pub(crate) const GENERATION_FIELD: &str = "generation";

/// Why a timer notification was posted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerReason {
    /// Media time reached the timer's target.
    Reached = 0,
    /// The clock was reset before the target was reached.
    Reset = 1,
}

impl TimerReason {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Read the reason stamped on a delivered timer notification.
    pub fn from_message(message: &Message) -> Option<Self> {
        match message.find_int32(REASON_FIELD)? {
            0 => Some(TimerReason::Reached),
            1 => Some(TimerReason::Reset),
            _ => None,
        }
    }
}

/// Outcome of an accepted `update_anchor` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnchorUpdate {
    /// The anchor moved; timers were re-evaluated.
    Updated,
    /// The change was within the jitter tolerance and was ignored.
    Suppressed,
}

fn lock(mutex: &Mutex<ClockState>) -> MutexGuard<'_, ClockState> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clock state shared between the public handle and the clock's looper.
pub(crate) struct ClockShared {
    state: Mutex<ClockState>,
    clock: SharedClock,
}

impl ClockShared {
    /// Delivery entry point, called on the clock's looper thread.
    pub(crate) fn on_message_received(&self, message: Message) {
        if message.what() != WHAT_TIME_IS_UP {
            log::warn!("media clock ignoring unexpected message what={:#x}", message.what());
            return;
        }
        let Some(generation) = message.find_int64(GENERATION_FIELD) else {
            log::warn!("media clock wake-up without a generation");
            return;
        };
        let now_us = self.clock.now_us();
        lock(&self.state).on_time_is_up(generation, now_us);
    }
}

/// Maps real time to media time and fires media-time timers.
///
/// Every method locks the clock state; all of them may be called from any
/// thread, including from handlers running on other loopers.
pub struct MediaClock {
    shared: Arc<ClockShared>,
    handler: Handler,
    looper: Looper,
}

impl MediaClock {
    /// Create a clock on the monotonic clock with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(&ClockConfig::default(), MonotonicClock::shared())
    }

    /// Create a clock reading real time from `clock`.
    ///
    /// The clock's private looper is started and the clock registered with it
    /// before this returns.
    pub fn with_config(config: &ClockConfig, clock: SharedClock) -> Result<Self> {
        if config.anchor_jitter_tolerance_us < 0 {
            return Err(Error::Config(format!(
                "anchor jitter tolerance must not be negative (got {})",
                config.anchor_jitter_tolerance_us
            )));
        }

        let looper = Looper::with_config(
            &config.looper_config(),
            HandlerIdAllocator::shared(),
            clock.clone(),
        );
        looper.start()?;

        let shared = Arc::new(ClockShared {
            state: Mutex::new(ClockState::new(config.anchor_jitter_tolerance_us)),
            clock,
        });
        let mut handler = Handler::media_clock(Arc::downgrade(&shared));
        looper.register_handler(&mut handler);
        lock(&shared.state).set_wakeup_target(handler.handle());
        log::debug!("media clock running on looper '{}'", looper.name());

        Ok(Self {
            shared,
            handler,
            looper,
        })
    }

    fn state(&self) -> MutexGuard<'_, ClockState> {
        lock(&self.shared.state)
    }

    fn now_us(&self) -> i64 {
        self.shared.clock.now_us()
    }

    /// Cancel every timer with [`TimerReason::Reset`] and forget the anchor,
    /// bounds and rate.
    pub fn reset(&self) {
        self.state().reset();
    }

    /// Media time never reported below `starting_media_us`.
    pub fn set_starting_time_media(&self, starting_media_us: i64) {
        self.state().set_starting_time_media(starting_media_us);
    }

    /// Forget the anchor. The playback rate is kept.
    pub fn clear_anchor(&self) {
        self.state().clear_anchor();
    }

    /// Anchor `anchor_media_us` at `anchor_real_us`.
    ///
    /// `max_media_us` replaces the upper bound unless it is
    /// [`KEEP_MAX_MEDIA_US`]; the bound is applied even when the anchor change
    /// itself is suppressed as jitter.
    pub fn update_anchor(
        &self,
        anchor_media_us: i64,
        anchor_real_us: i64,
        max_media_us: i64,
    ) -> Result<AnchorUpdate> {
        let mut state = self.state();
        let now_us = self.now_us();
        state.update_anchor(anchor_media_us, anchor_real_us, max_media_us, now_us)
    }

    pub fn update_max_time_media(&self, max_media_us: i64) {
        self.state().update_max_time_media(max_media_us);
    }

    /// Change the playback rate, keeping media time continuous at "now".
    pub fn set_playback_rate(&self, rate: f32) -> Result<()> {
        let mut state = self.state();
        let now_us = self.now_us();
        state.set_playback_rate(rate, now_us)
    }

    pub fn playback_rate(&self) -> f32 {
        self.state().playback_rate()
    }

    pub fn anchor(&self) -> Option<Anchor> {
        self.state().anchor()
    }

    pub fn generation(&self) -> u64 {
        self.state().generation()
    }

    pub fn pending_timers(&self) -> usize {
        self.state().pending_timers()
    }

    /// Media time at real time `real_us`.
    pub fn get_media_time(&self, real_us: i64, allow_past_max: bool) -> Result<i64> {
        self.state().media_time_at(real_us, allow_past_max)
    }

    /// Media time now.
    pub fn media_time_now(&self) -> Result<i64> {
        let state = self.state();
        let now_us = self.now_us();
        state.media_time_at(now_us, false)
    }

    /// Real time at which media time reaches `target_media_us`.
    pub fn get_real_time_for(&self, target_media_us: i64) -> Result<i64> {
        let state = self.state();
        let now_us = self.now_us();
        state.real_time_for(target_media_us, now_us)
    }

    /// Post `notify` once media time reaches
    /// `target_media_us + adjust_real_us * rate`.
    ///
    /// The message is posted with [`REASON_FIELD`] set to
    /// [`TimerReason::Reached`], or [`TimerReason::Reset`] if the clock is reset
    /// first.
    pub fn add_timer(&self, notify: Message, target_media_us: i64, adjust_real_us: i64) {
        let mut state = self.state();
        let now_us = self.now_us();
        state.add_timer(notify, target_media_us, adjust_real_us, now_us);
    }

    /// Template posted, stamped with the new anchor and rate, whenever either
    /// changes. `None` disables notifications.
    pub fn set_notification_message(&self, notify: Option<Message>) {
        self.state().set_notification_message(notify);
    }
}

impl Drop for MediaClock {
    fn drop(&mut self) {
        self.reset();
        self.looper.unregister_handler(&mut self.handler);
        if let Err(e) = self.looper.stop() {
            log::debug!("media clock looper: {}", e);
        }
    }
}

impl std::fmt::Debug for MediaClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MediaClock")
            .field("anchor", &state.anchor())
            .field("playback_rate", &state.playback_rate())
            .field("generation", &state.generation())
            .field("pending_timers", &state.pending_timers())
            .finish()
    }
}

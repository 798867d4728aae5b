//! Media clock state and the algorithms that run with its lock held.
//!
//! [`ClockState`] lives inside the clock's mutex; its mutating methods are only
//! reachable through the guard, so holding `&mut ClockState` is the proof that
//! the lock is held. Every method takes the current real time explicitly.

use crate::error::{AnchorRejection, Error, Result};
use crate::message::Message;
use crate::runtime::HandlerRef;

use super::{
    AnchorUpdate, TimerReason, ANCHOR_MEDIA_US_FIELD, ANCHOR_REAL_US_FIELD, GENERATION_FIELD,
    KEEP_MAX_MEDIA_US, PLAYBACK_RATE_FIELD, REASON_FIELD, UNBOUNDED_MEDIA_US, WHAT_TIME_IS_UP,
};

/// A (media time, real time) pair fixing the real→media projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Anchor {
    pub media_us: i64,
    pub real_us: i64,
}

impl Anchor {
    /// Media time at `real_us` for the given rate, unclamped.
    fn project(&self, real_us: i64, rate: f32) -> i64 {
        let elapsed = real_us.saturating_sub(self.real_us) as f64;
        (self.media_us as f64 + elapsed * rate as f64) as i64
    }
}

/// A pending request to be notified at a media time.
#[derive(Debug)]
struct Timer {
    notify: Message,
    target_media_us: i64,
    adjust_real_us: i64,
}

#[derive(Debug)]
pub(crate) struct ClockState {
    anchor: Option<Anchor>,
    max_media_us: i64,
    starting_media_us: Option<i64>,
    playback_rate: f32,
    generation: u64,
    timers: Vec<Timer>,
    notify: Option<Message>,
    wakeup_target: Option<HandlerRef>,
    jitter_tolerance_us: i64,
}

/// Clamp a floating-point media difference into `i64`.
fn saturate(value: f64) -> i64 {
    if value >= i64::MAX as f64 {
        i64::MAX
    } else if value <= i64::MIN as f64 {
        i64::MIN
    } else {
        value as i64
    }
}

impl ClockState {
    pub fn new(jitter_tolerance_us: i64) -> Self {
        Self {
            anchor: None,
            max_media_us: UNBOUNDED_MEDIA_US,
            starting_media_us: None,
            playback_rate: 1.0,
            generation: 0,
            timers: Vec::new(),
            notify: None,
            wakeup_target: None,
            jitter_tolerance_us,
        }
    }

    pub fn set_wakeup_target(&mut self, target: HandlerRef) {
        self.wakeup_target = Some(target);
    }

    pub fn anchor(&self) -> Option<Anchor> {
        self.anchor
    }

    pub fn playback_rate(&self) -> f32 {
        self.playback_rate
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn set_notification_message(&mut self, notify: Option<Message>) {
        self.notify = notify;
    }

    pub fn set_starting_time_media(&mut self, starting_media_us: i64) {
        self.starting_media_us = Some(starting_media_us);
    }

    pub fn update_max_time_media(&mut self, max_media_us: i64) {
        self.max_media_us = max_media_us;
    }

    /// Media time at `real_us`, clamped to `[starting, max]` and never negative.
    pub fn media_time_at(&self, real_us: i64, allow_past_max: bool) -> Result<i64> {
        let anchor = self.anchor.ok_or(Error::NoAnchor)?;
        let mut media_us = anchor.project(real_us, self.playback_rate);
        if media_us > self.max_media_us && !allow_past_max {
            media_us = self.max_media_us;
        }
        if let Some(starting) = self.starting_media_us {
            media_us = media_us.max(starting);
        }
        Ok(media_us.max(0))
    }

    /// Real time at which media time reaches `target_media_us`.
    pub fn real_time_for(&self, target_media_us: i64, now_us: i64) -> Result<i64> {
        if self.playback_rate == 0.0 {
            return Err(Error::RateIsZero);
        }
        let now_media_us = self.media_time_at(now_us, true)?;
        let real_us = (target_media_us as f64 - now_media_us as f64)
            / self.playback_rate as f64
            + now_us as f64;
        Ok(saturate(real_us))
    }

    pub fn clear_anchor(&mut self) {
        let rate = self.playback_rate;
        self.set_anchor_and_rate(None, rate);
        self.generation += 1;
    }

    pub fn reset(&mut self) {
        for mut timer in self.timers.drain(..) {
            if let Err(e) = timer
                .notify
                .set_int32(REASON_FIELD, TimerReason::Reset.as_i32())
            {
                log::warn!("cannot stamp reset reason on timer notification: {}", e);
            }
            if let Err(e) = timer.notify.post(0) {
                log::debug!("timer reset notification not delivered: {}", e);
            }
        }
        self.max_media_us = UNBOUNDED_MEDIA_US;
        self.starting_media_us = None;
        self.set_anchor_and_rate(None, 1.0);
        self.generation += 1;
    }

    pub fn update_anchor(
        &mut self,
        anchor_media_us: i64,
        anchor_real_us: i64,
        max_media_us: i64,
        now_us: i64,
    ) -> Result<AnchorUpdate> {
        if anchor_media_us < 0 || anchor_real_us < 0 {
            log::warn!(
                "rejecting anchor ({}us media, {}us real): negative time",
                anchor_media_us,
                anchor_real_us
            );
            return Err(Error::RejectedAnchorUpdate(AnchorRejection::NegativeInput));
        }

        let proposed = Anchor {
            media_us: anchor_media_us,
            real_us: anchor_real_us,
        };
        let now_media_us = proposed.project(now_us, self.playback_rate);
        if now_media_us < 0 {
            log::warn!(
                "rejecting anchor ({}us media, {}us real): media time would be {}us",
                anchor_media_us,
                anchor_real_us,
                now_media_us
            );
            return Err(Error::RejectedAnchorUpdate(
                AnchorRejection::NegativeMediaTime,
            ));
        }

        if max_media_us != KEEP_MAX_MEDIA_US {
            self.max_media_us = max_media_us;
        }

        if let Some(current) = self.anchor {
            let old_now_media_us = current.project(now_us, self.playback_rate);
            if now_media_us < old_now_media_us.saturating_add(self.jitter_tolerance_us)
                && now_media_us > old_now_media_us.saturating_sub(self.jitter_tolerance_us)
            {
                log::trace!(
                    "anchor change of {}us within jitter tolerance, ignored",
                    now_media_us - old_now_media_us
                );
                return Ok(AnchorUpdate::Suppressed);
            }
        }

        let rate = self.playback_rate;
        self.set_anchor_and_rate(
            Some(Anchor {
                media_us: now_media_us,
                real_us: now_us,
            }),
            rate,
        );
        self.generation += 1;
        self.process_timers(now_us);
        Ok(AnchorUpdate::Updated)
    }

    pub fn set_playback_rate(&mut self, rate: f32, now_us: i64) -> Result<()> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(Error::InvalidPlaybackRate(rate));
        }
        let Some(anchor) = self.anchor else {
            self.playback_rate = rate;
            return Ok(());
        };

        let mut now_media_us = anchor.project(now_us, self.playback_rate);
        if now_media_us < 0 {
            log::warn!("playback rate change at negative media time {}us, using 0", now_media_us);
            now_media_us = 0;
        }
        self.set_anchor_and_rate(
            Some(Anchor {
                media_us: now_media_us,
                real_us: now_us,
            }),
            rate,
        );

        if rate > 0.0 {
            self.generation += 1;
            self.process_timers(now_us);
        }
        Ok(())
    }

    pub fn add_timer(
        &mut self,
        notify: Message,
        target_media_us: i64,
        adjust_real_us: i64,
        now_us: i64,
    ) {
        let rate = self.playback_rate as f64;
        let earliest = rate != 0.0
            && !self.timers.iter().any(|timer| {
                (timer.adjust_real_us as f64 - adjust_real_us as f64) * rate
                    + (timer.target_media_us as f64 - target_media_us as f64)
                    <= 0.0
            });

        self.timers.push(Timer {
            notify,
            target_media_us,
            adjust_real_us,
        });

        if earliest {
            self.generation += 1;
            self.process_timers(now_us);
        }
    }

    /// Handle a "time is up" wake-up stamped with `generation`.
    pub fn on_time_is_up(&mut self, generation: i64, now_us: i64) {
        if generation != self.generation as i64 {
            log::trace!(
                "stale wake-up (generation {}, current {}) ignored",
                generation,
                self.generation
            );
            return;
        }
        self.process_timers(now_us);
    }

    /// Fire every due timer and schedule a wake-up for the next one.
    fn process_timers(&mut self, now_us: i64) {
        let Ok(now_media_us) = self.media_time_at(now_us, false) else {
            return;
        };

        let rate = self.playback_rate as f64;
        let mut next_lapse_real_us = i64::MAX;
        let mut due: Vec<(i64, Timer)> = Vec::new();
        let mut pending = Vec::with_capacity(self.timers.len());

        for timer in self.timers.drain(..) {
            let diff_media_us = saturate(
                timer.adjust_real_us as f64 * rate + timer.target_media_us as f64
                    - now_media_us as f64,
            );
            if diff_media_us <= 0 {
                due.push((diff_media_us, timer));
                continue;
            }
            if rate != 0.0 && (diff_media_us as f64) < i64::MAX as f64 * rate {
                let target_real_us = (diff_media_us as f64 / rate) as i64;
                next_lapse_real_us = next_lapse_real_us.min(target_real_us);
            }
            pending.push(timer);
        }
        self.timers = pending;

        due.sort_by_key(|(diff, _)| *diff);
        for (_, mut timer) in due {
            if let Err(e) = timer
                .notify
                .set_int32(REASON_FIELD, TimerReason::Reached.as_i32())
            {
                log::warn!("cannot stamp reached reason on timer notification: {}", e);
            }
            log::trace!(
                "timer for {}us reached, notifying what={:#x}",
                timer.target_media_us,
                timer.notify.what()
            );
            if let Err(e) = timer.notify.post(0) {
                log::debug!("timer notification not delivered: {}", e);
            }
        }

        if self.timers.is_empty()
            || self.playback_rate == 0.0
            || self.anchor.is_none()
            || next_lapse_real_us == i64::MAX
        {
            return;
        }
        self.schedule_wakeup(next_lapse_real_us);
    }

    fn schedule_wakeup(&self, delay_us: i64) {
        let Some(target) = &self.wakeup_target else {
            return;
        };
        let mut wakeup = Message::new(WHAT_TIME_IS_UP, target);
        if let Err(e) = wakeup.set_int64(GENERATION_FIELD, self.generation as i64) {
            log::warn!("cannot stamp wake-up generation: {}", e);
            return;
        }
        if let Err(e) = wakeup.post(delay_us) {
            log::debug!("clock wake-up not scheduled: {}", e);
        }
    }

    fn set_anchor_and_rate(&mut self, anchor: Option<Anchor>, rate: f32) {
        if self.anchor != anchor || self.playback_rate != rate {
            self.anchor = anchor;
            self.playback_rate = rate;
            self.notify_discontinuity();
        }
    }

    fn notify_discontinuity(&self) {
        let Some(template) = &self.notify else {
            return;
        };
        let (media_us, real_us) = match self.anchor {
            Some(anchor) => (anchor.media_us, anchor.real_us),
            None => (-1, -1),
        };
        let mut msg = template.dup();
        let stamped = msg
            .set_int64(ANCHOR_MEDIA_US_FIELD, media_us)
            .and_then(|_| msg.set_int64(ANCHOR_REAL_US_FIELD, real_us))
            .and_then(|_| msg.set_float(PLAYBACK_RATE_FIELD, self.playback_rate));
        if let Err(e) = stamped {
            log::warn!("cannot stamp discontinuity notification: {}", e);
            return;
        }
        if let Err(e) = msg.post(0) {
            log::debug!("discontinuity notification not delivered: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Handler, Looper};
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);
    const TOLERANCE: i64 = 10_000;

    struct Sink {
        looper: Looper,
        handler: Handler,
        rx: Receiver<Message>,
    }

    impl Sink {
        fn new(name: &str) -> Self {
            let looper = Looper::new(name);
            looper.start().unwrap();
            let (handler, rx) = looper.register_channel();
            Self {
                looper,
                handler,
                rx,
            }
        }

        fn notify(&self, tag: i32) -> Message {
            let mut msg = self.handler.message(1);
            msg.set_int32("tag", tag).unwrap();
            msg
        }

        fn recv(&self) -> Message {
            self.rx.recv_timeout(WAIT).unwrap()
        }

        fn assert_quiet(&self) {
            assert!(self.rx.recv_timeout(Duration::from_millis(20)).is_err());
        }
    }

    impl Drop for Sink {
        fn drop(&mut self) {
            let _ = self.looper.stop();
        }
    }

    fn anchored(now_us: i64) -> ClockState {
        let mut state = ClockState::new(TOLERANCE);
        state
            .update_anchor(1_000_000, now_us, UNBOUNDED_MEDIA_US, now_us)
            .unwrap();
        state
    }

    #[test]
    fn test_no_anchor() {
        let state = ClockState::new(TOLERANCE);
        assert!(matches!(state.media_time_at(0, false), Err(Error::NoAnchor)));
        assert!(matches!(state.real_time_for(0, 0), Err(Error::NoAnchor)));
    }

    #[test]
    fn test_projection_at_unit_rate() {
        let now = 5_000_000;
        let state = anchored(now);
        assert_eq!(state.media_time_at(now + 500_000, false).unwrap(), 1_500_000);
        assert_eq!(state.real_time_for(2_000_000, now).unwrap(), now + 1_000_000);
    }

    #[test]
    fn test_clamping() {
        let now = 1_000;
        let mut state = ClockState::new(TOLERANCE);
        state.update_anchor(100, now, 2_000, now).unwrap();

        assert_eq!(state.media_time_at(now + 5_000, false).unwrap(), 2_000);
        assert_eq!(state.media_time_at(now + 5_000, true).unwrap(), 5_100);

        state.set_starting_time_media(500);
        assert_eq!(state.media_time_at(now, false).unwrap(), 500);

        // Earlier than the anchor projects negative; reported as 0 without a floor.
        let mut state = ClockState::new(TOLERANCE);
        state.update_anchor(0, now, UNBOUNDED_MEDIA_US, now).unwrap();
        assert_eq!(state.media_time_at(0, false).unwrap(), 0);
    }

    #[test]
    fn test_update_max_keeps_generation() {
        let mut state = anchored(0);
        let generation = state.generation();
        state.update_max_time_media(1_200_000);
        assert_eq!(state.generation(), generation);
        assert_eq!(state.media_time_at(900_000, false).unwrap(), 1_200_000);
    }

    #[test]
    fn test_rejects_negative_anchor() {
        let mut state = ClockState::new(TOLERANCE);
        assert!(matches!(
            state.update_anchor(-1, 0, UNBOUNDED_MEDIA_US, 0),
            Err(Error::RejectedAnchorUpdate(AnchorRejection::NegativeInput))
        ));
        // Anchor in the future so that "now" would be negative media time.
        assert!(matches!(
            state.update_anchor(100, 10_000, UNBOUNDED_MEDIA_US, 0),
            Err(Error::RejectedAnchorUpdate(AnchorRejection::NegativeMediaTime))
        ));
        assert!(state.anchor().is_none());
        assert_eq!(state.generation(), 0);
    }

    #[test]
    fn test_jitter_is_suppressed() {
        let now = 2_000_000;
        let mut state = anchored(now);
        let generation = state.generation();

        let outcome = state
            .update_anchor(1_009_999, now, UNBOUNDED_MEDIA_US, now)
            .unwrap();
        assert_eq!(outcome, AnchorUpdate::Suppressed);
        assert_eq!(state.generation(), generation);
        assert_eq!(state.media_time_at(now, false).unwrap(), 1_000_000);

        let outcome = state
            .update_anchor(1_010_000, now, UNBOUNDED_MEDIA_US, now)
            .unwrap();
        assert_eq!(outcome, AnchorUpdate::Updated);
        assert_eq!(state.generation(), generation + 1);
        assert_eq!(state.media_time_at(now, false).unwrap(), 1_010_000);
    }

    #[test]
    fn test_anchor_is_rebased_to_now() {
        let mut state = ClockState::new(TOLERANCE);
        state.update_anchor(1_000, 100, UNBOUNDED_MEDIA_US, 600).unwrap();
        assert_eq!(
            state.anchor(),
            Some(Anchor {
                media_us: 1_500,
                real_us: 600
            })
        );
    }

    #[test]
    fn test_rate_change_is_continuous() {
        let mut state = anchored(0);
        state.set_playback_rate(2.0, 1_000_000).unwrap();
        assert_eq!(state.media_time_at(1_000_000, false).unwrap(), 2_000_000);
        assert_eq!(state.media_time_at(1_500_000, false).unwrap(), 3_000_000);
        assert_eq!(state.real_time_for(4_000_000, 1_500_000).unwrap(), 2_000_000);
    }

    #[test]
    fn test_rate_without_anchor_is_stored() {
        let mut state = ClockState::new(TOLERANCE);
        state.set_playback_rate(0.5, 0).unwrap();
        assert_eq!(state.generation(), 0);
        state.update_anchor(0, 0, UNBOUNDED_MEDIA_US, 0).unwrap();
        assert_eq!(state.media_time_at(1_000_000, false).unwrap(), 500_000);
    }

    #[test]
    fn test_zero_rate_freezes_time() {
        let mut state = anchored(0);
        let generation = state.generation();
        state.set_playback_rate(0.0, 250_000).unwrap();
        assert_eq!(state.generation(), generation);
        assert_eq!(state.media_time_at(10_000_000, false).unwrap(), 1_250_000);
        assert!(matches!(state.real_time_for(2_000_000, 0), Err(Error::RateIsZero)));
    }

    #[test]
    fn test_invalid_rate() {
        let mut state = anchored(0);
        assert!(matches!(
            state.set_playback_rate(-1.0, 0),
            Err(Error::InvalidPlaybackRate(_))
        ));
        assert!(state.set_playback_rate(f32::NAN, 0).is_err());
        assert_eq!(state.playback_rate(), 1.0);
    }

    #[test]
    fn test_due_timer_fires_immediately() {
        let sink = Sink::new("due");
        let mut state = anchored(0);
        state.add_timer(sink.notify(1), 900_000, 0, 0);

        let msg = sink.recv();
        assert_eq!(msg.find_int32("tag"), Some(1));
        assert_eq!(msg.find_int32(REASON_FIELD), Some(TimerReason::Reached.as_i32()));
        assert_eq!(state.pending_timers(), 0);
    }

    #[test]
    fn test_due_timers_fire_most_overdue_first() {
        let sink = Sink::new("overdue");
        let mut state = ClockState::new(TOLERANCE);
        state.add_timer(sink.notify(0), 300, 0, 0);
        state.add_timer(sink.notify(1), 100, 0, 0);
        state.add_timer(sink.notify(2), 200, 0, 0);
        state.add_timer(sink.notify(3), 100, 0, 0);
        sink.assert_quiet();

        state.update_anchor(1_000, 0, UNBOUNDED_MEDIA_US, 0).unwrap();
        let tags: Vec<i32> = (0..4)
            .map(|_| sink.recv().find_int32("tag").unwrap())
            .collect();
        assert_eq!(tags, vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_future_timer_schedules_wakeup() {
        let sink = Sink::new("wakeup");
        let clock_looper = Looper::new("wakeup-clock");
        let (wake_handler, _wake_rx) = clock_looper.register_channel();

        let mut state = anchored(0);
        state.set_wakeup_target(wake_handler.handle());
        state.add_timer(sink.notify(5), 1_500_000, 0, 0);

        assert_eq!(state.pending_timers(), 1);
        assert_eq!(clock_looper.pending_events(), 1);
        sink.assert_quiet();

        // A stale wake-up does nothing; a current one fires the due timer.
        state.on_time_is_up(state.generation() as i64 - 1, 600_000);
        assert_eq!(state.pending_timers(), 1);
        state.on_time_is_up(state.generation() as i64, 600_000);
        assert_eq!(state.pending_timers(), 0);
        assert_eq!(sink.recv().find_int32("tag"), Some(5));
    }

    #[test]
    fn test_adjust_real_scales_with_rate() {
        let sink = Sink::new("adjust");
        let mut state = anchored(0);
        state.set_playback_rate(2.0, 0).unwrap();
        // Media 1_000_000 now; target 900_000 pushed back by 100_000us real = 200_000 media.
        state.add_timer(sink.notify(9), 900_000, 100_000, 0);
        assert_eq!(state.pending_timers(), 1);
        state.on_time_is_up(state.generation() as i64, 50_000);
        assert_eq!(state.pending_timers(), 0);
        assert_eq!(sink.recv().find_int32("tag"), Some(9));
    }

    #[test]
    fn test_later_timer_waits_for_scheduled_wakeup() {
        let sink = Sink::new("passive");
        let mut state = anchored(0);
        state.add_timer(sink.notify(1), 2_000_000, 0, 0);
        let generation = state.generation();

        state.add_timer(sink.notify(2), 3_000_000, 0, 0);
        assert_eq!(state.generation(), generation);
        state.add_timer(sink.notify(3), 1_500_000, 0, 0);
        assert_eq!(state.generation(), generation + 1);
        assert_eq!(state.pending_timers(), 3);
    }

    #[test]
    fn test_reset_notifies_every_timer() {
        let sink = Sink::new("reset");
        let mut state = anchored(0);
        state.set_playback_rate(1.5, 0).unwrap();
        state.add_timer(sink.notify(1), 5_000_000, 0, 0);
        state.add_timer(sink.notify(2), 6_000_000, 0, 0);
        let generation = state.generation();

        state.reset();
        let reasons: Vec<(i32, i32)> = (0..2)
            .map(|_| {
                let msg = sink.recv();
                (msg.find_int32("tag").unwrap(), msg.find_int32(REASON_FIELD).unwrap())
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                (1, TimerReason::Reset.as_i32()),
                (2, TimerReason::Reset.as_i32())
            ]
        );
        assert_eq!(state.pending_timers(), 0);
        assert!(state.anchor().is_none());
        assert_eq!(state.playback_rate(), 1.0);
        assert!(state.generation() > generation);

        state.on_time_is_up(generation as i64, 10_000_000);
        sink.assert_quiet();
    }

    #[test]
    fn test_discontinuity_notifications() {
        let sink = Sink::new("discontinuity");
        let mut state = ClockState::new(TOLERANCE);
        state.set_notification_message(Some(sink.notify(77)));

        state.update_anchor(0, 0, UNBOUNDED_MEDIA_US, 0).unwrap();
        let msg = sink.recv();
        assert_eq!(msg.find_int32("tag"), Some(77));
        assert_eq!(msg.find_int64(ANCHOR_MEDIA_US_FIELD), Some(0));
        assert_eq!(msg.find_int64(ANCHOR_REAL_US_FIELD), Some(0));
        assert_eq!(msg.find_float(PLAYBACK_RATE_FIELD), Some(1.0));

        // Suppressed updates are silent.
        state.update_anchor(5_000, 0, UNBOUNDED_MEDIA_US, 0).unwrap();
        sink.assert_quiet();

        state.set_playback_rate(0.5, 100_000).unwrap();
        let msg = sink.recv();
        assert_eq!(msg.find_int64(ANCHOR_MEDIA_US_FIELD), Some(100_000));
        assert_eq!(msg.find_int64(ANCHOR_REAL_US_FIELD), Some(100_000));
        assert_eq!(msg.find_float(PLAYBACK_RATE_FIELD), Some(0.5));

        state.clear_anchor();
        let msg = sink.recv();
        assert_eq!(msg.find_int64(ANCHOR_MEDIA_US_FIELD), Some(-1));
        assert_eq!(msg.find_float(PLAYBACK_RATE_FIELD), Some(0.5));
        assert!(matches!(state.media_time_at(0, false), Err(Error::NoAnchor)));
    }

    #[test]
    fn test_saturate() {
        assert_eq!(saturate(1e300), i64::MAX);
        assert_eq!(saturate(-1e300), i64::MIN);
        assert_eq!(saturate(-5.5), -5);
    }
}

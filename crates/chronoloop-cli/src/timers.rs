//! `chronoloop timers`: media-time timers on a live clock.

use anyhow::{Context, Result};
use chronoloop_core::time::now_us;
use chronoloop_core::{
    Config, HandlerIdAllocator, Looper, MediaClock, MonotonicClock, TimerReason,
    ANCHOR_MEDIA_US_FIELD, PLAYBACK_RATE_FIELD, UNBOUNDED_MEDIA_US,
};
use clap::Args;
use crossbeam_channel::RecvTimeoutError;
use std::time::{Duration, Instant};

const WHAT_DISCONTINUITY: u32 = u32::from_be_bytes(*b"disc");
const WHAT_TIMER: u32 = u32::from_be_bytes(*b"tmr ");

const INDEX_FIELD: &str = "index";

#[derive(Args, Debug)]
pub struct TimersArgs {
    /// Media-time offsets to fire at (e.g. "250ms", "1s")
    #[arg(value_name = "OFFSET", required = true, value_parser = humantime::parse_duration)]
    pub offsets: Vec<Duration>,

    /// Playback rate
    #[arg(short, long, default_value_t = 1.0)]
    pub rate: f32,

    /// Give up after this much real time
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

fn micros(duration: Duration) -> Result<i64> {
    i64::try_from(duration.as_micros())
        .with_context(|| format!("Offset too large: {}", humantime::format_duration(duration)))
}

pub fn run(config: &Config, args: TimersArgs) -> Result<()> {
    let looper = Looper::with_config(
        &config.looper,
        HandlerIdAllocator::shared(),
        MonotonicClock::shared(),
    );
    looper.start().context("Failed to start looper")?;
    let (handler, rx) = looper.register_channel();

    let clock = MediaClock::with_config(&config.clock, MonotonicClock::shared())
        .context("Failed to start media clock")?;
    clock.set_notification_message(Some(handler.message(WHAT_DISCONTINUITY)));

    let started = Instant::now();
    clock
        .update_anchor(0, now_us(), UNBOUNDED_MEDIA_US)
        .context("Failed to anchor media clock")?;
    clock
        .set_playback_rate(args.rate)
        .context("Invalid playback rate")?;

    for (index, offset) in args.offsets.iter().enumerate() {
        let mut notify = handler.message(WHAT_TIMER);
        notify.set_int32(INDEX_FIELD, index as i32)?;
        clock.add_timer(notify, micros(*offset)?, 0);
    }
    log::info!(
        "Scheduled {} timer(s) at {}x on looper '{}'",
        args.offsets.len(),
        args.rate,
        looper.name()
    );

    let deadline = started + args.timeout;
    let mut remaining = args.offsets.len();
    while remaining > 0 {
        let msg = match rx.recv_deadline(deadline) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => {
                anyhow::bail!(
                    "{} timer(s) still pending after {}",
                    remaining,
                    humantime::format_duration(args.timeout)
                );
            }
            Err(RecvTimeoutError::Disconnected) => anyhow::bail!("Notification channel closed"),
        };

        match msg.what() {
            WHAT_DISCONTINUITY => log::info!(
                "Clock discontinuity: anchor {}us, rate {}",
                msg.find_int64(ANCHOR_MEDIA_US_FIELD).unwrap_or(-1),
                msg.find_float(PLAYBACK_RATE_FIELD).unwrap_or(0.0)
            ),
            WHAT_TIMER => {
                remaining -= 1;
                let index = msg.find_int32(INDEX_FIELD).unwrap_or(-1);
                let offset = usize::try_from(index)
                    .ok()
                    .and_then(|i| args.offsets.get(i))
                    .copied()
                    .unwrap_or_default();
                let reason = match TimerReason::from_message(&msg) {
                    Some(TimerReason::Reached) => "reached",
                    Some(TimerReason::Reset) => "reset",
                    None => "unknown",
                };
                println!(
                    "timer {} (media {}) {} after {:?} real",
                    index,
                    humantime::format_duration(offset),
                    reason,
                    started.elapsed()
                );
            }
            other => log::debug!("Ignoring message what={:#x}", other),
        }
    }

    drop(clock);
    looper.stop().context("Failed to stop looper")?;
    Ok(())
}

//! `chronoloop jitter`: noisy anchor updates against a simulated clock.
//!
//! The clock runs on a [`ManualClock`], so the simulation takes no wall time.
//! Each step advances real time, then reports the ideal media position plus a
//! uniformly distributed error as the new anchor.

use anyhow::{Context, Result};
use chronoloop_core::{AnchorUpdate, Config, Error, ManualClock, MediaClock, KEEP_MAX_MEDIA_US};
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct JitterArgs {
    /// Number of anchor updates to send
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub updates: usize,

    /// Largest error added to each reported media position
    #[arg(short, long, default_value = "20ms", value_parser = humantime::parse_duration)]
    pub jitter: Duration,

    /// Real time between updates
    #[arg(short, long, default_value = "10ms", value_parser = humantime::parse_duration)]
    pub step: Duration,

    /// Random seed, for reproducible runs
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Outcome counts of a jitter run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JitterReport {
    pub seed: u64,
    pub updated: usize,
    pub suppressed: usize,
    pub rejected: usize,
    pub generation: u64,
    /// Clock media time minus ideal media time after the last update.
    pub final_error_us: i64,
}

impl fmt::Display for JitterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "seed:        {}", self.seed)?;
        writeln!(f, "updated:     {}", self.updated)?;
        writeln!(f, "suppressed:  {}", self.suppressed)?;
        writeln!(f, "rejected:    {}", self.rejected)?;
        writeln!(f, "generation:  {}", self.generation)?;
        write!(f, "final error: {}us", self.final_error_us)
    }
}

pub fn run(config: &Config, args: &JitterArgs) -> Result<JitterReport> {
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    let jitter_us = i64::try_from(args.jitter.as_micros()).context("Jitter too large")?;
    let step_us = i64::try_from(args.step.as_micros()).context("Step too large")?;

    let real = ManualClock::new(0);
    let clock = MediaClock::with_config(&config.clock, real.clone())
        .context("Failed to start media clock")?;
    log::info!(
        "Sending {} anchor updates, +/-{}us jitter every {}us (seed {})",
        args.updates,
        jitter_us,
        step_us,
        seed
    );

    let mut report = JitterReport {
        seed,
        ..JitterReport::default()
    };
    let mut now_us = 0i64;
    for _ in 0..args.updates {
        now_us = now_us.saturating_add(step_us);
        real.set(now_us);

        let error_us = if jitter_us > 0 {
            rng.random_range(-jitter_us..=jitter_us)
        } else {
            0
        };
        match clock.update_anchor(now_us + error_us, now_us, KEEP_MAX_MEDIA_US) {
            Ok(AnchorUpdate::Updated) => report.updated += 1,
            Ok(AnchorUpdate::Suppressed) => report.suppressed += 1,
            Err(Error::RejectedAnchorUpdate(reason)) => {
                log::debug!("Anchor at {}us rejected: {}", now_us, reason);
                report.rejected += 1;
            }
            Err(e) => return Err(e).context("Anchor update failed"),
        }
    }

    report.generation = clock.generation();
    if clock.anchor().is_some() {
        report.final_error_us = clock.get_media_time(now_us, true)? - now_us;
    }
    Ok(report)
}

//! Sliding-log rate limiting with an adaptive variant.
//!
//! A [`RateLimiter`] bounds calls to at most `max_calls` in any trailing
//! `period`. An [`AdaptiveRateLimiter`] additionally shrinks that bound after
//! an error streak and grows it back after a success streak.

use serde::Serialize;
use shared::RateLimitConfig;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Call log for one limiter
#[derive(Debug)]
struct Window {
    calls: VecDeque<Instant>,
    max_calls: u32,
}

impl Window {
    /// Drop calls that left the window, then trim to the current limit.
    fn cleanup(&mut self, now: Instant, period: Duration) {
        while let Some(&oldest) = self.calls.front() {
            if now.saturating_duration_since(oldest) >= period {
                self.calls.pop_front();
            } else {
                break;
            }
        }

        // A shrunk limit keeps only the newest calls
        while self.calls.len() > self.max_calls as usize {
            self.calls.pop_front();
        }
    }

    fn is_full(&self) -> bool {
        self.calls.len() >= self.max_calls as usize
    }
}

/// Snapshot of a limiter's window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub current_calls: usize,
    pub max_calls: u32,
    pub period_secs: f64,
    pub calls_remaining: u32,
    pub percentage_used: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveStats>,
}

/// Streak counters of an adaptive limiter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptiveStats {
    pub initial_max_calls: u32,
    pub consecutive_successes: u32,
    pub consecutive_errors: u32,
}

/// Sliding-log rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    window: Mutex<Window>,
    /// Serializes waiters so admission is first come, first served
    admission: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    /// Create a limiter admitting `max_calls` (at least 1) per `period`
    pub fn new(max_calls: u32, period: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            period,
            window: Mutex::new(Window {
                calls: VecDeque::with_capacity(max_calls as usize),
                max_calls,
            }),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_window(&self) -> MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check whether a call would be admitted right now, without recording it
    pub fn can_proceed(&self) -> bool {
        let mut window = self.lock_window();
        window.cleanup(Instant::now(), self.period);
        !window.is_full()
    }

    /// Wait until the window admits a call, then record it.
    ///
    /// Returns how long the caller was held back.
    pub async fn wait_if_needed(&self) -> Duration {
        let started = Instant::now();
        let _turn = self.admission.lock().await;

        loop {
            let wait = {
                let mut window = self.lock_window();
                let now = Instant::now();
                window.cleanup(now, self.period);

                if !window.is_full() {
                    window.calls.push_back(now);
                    return now.saturating_duration_since(started);
                }

                match window.calls.front() {
                    Some(&oldest) => (oldest + self.period).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            debug!(
                wait_ms = wait.as_millis() as u64,
                "Rate limit reached, waiting"
            );
            sleep(wait).await;
        }
    }

    /// Forget every recorded call
    pub fn reset(&self) {
        self.lock_window().calls.clear();
        debug!("Rate limiter reset");
    }

    pub fn max_calls(&self) -> u32 {
        self.lock_window().max_calls
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub(crate) fn set_max_calls(&self, max_calls: u32) {
        self.lock_window().max_calls = max_calls.max(1);
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut window = self.lock_window();
        window.cleanup(Instant::now(), self.period);

        let current_calls = window.calls.len();
        let max_calls = window.max_calls;
        RateLimiterStats {
            current_calls,
            max_calls,
            period_secs: self.period.as_secs_f64(),
            calls_remaining: max_calls.saturating_sub(current_calls as u32),
            percentage_used: current_calls as f64 / max_calls as f64 * 100.0,
            adaptive: None,
        }
    }
}

/// Tuning for [`AdaptiveRateLimiter`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSettings {
    /// Multiplier in (0, 1) applied after an error streak
    pub backoff_factor: f64,
    /// Multiplier above 1 applied after a success streak
    pub recovery_factor: f64,
    pub error_threshold: u32,
    pub success_threshold: u32,
    /// Grow by at least one call per recovery step
    pub recovery_min_step: bool,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            backoff_factor: 0.5,
            recovery_factor: 1.1,
            error_threshold: 3,
            success_threshold: 5,
            recovery_min_step: false,
        }
    }
}

impl From<&RateLimitConfig> for AdaptiveSettings {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            backoff_factor: config.backoff_factor,
            recovery_factor: config.recovery_factor,
            error_threshold: config.error_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            recovery_min_step: config.recovery_min_step,
        }
    }
}

#[derive(Debug, Default)]
struct Streaks {
    successes: u32,
    errors: u32,
}

/// Rate limiter whose limit follows reported request outcomes.
///
/// The limiter never infers outcomes itself: callers must report every
/// request through [`report_success`](Self::report_success) or
/// [`report_error`](Self::report_error).
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    limiter: RateLimiter,
    initial_max_calls: u32,
    settings: AdaptiveSettings,
    streaks: Mutex<Streaks>,
}

impl AdaptiveRateLimiter {
    pub fn new(max_calls: u32, period: Duration, settings: AdaptiveSettings) -> Self {
        let limiter = RateLimiter::new(max_calls, period);
        Self {
            initial_max_calls: limiter.max_calls(),
            limiter,
            settings,
            streaks: Mutex::new(Streaks::default()),
        }
    }

    fn lock_streaks(&self) -> MutexGuard<'_, Streaks> {
        self.streaks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn can_proceed(&self) -> bool {
        self.limiter.can_proceed()
    }

    pub async fn wait_if_needed(&self) -> Duration {
        self.limiter.wait_if_needed().await
    }

    /// Current effective limit, within `[1, initial_max_calls]`
    pub fn current_max_calls(&self) -> u32 {
        self.limiter.max_calls()
    }

    pub fn initial_max_calls(&self) -> u32 {
        self.initial_max_calls
    }

    /// Record a successful request; a full success streak grows the limit.
    pub fn report_success(&self) {
        let mut streaks = self.lock_streaks();
        streaks.errors = 0;
        streaks.successes += 1;

        if streaks.successes < self.settings.success_threshold {
            return;
        }
        streaks.successes = 0;

        let current = self.limiter.max_calls();
        let mut scaled = (current as f64 * self.settings.recovery_factor).round() as u32;
        if self.settings.recovery_min_step {
            scaled = scaled.max(current + 1);
        }
        let next = scaled.min(self.initial_max_calls);

        if next > current {
            self.limiter.set_max_calls(next);
            info!(from = current, to = next, "Rate limit increased");
        }
    }

    /// Record a failed request; a full error streak shrinks the limit.
    pub fn report_error(&self) {
        let mut streaks = self.lock_streaks();
        streaks.successes = 0;
        streaks.errors += 1;

        if streaks.errors < self.settings.error_threshold {
            return;
        }
        streaks.errors = 0;

        let current = self.limiter.max_calls();
        let next = ((current as f64 * self.settings.backoff_factor).round() as u32).max(1);

        if next < current {
            self.limiter.set_max_calls(next);
            warn!(from = current, to = next, "Rate limit decreased due to errors");
        }
    }

    pub fn reset(&self) {
        self.limiter.reset();
    }

    pub fn stats(&self) -> RateLimiterStats {
        let streaks = self.lock_streaks();
        let mut stats = self.limiter.stats();
        stats.adaptive = Some(AdaptiveStats {
            initial_max_calls: self.initial_max_calls,
            consecutive_successes: streaks.successes,
            consecutive_errors: streaks.errors,
        });
        stats
    }
}

/// Either limiter flavour, chosen once when a runtime is built.
#[derive(Debug)]
pub enum Limiter {
    Fixed(RateLimiter),
    Adaptive(AdaptiveRateLimiter),
}

impl Limiter {
    /// Build a limiter from the `[rate_limit]` section and per-type overrides
    pub fn from_config(
        config: &RateLimitConfig,
        max_calls: u32,
        period: Duration,
        adaptive: bool,
    ) -> Self {
        if adaptive {
            Limiter::Adaptive(AdaptiveRateLimiter::new(max_calls, period, config.into()))
        } else {
            Limiter::Fixed(RateLimiter::new(max_calls, period))
        }
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, Limiter::Adaptive(_))
    }

    pub fn can_proceed(&self) -> bool {
        match self {
            Limiter::Fixed(limiter) => limiter.can_proceed(),
            Limiter::Adaptive(limiter) => limiter.can_proceed(),
        }
    }

    pub async fn wait_if_needed(&self) -> Duration {
        match self {
            Limiter::Fixed(limiter) => limiter.wait_if_needed().await,
            Limiter::Adaptive(limiter) => limiter.wait_if_needed().await,
        }
    }

    /// Report a successful request. No-op for a fixed limiter.
    pub fn report_success(&self) {
        if let Limiter::Adaptive(limiter) = self {
            limiter.report_success();
        }
    }

    /// Report a failed request. No-op for a fixed limiter.
    pub fn report_error(&self) {
        if let Limiter::Adaptive(limiter) = self {
            limiter.report_error();
        }
    }

    pub fn max_calls(&self) -> u32 {
        match self {
            Limiter::Fixed(limiter) => limiter.max_calls(),
            Limiter::Adaptive(limiter) => limiter.current_max_calls(),
        }
    }

    pub fn reset(&self) {
        match self {
            Limiter::Fixed(limiter) => limiter.reset(),
            Limiter::Adaptive(limiter) => limiter.reset(),
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        match self {
            Limiter::Fixed(limiter) => limiter.stats(),
            Limiter::Adaptive(limiter) => limiter.stats(),
        }
    }
}

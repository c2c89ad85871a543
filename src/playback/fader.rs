//! Gain ramp for click-free transitions
//!
//! Play, pause, and stream switches must not step the output amplitude in a
//! single sample. [`Fader`] produces a linear 0..1 factor ramped over a
//! short wall-clock window (50 ms by default): the control thread calls
//! [`Fader::change`], the output callback calls [`Fader::frame_tick`] once
//! per frame and multiplies by [`Fader::sample_factor`].

use crate::config::FADE_MS;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// Which way the ramp moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeDirection {
    /// Ramp toward full gain (resume, stream start).
    In,
    /// Ramp toward silence (pause, stream stop).
    Out,
}

impl FadeDirection {
    fn increment(self) -> i32 {
        match self {
            FadeDirection::In => 1,
            FadeDirection::Out => -1,
        }
    }
}

/// Linear gain ramp shared between the control thread and the output
/// callback.
///
/// All fields are independent atomics read with relaxed ordering; a tick
/// racing a concurrent `change` can mis-gain a single frame, which is
/// inaudible, and the signed counter plus clamping keep any such race from
/// corrupting later frames.
pub struct Fader {
    /// Position along the ramp, in frames. `0..=limit`.
    cur: AtomicI64,
    /// Ramp length in frames. 0 means no ramp configured.
    limit: AtomicI64,
    /// Per-frame step: +1 fading in, -1 fading out, 0 idle.
    inc: AtomicI32,
    /// Ramp duration used to derive `limit` from a sample rate.
    fade_ms: u64,
}

impl Fader {
    pub fn new(fade_ms: u64) -> Self {
        Fader {
            cur: AtomicI64::new(0),
            limit: AtomicI64::new(0),
            inc: AtomicI32::new(0),
            fade_ms,
        }
    }

    /// Start ramping in the given direction at the given output rate.
    ///
    /// If the ramp length is unchanged and the previous ramp is still in
    /// progress, only the direction flips and the position keeps counting
    /// from where it is, so a pause during a fade-in reverses smoothly.
    /// Otherwise the position resets to the new ramp's starting end.
    pub fn change(&self, direction: FadeDirection, sample_rate: u32) {
        let new_limit = (sample_rate as u64 * self.fade_ms / 1000) as i64;
        let new_inc = direction.increment();
        let old_limit = self.limit.swap(new_limit, Ordering::Relaxed);
        let old_inc = self.inc.swap(new_inc, Ordering::Relaxed);
        let old_cur = self.cur.load(Ordering::Relaxed);
        if old_limit != new_limit || ramp_done(old_inc, old_cur, old_limit) {
            let start = if new_inc > 0 { 0 } else { new_limit };
            self.cur.store(start, Ordering::Relaxed);
        }
    }

    /// Advance the ramp by one output frame.
    pub fn frame_tick(&self) {
        let inc = self.inc.load(Ordering::Relaxed) as i64;
        if inc == 0 {
            return;
        }
        let limit = self.limit.load(Ordering::Relaxed);
        let cur = self.cur.load(Ordering::Relaxed);
        let next = (cur + inc).clamp(0, limit);
        if next != cur {
            self.cur.store(next, Ordering::Relaxed);
        }
    }

    /// Jump instantly to the ramp's terminal value.
    pub fn finish(&self) {
        let inc = self.inc.load(Ordering::Relaxed);
        if inc > 0 {
            self.cur
                .store(self.limit.load(Ordering::Relaxed), Ordering::Relaxed);
        } else if inc < 0 {
            self.cur.store(0, Ordering::Relaxed);
        }
    }

    /// True when the ramp has reached its terminal value (or none is
    /// running).
    pub fn finished(&self) -> bool {
        ramp_done(
            self.inc.load(Ordering::Relaxed),
            self.cur.load(Ordering::Relaxed),
            self.limit.load(Ordering::Relaxed),
        )
    }

    /// Current gain factor in [0, 1]; 1 when no ramp is configured.
    pub fn sample_factor(&self) -> f32 {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit <= 0 {
            return 1.0;
        }
        let cur = self.cur.load(Ordering::Relaxed);
        (cur as f32 / limit as f32).clamp(0.0, 1.0)
    }
}

impl Default for Fader {
    fn default() -> Self {
        Fader::new(FADE_MS)
    }
}

fn ramp_done(inc: i32, cur: i64, limit: i64) -> bool {
    inc == 0 || (inc > 0 && cur >= limit) || (inc < 0 && cur <= 0)
}

//! Smooth soft-clip curve
//!
//! Maps samples through an identity region, a cubic knee, and a saturation
//! ceiling so that volume boosts and hot masters land at ±1.0 without the
//! harmonic splatter of a hard clamp.

/// Piecewise soft-clip transfer function, symmetric around zero.
///
/// Below `x1` the curve is the identity; from `x2` upward it is the
/// constant 1; between them a cubic Hermite segment joins the two with
/// matching value and slope at `x1` (slope 1) and at `x2` (slope 0).
#[derive(Debug, Clone)]
pub struct SmoothClip {
    x1: f32,
    x2: f32,
    /// Hermite segment coefficients over t = (y - x1) / (x2 - x1).
    t3: f64,
    t2: f64,
    t1: f64,
}

impl SmoothClip {
    pub fn new(x1: f32, x2: f32) -> Self {
        let mut clip = SmoothClip {
            x1: 0.0,
            x2: 0.0,
            t3: 0.0,
            t2: 0.0,
            t1: 0.0,
        };
        clip.set_x(x1, x2);
        clip
    }

    /// Set the knee. `x1` is clamped into [0, 1]; `x2` is raised to at
    /// least `x1`. Equal bounds degrade to identity-then-hard-limit.
    pub fn set_x(&mut self, x1: f32, x2: f32) {
        let x1 = x1.clamp(0.0, 1.0);
        let x2 = x2.max(x1);
        self.x1 = x1;
        self.x2 = x2;
        if x1 == x2 {
            self.t3 = 0.0;
            self.t2 = 0.0;
            self.t1 = 0.0;
            return;
        }
        let (x1, x2) = (x1 as f64, x2 as f64);
        let h = x2 - x1;
        self.t3 = x1 + x2 - 2.0;
        self.t2 = 3.0 - 3.0 * x1 - 2.0 * h;
        self.t1 = h;
    }

    /// Apply the curve to one sample. Negative inputs mirror.
    pub fn apply(&self, y: f32) -> f32 {
        if y < 0.0 {
            return -self.apply(-y);
        }
        if y <= self.x1 {
            return y;
        }
        if y >= self.x2 {
            return 1.0;
        }
        let x1 = self.x1 as f64;
        let t = (y as f64 - x1) / (self.x2 as f64 - x1);
        let v = ((self.t3 * t + self.t2) * t + self.t1) * t + x1;
        // A wide knee overshoots full scale partway through the segment;
        // hold it at the ceiling instead of letting it ring back down.
        v.clamp(x1, 1.0) as f32
    }
}

impl Default for SmoothClip {
    fn default() -> Self {
        SmoothClip::new(0.95, 10.0)
    }
}

//! Probabilistic intervention completion.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::CompletionCurve;
use crate::model::{DEFAULT_SEVERITY, clamp_severity};

/// Source of uniform draws in `[0, 1)` for completion rolls.
pub trait CompletionDraws: Send {
    fn next_uniform(&mut self) -> f64;
}

/// Always draws the same value. `FixedDraw(0.0)` completes at the first
/// eligible tick with a positive probability; `FixedDraw(1.0)` never does.
#[derive(Debug, Clone, Copy)]
pub struct FixedDraw(pub f64);

impl CompletionDraws for FixedDraw {
    fn next_uniform(&mut self) -> f64 {
        self.0
    }
}

/// Draws from a ChaCha8 generator, seeded for reproducible runs.
pub struct RandomDraws {
    rng: ChaCha8Rng,
}

impl RandomDraws {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { rng }
    }
}

impl CompletionDraws for RandomDraws {
    fn next_uniform(&mut self) -> f64 {
        self.rng.gen_range(0.0..1.0)
    }
}

/// Per-second completion probability in percent for `units` on site at an
/// incident of `severity`.
pub fn completion_percent(curve: &CompletionCurve, units: usize, severity: Option<u8>) -> f64 {
    let severity = clamp_severity(severity.unwrap_or(DEFAULT_SEVERITY));
    let extra_units = units.saturating_sub(1) as f64;
    let severity_offset = f64::from(severity) - f64::from(DEFAULT_SEVERITY);
    let percent = curve.base_percent + extra_units * curve.per_extra_unit_percent
        - severity_offset * curve.per_severity_percent;
    percent.clamp(curve.min_percent, curve.max_percent)
}

/// Probability of completing within `delta_seconds` given a per-second
/// probability `per_second` (as a fraction).
pub fn per_tick_probability(per_second: f64, delta_seconds: f64) -> f64 {
    if delta_seconds <= 0.0 {
        return 0.0;
    }
    let per_second = per_second.clamp(0.0, 1.0);
    1.0 - (1.0 - per_second).powf(delta_seconds)
}

//! Arbitrary-base log-domain arithmetic.
//!
//! Scores throughout the search are kept as signed integers in an
//! arbitrary log base (search.md §4.1, §6) rather than as `f64` natural
//! logs, so that score addition is integer addition and comparisons are
//! exact. [`LogMath`] converts between that internal base and the
//! natural log / base-10 values that the HTK lattice format and external
//! language models use.
//!
//! The shape of this API (construct from `base`/`shift`, convert to/from
//! natural log, add two log-domain values) follows the logmath helper
//! exposed by `pocketsphinx`'s own Rust bindings; this implementation
//! does the arithmetic natively instead of linking the C library.

/// Sentinel used throughout bptbl/arc_buffer for "no score" / "unreachable".
pub const WORST_SCORE: i32 = i32::MIN / 2;

#[derive(Debug, Clone, Copy)]
pub struct LogMath {
    base: f64,
    ln_base: f64,
    shift: u8,
}

impl LogMath {
    /// `base` is the logarithm base scores are stored in; `shift` right-shifts
    /// the stored log value by that many bits (used by the original to trade
    /// dynamic range for precision, carried here for API parity).
    pub fn new(base: f64, shift: u8) -> Self {
        assert!(base > 1.0, "log base must be > 1.0");
        LogMath {
            base,
            ln_base: base.ln(),
            shift,
        }
    }

    /// The default base used by pocketsphinx-derived tools (1.0001).
    pub fn default_base() -> Self {
        LogMath::new(1.0001, 0)
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn shift(&self) -> u8 {
        self.shift
    }

    /// Convert a natural-log probability (`ln p`, `p` in `(0, 1]`) to this
    /// log base, rounding to the nearest internal integer score.
    pub fn log_to_logmath(&self, natural_log: f64) -> i32 {
        let scaled = natural_log / self.ln_base;
        let shifted = scaled / (1i64 << self.shift) as f64;
        shifted.round() as i32
    }

    /// Convert an internal log-base score back to a natural log.
    pub fn logmath_to_log(&self, score: i32) -> f64 {
        let shifted = score as f64 * (1i64 << self.shift) as f64;
        shifted * self.ln_base
    }

    /// `log(exp_logbase(a) + exp_logbase(b))`, computed without leaving
    /// the log domain. `WORST_SCORE` is treated as `-infinity`.
    pub fn add(&self, a: i32, b: i32) -> i32 {
        if a == WORST_SCORE {
            return b;
        }
        if b == WORST_SCORE {
            return a;
        }
        let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
        let diff = (hi - lo) as f64 * (1i64 << self.shift) as f64;
        let correction = (1.0 + self.base.powf(-diff)).ln() / self.ln_base;
        hi + (correction / (1i64 << self.shift) as f64).round() as i32
    }
}

impl Default for LogMath {
    fn default() -> Self {
        LogMath::default_base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_natural_log() {
        let lm = LogMath::default_base();
        let original = -3.2_f64;
        let score = lm.log_to_logmath(original);
        let back = lm.logmath_to_log(score);
        assert!((back - original).abs() < 1e-3);
    }

    #[test]
    fn add_is_commutative_and_identity_on_worst_score() {
        let lm = LogMath::default_base();
        let a = lm.log_to_logmath(-1.0);
        let b = lm.log_to_logmath(-2.0);
        assert_eq!(lm.add(a, b), lm.add(b, a));
        assert_eq!(lm.add(a, WORST_SCORE), a);
        assert_eq!(lm.add(WORST_SCORE, b), b);
    }

    #[test]
    fn add_is_at_least_the_larger_operand() {
        let lm = LogMath::default_base();
        let a = lm.log_to_logmath(-1.0);
        let b = lm.log_to_logmath(-5.0);
        assert!(lm.add(a, b) >= a.max(b));
    }
}

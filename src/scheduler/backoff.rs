use rand::Rng;
use std::time::Duration;

/// Exponential backoff schedule: `base * 2^(attempt - 1)`, capped
///
/// `attempt` is the number of attempts already consumed; the first retry
/// (attempt 1) waits the base delay. Pure so the schedule itself is
/// testable without a clock.
pub fn delay_for_attempt(attempt: u32, base: Duration, cap: Duration) -> Duration {
    if attempt <= 1 {
        return base.min(cap);
    }
    let exponent = (attempt - 1).min(32);
    let multiplier = 2u32.saturating_pow(exponent);
    base.saturating_mul(multiplier).min(cap)
}

/// Apply +/-20% jitter so parked jobs do not retry in lockstep
pub fn with_jitter(delay: Duration, rng: &mut impl Rng) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rng.gen_range(0.8..1.2);
    delay.mul_f64(factor)
}

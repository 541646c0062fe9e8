//! Scaled-integer arithmetic primitives.
//!
//! Every operation widens to u128 before scaling so that intermediate
//! products cannot overflow silently, and returns [`Error`] instead of
//! panicking for any out-of-domain input.

use super::{Error, LN_2, MAX_EXP, PRECISION};

/// Fixed-point multiplication: `(a * b) / PRECISION`.
pub fn mul(a: u64, b: u64) -> Result<u64, Error> {
    let product = (a as u128)
        .checked_mul(b as u128)
        .ok_or(Error::ArithmeticOverflow)?;
    let result = product / PRECISION as u128;
    u64::try_from(result).map_err(|_| Error::ArithmeticOverflow)
}

/// Fixed-point division: `(a * PRECISION) / b`.
pub fn div(a: u64, b: u64) -> Result<u64, Error> {
    if b == 0 {
        return Err(Error::DivisionByZero);
    }
    let numerator = (a as u128)
        .checked_mul(PRECISION as u128)
        .ok_or(Error::ArithmeticOverflow)?;
    let result = numerator / b as u128;
    u64::try_from(result).map_err(|_| Error::ArithmeticOverflow)
}

/// Fixed-point exponential `e^x` for `x ∈ [0, MAX_EXP]`.
///
/// Argument reduction: `e^x = 2^k · e^r` with `r = x - k·ln(2) ∈
/// [0, ln 2)`, then `e^r = (e^(r/2))²` with a Padé (2,2) rational
/// approximation of `e^(r/2)`. The Padé error scales with the fifth
/// power of its argument, so halving it once more keeps the result
/// within roughly one part in 100,000 at the worst point of the
/// domain and far better elsewhere.
pub fn exp(x: u64) -> Result<u64, Error> {
    if x > MAX_EXP {
        return Err(Error::Domain {
            reason: "exp argument exceeds maximum exponent",
        });
    }

    let k = x / LN_2;
    let r = x - k * LN_2;
    let h = r / 2;

    // Padé (2,2): e^h ≈ (1 + h/2 + h²/12) / (1 - h/2 + h²/12)
    let h2 = mul(h, h)?;
    let num = PRECISION
        .checked_add(h / 2)
        .and_then(|v| v.checked_add(h2 / 12))
        .ok_or(Error::ArithmeticOverflow)?;
    let denom = PRECISION
        .checked_sub(h / 2)
        .and_then(|v| v.checked_add(h2 / 12))
        .ok_or(Error::ArithmeticOverflow)?;
    let exp_h = div(num, denom)?;
    let exp_r = mul(exp_h, exp_h)?;

    // x ≤ 20 implies k ≤ 28, so the shifted value fits u64 comfortably.
    let result = (exp_r as u128) << k;
    u64::try_from(result).map_err(|_| Error::ArithmeticOverflow)
}

/// Fixed-point `e^(-x)` for non-negative `x`.
///
/// Saturates to zero once `x` is large enough that `e^(-x)` is below
/// one fixed-point unit.
pub fn exp_neg(x: u64) -> Result<u64, Error> {
    if x > MAX_EXP {
        return Ok(0);
    }
    div(PRECISION, exp(x)?)
}

/// Fixed-point natural logarithm, signed result.
///
/// Range reduction by powers of two to `[1, 2)`, then the series
/// `ln(x) = 2·(y + y³/3 + y⁵/5 + y⁷/7)` with `y = (x-1)/(x+1)`,
/// adjusted by `k·ln(2)`.
pub fn ln(x: u64) -> Result<i64, Error> {
    if x == 0 {
        return Err(Error::Domain {
            reason: "ln argument must be positive",
        });
    }
    if x == PRECISION {
        return Ok(0);
    }

    let mut reduced = x;
    let mut exponent: i64 = 0;
    while reduced >= 2 * PRECISION {
        reduced /= 2;
        exponent += 1;
    }
    while reduced < PRECISION {
        reduced *= 2;
        exponent -= 1;
    }

    // reduced ∈ [1, 2), so y ∈ [0, 1/3] and the series converges fast.
    let y = div(reduced - PRECISION, reduced + PRECISION)?;
    let y2 = mul(y, y)?;
    let y3 = mul(y2, y)?;
    let y5 = mul(y3, y2)?;
    let y7 = mul(y5, y2)?;
    let series = 2u64
        .checked_mul(y + y3 / 3 + y5 / 5 + y7 / 7)
        .ok_or(Error::ArithmeticOverflow)?;

    let result = series as i128 + exponent as i128 * LN_2 as i128;
    i64::try_from(result).map_err(|_| Error::ArithmeticOverflow)
}

/// Numerically stable `ln(e^x + e^y)`.
///
/// `ln(e^x + e^y) = max(x, y) + ln(1 + e^(-|x - y|))`, which keeps the
/// exponent argument within the valid domain regardless of how large
/// the inputs are.
pub fn log_sum_exp(x: u64, y: u64) -> Result<u64, Error> {
    let (max_val, diff) = if x >= y { (x, x - y) } else { (y, y - x) };

    let exp_neg_diff = exp_neg(diff)?;
    if exp_neg_diff == 0 {
        return Ok(max_val);
    }
    let ln_term = ln(PRECISION + exp_neg_diff)?;
    // 1 + e^(-diff) ∈ (1, 2], so ln_term is non-negative.
    max_val
        .checked_add(ln_term as u64)
        .ok_or(Error::ArithmeticOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::testutil::{fixed, float};

    fn assert_close(actual: u64, expected: f64, rel_tolerance: f64) {
        let actual = float(actual);
        let err = (actual - expected).abs() / expected.abs().max(1e-9);
        assert!(
            err < rel_tolerance,
            "expected ≈{expected}, got {actual} (rel err {err})"
        );
    }

    #[test]
    fn mul_basic() {
        assert_eq!(mul(fixed(1.5), fixed(2.0)).unwrap(), fixed(3.0));
        assert_eq!(mul(fixed(0.5), fixed(0.5)).unwrap(), fixed(0.25));
        assert_eq!(mul(0, fixed(5.0)).unwrap(), 0);
        assert_eq!(mul(PRECISION, fixed(5.5)).unwrap(), fixed(5.5));
    }

    #[test]
    fn mul_overflow() {
        assert_eq!(mul(u64::MAX, u64::MAX), Err(Error::ArithmeticOverflow));
    }

    #[test]
    fn div_basic() {
        assert_eq!(div(fixed(5.0), fixed(2.0)).unwrap(), fixed(2.5));
        assert_eq!(div(fixed(1.0), fixed(4.0)).unwrap(), fixed(0.25));
        assert_eq!(div(0, fixed(5.0)).unwrap(), 0);
    }

    #[test]
    fn div_by_zero() {
        assert_eq!(div(fixed(5.0), 0), Err(Error::DivisionByZero));
    }

    #[test]
    fn mul_div_roundtrip() {
        let a = fixed(3.5);
        let b = fixed(7.2);
        let product = mul(a, b).unwrap();
        let back = div(product, b).unwrap();
        assert!(a.abs_diff(back) < 10);
    }

    #[test]
    fn exp_accuracy() {
        assert_eq!(exp(0).unwrap(), PRECISION);
        assert_close(exp(PRECISION).unwrap(), 2.718281828, 1e-5);
        assert_close(exp(10 * PRECISION).unwrap(), 22026.4658, 1e-5);
        // The domain edge is the worst point for the approximation.
        assert_close(exp(MAX_EXP).unwrap(), 485165195.4, 1e-5);
    }

    #[test]
    fn exp_rejects_out_of_domain() {
        assert!(matches!(
            exp(MAX_EXP + 1),
            Err(Error::Domain { .. })
        ));
        assert!(matches!(
            exp(25 * PRECISION),
            Err(Error::Domain { .. })
        ));
    }

    #[test]
    fn exp_neg_saturates() {
        assert_eq!(exp_neg(0).unwrap(), PRECISION);
        assert_close(exp_neg(PRECISION).unwrap(), 0.367879441, 1e-4);
        // Beyond the domain bound the result is below one fixed-point
        // unit, so zero is the closest representable value.
        assert_eq!(exp_neg(MAX_EXP + 1).unwrap(), 0);
    }

    #[test]
    fn ln_accuracy() {
        assert_eq!(ln(PRECISION).unwrap(), 0);
        let e = fixed(2.718281828);
        assert!((ln(e).unwrap() - PRECISION as i64).unsigned_abs() < 100_000);
        let ln_half = ln(fixed(0.5)).unwrap();
        assert!((ln_half + LN_2 as i64).unsigned_abs() < 1_000);
        let ln_1000 = ln(fixed(1000.0)).unwrap();
        assert!((ln_1000 - fixed(6.907755279) as i64).unsigned_abs() < 100_000);
    }

    #[test]
    fn ln_rejects_zero() {
        assert!(matches!(ln(0), Err(Error::Domain { .. })));
    }

    #[test]
    fn exp_ln_roundtrip() {
        for value in [1.0f64, 2.5, 10.0, 123.456] {
            let x = fixed(value);
            let roundtrip = exp(ln(x).unwrap() as u64).unwrap();
            assert_close(roundtrip, value, 1e-3);
        }
    }

    #[test]
    fn log_sum_exp_stability() {
        // Large but close arguments never feed exp anything above the
        // domain bound.
        let x = 15 * PRECISION;
        let y = 14 * PRECISION;
        let result = log_sum_exp(x, y).unwrap();
        assert!(result > x);
        assert!(result < x + PRECISION);

        // Far-apart arguments collapse to the max.
        let far = log_sum_exp(100 * PRECISION, 0).unwrap();
        assert_eq!(far, 100 * PRECISION);
    }

    #[test]
    fn log_sum_exp_equal_arguments() {
        // ln(2·e^x) = x + ln(2)
        let result = log_sum_exp(fixed(3.0), fixed(3.0)).unwrap();
        assert_close(result, 3.0 + 0.693147180, 1e-4);
    }
}

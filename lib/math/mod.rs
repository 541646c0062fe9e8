//! Fixed-point mathematics for the LMSR market maker.
//!
//! All values are scaled integers with 9 decimal digits of precision.
//! No floating point is used anywhere in this module tree; a silent
//! overflow or NaN would corrupt market quantities irreversibly, so
//! every operation returns a typed error for out-of-domain input.

use thiserror::Error;

pub mod fixed;
pub mod lmsr;

/// Fixed-point scale: 1.0 is represented as 1_000_000_000.
pub const PRECISION: u64 = 1_000_000_000;

/// Natural logarithm of 2 in fixed-point (ln(2) ≈ 0.693147180).
pub const LN_2: u64 = 693_147_180;

/// Maximum argument accepted by [`fixed::exp`].
///
/// e^20 ≈ 4.85e8, which still fits u64 at 9 decimals of precision.
pub const MAX_EXP: u64 = 20 * PRECISION;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum Error {
    #[error("arithmetic overflow")]
    ArithmeticOverflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("input outside valid domain: {reason}")]
    Domain { reason: &'static str },
    #[error("inverse solve failed to converge after {iterations} iterations")]
    Convergence { iterations: u32 },
}

//! Numerically stable scalar primitives.
//!
//! Every nonlinearity the inference loop touches lives here, in the max-subtracted
//! formulation, so that finite masked-valid inputs can never produce NaN/Inf
//! further up the stack.

/// Logistic sigmoid, stable for large `|x|`.
///
/// Evaluates `1 / (1 + e^-x)` for non-negative `x` and the algebraically
/// equivalent `e^x / (1 + e^x)` for negative `x`, so the exponent argument is
/// never positive.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Softplus `ln(1 + e^x)`, stable for large `|x|`.
///
/// Uses the identity `softplus(x) = max(x, 0) + ln(1 + e^-|x|)` — the exponent
/// argument is never positive, and the linear term carries the growth.
#[inline]
pub fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Binary cross-entropy evaluated from the logit, not the probability.
///
/// `bce(l, y) = softplus(l) - y * l = -[y ln σ(l) + (1-y) ln(1-σ(l))]`.
/// Working in logit space avoids `ln(0)` when a marginal saturates.
#[inline]
pub fn bce_with_logit(logit: f32, target: f32) -> f32 {
    softplus(logit) - target * logit
}

/// Log-sum-exp over a slice with max subtraction.
///
/// Returns `-inf` for an empty slice, matching the empty-sum convention.
pub fn log_sum_exp(xs: &[f32]) -> f32 {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f32 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

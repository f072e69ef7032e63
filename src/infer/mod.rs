//! Iterative approximate inference over semantic dependency graphs.
//!
//! Because a token may take several heads, the output space is a general
//! directed graph and exact marginals are intractable once triplet factors
//! enter the model. This module provides the `InferenceKernel` seam with two
//! interchangeable strategies selected by configuration:
//!
//! - [`mfvi`] — mean-field variational inference (fixed-point updates)
//! - [`lbp`] — loopy belief propagation (log-space message passing)
//!
//! Both run a fixed number of synchronous rounds over masked potentials and
//! return the full per-iteration marginal trace, plus the replay state needed
//! to run the unrolled loop backward for gradients. The engine is a pure
//! function of its inputs: nothing is carried between sentences or batches.

pub mod lbp;
pub mod mfvi;

use serde::{Deserialize, Serialize};

use crate::assemble::{PotentialGradients, Potentials};
use crate::chart::{check_same_n, ArcChart, ArcMask, TripletChart};
use crate::error::{ArcmargResult, ChartError, InferError};
use crate::kernel::{self, MathKernel};
use crate::num::sigmoid;

/// Approximate-inference strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Mean-field variational inference.
    #[default]
    Mfvi,
    /// Loopy belief propagation.
    Lbp,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Mfvi => write!(f, "mfvi"),
            Strategy::Lbp => write!(f, "lbp"),
        }
    }
}

/// Configuration for the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Which strategy to run.
    pub strategy: Strategy,
    /// Number of fixed-point / message-passing rounds. `0` degrades to the
    /// closed-form unary-only case `q = sigmoid(u)`.
    pub max_iter: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Mfvi,
            max_iter: 3,
        }
    }
}

/// The three triplet factor types, named by the configuration they score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripletKind {
    /// `(i, j, k)`: head `i` with dependents `j`, `k` — arcs `(i,j)`, `(i,k)`.
    Sibling,
    /// `(i, j, k)`: dependent `j` with heads `i`, `k` — arcs `(i,j)`, `(k,j)`.
    Coparent,
    /// `(i, j, k)`: chain `i → j → k` — arcs `(i,j)`, `(j,k)`.
    Grandparent,
}

/// Zero every triplet entry whose factor is structurally undefined: the two
/// coupled arcs must both be admissible and the three indices pairwise
/// distinct (a factor may not couple an arc with itself).
pub(crate) fn mask_triplet(chart: &TripletChart, mask: &ArcMask, kind: TripletKind) -> TripletChart {
    let n = chart.n();
    let mut out = TripletChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                if i == j || j == k || i == k {
                    continue;
                }
                let arcs_ok = match kind {
                    TripletKind::Sibling => mask.allows(i, j) && mask.allows(i, k),
                    TripletKind::Coparent => mask.allows(i, j) && mask.allows(k, j),
                    TripletKind::Grandparent => mask.allows(i, j) && mask.allows(j, k),
                };
                if arcs_ok {
                    out.set(i, j, k, chart.get(i, j, k));
                }
            }
        }
    }
    out
}

/// Zero a chart outside the mask.
pub(crate) fn masked_copy(chart: &ArcChart, mask: &ArcMask) -> ArcChart {
    let n = chart.n();
    let mut out = ArcChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            if mask.allows(i, j) {
                out.set(i, j, chart.get(i, j));
            }
        }
    }
    out
}

/// Elementwise sigmoid under the mask; masked positions are exactly `0`.
pub(crate) fn sigmoid_masked(logits: &ArcChart, mask: &ArcMask) -> ArcChart {
    let n = logits.n();
    let mut out = ArcChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            if mask.allows(i, j) {
                out.set(i, j, sigmoid(logits.get(i, j)));
            }
        }
    }
    out
}

/// `u + f` under the mask; masked positions are exactly `0`.
pub(crate) fn masked_add(u: &ArcChart, f: &ArcChart, mask: &ArcMask) -> ArcChart {
    let n = u.n();
    let mut out = ArcChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            if mask.allows(i, j) {
                out.set(i, j, u.get(i, j) + f.get(i, j));
            }
        }
    }
    out
}

/// Potentials with the mask applied, ready for iteration.
///
/// Unary entries outside the mask and triplet entries whose factor is
/// undefined are zeroed once up front, so the iteration loops never have to
/// re-test admissibility of the *other* arc — a zero potential contributes
/// nothing in either strategy.
pub(crate) struct MaskedPotentials {
    pub n: usize,
    pub unary: ArcChart,
    pub sib: TripletChart,
    pub cop: TripletChart,
    pub grd: TripletChart,
    pub mask: ArcMask,
}

impl MaskedPotentials {
    pub fn new(potentials: &Potentials, mask: &ArcMask) -> Self {
        Self {
            n: potentials.n(),
            unary: masked_copy(&potentials.unary, mask),
            sib: mask_triplet(&potentials.sib, mask, TripletKind::Sibling),
            cop: mask_triplet(&potentials.cop, mask, TripletKind::Coparent),
            grd: mask_triplet(&potentials.grd, mask, TripletKind::Grandparent),
            mask: mask.clone(),
        }
    }
}

/// Per-strategy state retained so the unrolled loop can be replayed backward.
pub(crate) enum Replay {
    /// `max_iter = 0`: the closed-form unary-only case, no iteration state.
    Unary,
    /// Mean field needs the pre-iteration beliefs `q⁰ = sigmoid(u)`.
    Mfvi { q0: ArcChart },
    /// Loopy BP needs every iteration's message tensors.
    Lbp { states: Vec<lbp::LbpMessages> },
}

/// The result of one inference call: the ordered per-iteration trace plus the
/// replay state for the backward pass.
///
/// The trace has `max_iter` entries, or a single entry when `max_iter = 0`.
/// Marginals at masked positions are exactly `0`.
pub struct InferenceRun {
    strategy: Strategy,
    logits: Vec<ArcChart>,
    marginals: Vec<ArcChart>,
    pub(crate) replay: Replay,
}

impl InferenceRun {
    /// The strategy that produced this run.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Number of traced iterations (at least 1).
    pub fn iterations(&self) -> usize {
        self.marginals.len()
    }

    /// The ordered per-iteration marginal charts.
    pub fn trace(&self) -> &[ArcChart] {
        &self.marginals
    }

    /// The per-iteration logits (pre-sigmoid beliefs) matching [`Self::trace`].
    ///
    /// The training adapter computes cross-entropy from these rather than from
    /// the marginals, so saturated beliefs never produce `ln(0)`.
    pub fn logits(&self) -> &[ArcChart] {
        &self.logits
    }

    /// The final iteration's marginals.
    pub fn marginals(&self) -> &ArcChart {
        self.marginals
            .last()
            .expect("an InferenceRun always traces at least one iteration")
    }
}

/// The capability seam between the engine and its two strategies: one
/// contract, two implementations, chosen by configuration.
pub(crate) trait InferenceKernel: Send + Sync {
    /// Run exactly `max_iter` synchronous rounds and trace every iteration.
    fn run(&self, mp: &MaskedPotentials, max_iter: usize, math: &dyn MathKernel) -> InferenceRun;

    /// Replay the unrolled loop in reverse, consuming one logit-gradient chart
    /// per traced iteration.
    fn backward(
        &self,
        mp: &MaskedPotentials,
        run: &InferenceRun,
        grad_logits: &[ArcChart],
        math: &dyn MathKernel,
    ) -> Result<PotentialGradients, InferError>;
}

/// Validate that every potential chart and the mask agree on `n`.
fn check_potentials(potentials: &Potentials, mask: &ArcMask) -> Result<usize, ChartError> {
    let n = potentials.n();
    if n == 0 {
        return Err(ChartError::Empty);
    }
    check_same_n(n, potentials.sib.n())?;
    check_same_n(n, potentials.cop.n())?;
    check_same_n(n, potentials.grd.n())?;
    check_same_n(n, mask.n())?;
    Ok(n)
}

/// Select the kernel for a strategy.
pub(crate) fn kernel_for(strategy: Strategy) -> Box<dyn InferenceKernel> {
    match strategy {
        Strategy::Mfvi => Box::new(mfvi::MfviKernel),
        Strategy::Lbp => Box::new(lbp::LbpKernel),
    }
}

/// The shared `max_iter = 0` degradation: `q = sigmoid(u)` under mask,
/// trace of length 1.
pub(crate) fn unary_run(mp: &MaskedPotentials, strategy: Strategy) -> InferenceRun {
    let logits = masked_copy(&mp.unary, &mp.mask);
    let marginals = sigmoid_masked(&mp.unary, &mp.mask);
    InferenceRun {
        strategy,
        logits: vec![logits],
        marginals: vec![marginals],
        replay: Replay::Unary,
    }
}

/// Backward of [`unary_run`]: the unary gradient is the logit gradient, the
/// triplet charts never entered the computation.
pub(crate) fn unary_backward(
    mp: &MaskedPotentials,
    grad_logits: &[ArcChart],
) -> PotentialGradients {
    let mut grads = PotentialGradients::zeros(mp.n);
    grads.unary = masked_copy(&grad_logits[0], &mp.mask);
    grads
}

/// The approximate-inference engine.
///
/// Owns the strategy kernel and the SIMD math kernel; holds no per-sentence
/// state, so one engine may serve concurrent batch elements.
pub struct Engine {
    config: InferenceConfig,
    strategy: Box<dyn InferenceKernel>,
    math: Box<dyn MathKernel>,
}

impl Engine {
    /// Create an engine with the given configuration.
    pub fn new(config: InferenceConfig) -> Self {
        let math = kernel::best_kernel();
        tracing::debug!(
            strategy = %config.strategy,
            max_iter = config.max_iter,
            isa = %math.isa_level(),
            "initializing inference engine"
        );
        Self {
            config,
            strategy: kernel_for(config.strategy),
            math,
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Run approximate inference for one sentence.
    ///
    /// All inputs are read-only; the returned run owns fresh charts. Shape
    /// mismatches between the potentials and the mask are fatal.
    pub fn infer(&self, potentials: &Potentials, mask: &ArcMask) -> ArcmargResult<InferenceRun> {
        let n = check_potentials(potentials, mask).map_err(InferError::Chart)?;

        let mp = MaskedPotentials::new(potentials, mask);
        tracing::trace!(n, max_iter = self.config.max_iter, strategy = %self.config.strategy, "running inference");
        Ok(self.strategy.run(&mp, self.config.max_iter, self.math.as_ref()))
    }

    /// Backpropagate per-iteration logit gradients through the unrolled
    /// inference loop.
    ///
    /// `grad_logits` holds one chart per traced iteration (see
    /// [`crate::train`] for how the loss produces them); entries outside the
    /// mask are ignored. The returned gradients are in the assembled
    /// parameterization — apply [`PotentialGradients::into_raw`] to fold the
    /// symmetric charts onto raw scorer outputs.
    pub fn infer_backward(
        &self,
        potentials: &Potentials,
        mask: &ArcMask,
        run: &InferenceRun,
        grad_logits: &[ArcChart],
    ) -> ArcmargResult<PotentialGradients> {
        let n = check_potentials(potentials, mask).map_err(InferError::Chart)?;
        if run.strategy() != self.config.strategy {
            return Err(InferError::StrategyMismatch {
                engine: self.config.strategy.to_string(),
                run: run.strategy().to_string(),
            }
            .into());
        }
        if grad_logits.len() != run.iterations() {
            return Err(InferError::TraceLen {
                expected: run.iterations(),
                got: grad_logits.len(),
            }
            .into());
        }
        for grad in grad_logits {
            check_same_n(n, grad.n()).map_err(InferError::Chart)?;
        }

        let mp = MaskedPotentials::new(potentials, mask);
        let mut grads = self
            .strategy
            .backward(&mp, run, grad_logits, self.math.as_ref())?;

        // Gradients live on the same structural support as the potentials.
        grads.unary = masked_copy(&grads.unary, mask);
        grads.sib = mask_triplet(&grads.sib, mask, TripletKind::Sibling);
        grads.cop = mask_triplet(&grads.cop, mask, TripletKind::Coparent);
        grads.grd = mask_triplet(&grads.grd, mask, TripletKind::Grandparent);
        Ok(grads)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("strategy", &self.config.strategy)
            .field("max_iter", &self.config.max_iter)
            .field("isa", &self.math.isa_level())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unary_potentials(n: usize) -> Potentials {
        let mut unary = ArcChart::zeros(n);
        for i in 0..n {
            for j in 0..n {
                unary.set(i, j, (i as f32) - (j as f32) * 0.5);
            }
        }
        Potentials::unary_only(unary).unwrap()
    }

    #[test]
    fn default_config_is_three_mfvi_rounds() {
        let config = InferenceConfig::default();
        assert_eq!(config.strategy, Strategy::Mfvi);
        assert_eq!(config.max_iter, 3);
    }

    #[test]
    fn strategy_names_match_config_vocabulary() {
        assert_eq!(Strategy::Mfvi.to_string(), "mfvi");
        assert_eq!(Strategy::Lbp.to_string(), "lbp");
        let parsed: Strategy = serde_json::from_str("\"lbp\"").unwrap();
        assert_eq!(parsed, Strategy::Lbp);
    }

    #[test]
    fn mask_triplet_zeroes_repeated_indices() {
        let n = 4;
        let mut chart = TripletChart::zeros(n);
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    chart.set(i, j, k, 1.0);
                }
            }
        }
        let mask = ArcMask::full(n).unwrap();
        let masked = mask_triplet(&chart, &mask, TripletKind::Sibling);
        for i in 0..n {
            for j in 0..n {
                assert_eq!(masked.get(i, j, j), 0.0);
                assert_eq!(masked.get(i, i, j), 0.0);
                assert_eq!(masked.get(i, j, i), 0.0);
            }
        }
        // A fully distinct, fully admissible triplet survives.
        assert_eq!(masked.get(0, 1, 2), 1.0);
    }

    #[test]
    fn mask_triplet_respects_arc_admissibility() {
        let n = 4;
        let mut chart = TripletChart::zeros(n);
        chart.set(0, 1, 2, 1.0);
        chart.set(0, 2, 3, 1.0);
        let mut mask = ArcMask::full(n).unwrap();
        mask.set(0, 1, false);
        let masked = mask_triplet(&chart, &mask, TripletKind::Sibling);
        assert_eq!(masked.get(0, 1, 2), 0.0, "arc (0,1) is inadmissible");
        assert_eq!(masked.get(0, 2, 3), 1.0);
    }

    #[test]
    fn engine_rejects_mask_dimension_mismatch() {
        let engine = Engine::new(InferenceConfig::default());
        let potentials = unary_potentials(4);
        let mask = ArcMask::full(3).unwrap();
        let result = engine.infer(&potentials, &mask);
        assert!(result.is_err());
    }

    #[test]
    fn zero_iterations_yield_unary_sigmoid() {
        let engine = Engine::new(InferenceConfig {
            strategy: Strategy::Mfvi,
            max_iter: 0,
        });
        let potentials = unary_potentials(3);
        let mask = ArcMask::full(3).unwrap();
        let run = engine.infer(&potentials, &mask).unwrap();
        assert_eq!(run.iterations(), 1);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if mask.allows(i, j) {
                    sigmoid(potentials.unary.get(i, j))
                } else {
                    0.0
                };
                assert!((run.marginals().get(i, j) - expected).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn backward_rejects_wrong_trace_length() {
        let engine = Engine::new(InferenceConfig::default());
        let potentials = unary_potentials(3);
        let mask = ArcMask::full(3).unwrap();
        let run = engine.infer(&potentials, &mask).unwrap();
        let grads = vec![ArcChart::zeros(3); run.iterations() + 1];
        let result = engine.infer_backward(&potentials, &mask, &run, &grads);
        assert!(result.is_err());
    }

    #[test]
    fn backward_rejects_foreign_strategy_run() {
        let mfvi = Engine::new(InferenceConfig {
            strategy: Strategy::Mfvi,
            max_iter: 2,
        });
        let lbp = Engine::new(InferenceConfig {
            strategy: Strategy::Lbp,
            max_iter: 2,
        });
        let potentials = unary_potentials(3);
        let mask = ArcMask::full(3).unwrap();
        let run = mfvi.infer(&potentials, &mask).unwrap();
        let grads = vec![ArcChart::zeros(3); run.iterations()];
        let result = lbp.infer_backward(&potentials, &mask, &run, &grads);
        assert!(result.is_err());
    }
}

//! Training adapter: per-iteration marginals + gold arcs → differentiable loss.
//!
//! The adapter turns an [`InferenceRun`]'s trace and a gold chart into a scalar
//! binary cross-entropy, and produces the per-iteration logit gradients the
//! engine's backward pass consumes. Supervising *every* traced iteration (the
//! default) feeds gradient signal into each step of the unrolled fixed point,
//! which counteracts vanishing gradients from deep unrolling; supervising only
//! the final iteration reproduces the plain training setup. The choice, like
//! sum-versus-mean combination across iterations, is configuration.
//!
//! When a label scorer participates, its softmax cross-entropy over gold arcs
//! is interpolated with the arc loss: `interpolation * label + (1 -
//! interpolation) * arc`.

use serde::{Deserialize, Serialize};

use crate::assemble::{PotentialGradients, Potentials};
use crate::chart::{check_same_n, ArcChart, ArcMask, GoldChart, LabelChart, LabelScores};
use crate::error::{ArcmargResult, TrainError};
use crate::infer::{Engine, InferenceRun};
use crate::num::{bce_with_logit, log_sum_exp};

/// Which traced iterations contribute to the arc loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossScope {
    /// Every iteration's marginals are supervised.
    #[default]
    AllIterations,
    /// Only the final iteration's marginals are supervised.
    FinalOnly,
}

/// How per-iteration cross-entropy terms combine into one scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReduction {
    /// Average over contributing iterations.
    #[default]
    Mean,
    /// Plain sum over contributing iterations.
    Sum,
}

/// Loss configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub scope: LossScope,
    pub reduction: LossReduction,
    /// Weight of the label loss when one is supplied; the arc loss carries
    /// `1 - interpolation`.
    pub interpolation: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            scope: LossScope::default(),
            reduction: LossReduction::default(),
            interpolation: 0.1,
        }
    }
}

/// Everything a learner needs from one training step on one sentence.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// The scalar loss.
    pub loss: f32,
    /// The final iteration's marginals.
    pub marginals: ArcChart,
    /// Gradients with respect to the assembled potentials; call
    /// [`PotentialGradients::into_raw`] to fold onto raw scorer outputs.
    pub gradients: PotentialGradients,
}

/// The training adapter. Stateless apart from its configuration.
#[derive(Debug, Clone, Default)]
pub struct TrainingAdapter {
    config: LossConfig,
}

impl TrainingAdapter {
    /// Create an adapter with the given loss configuration.
    pub fn new(config: LossConfig) -> Self {
        Self { config }
    }

    /// The adapter's configuration.
    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Per-iteration weights implied by the scope and reduction, and the set
    /// of contributing iteration indices.
    fn iteration_weight(&self, rounds: usize, t: usize) -> f32 {
        match self.config.scope {
            LossScope::FinalOnly => {
                if t + 1 == rounds {
                    1.0
                } else {
                    0.0
                }
            }
            LossScope::AllIterations => match self.config.reduction {
                LossReduction::Sum => 1.0,
                LossReduction::Mean => 1.0 / rounds as f32,
            },
        }
    }

    /// Positions that participate in the arc loss: admissible and with known
    /// gold. Returns the count alongside for normalization.
    fn valid_count(gold: &GoldChart, mask: &ArcMask) -> usize {
        let n = gold.n();
        let mut count = 0;
        for i in 0..n {
            for j in 0..n {
                if mask.allows(i, j) && gold.get(i, j) >= 0 {
                    count += 1;
                }
            }
        }
        count
    }

    /// Binary cross-entropy between the traced marginals and the gold arcs.
    ///
    /// Computed from the traced logits, so saturated marginals cost a finite
    /// amount instead of `ln(0)`. Returns `(loss, final_marginals)`. A
    /// sentence with no supervisable position contributes zero loss.
    pub fn arc_loss(
        &self,
        run: &InferenceRun,
        gold: &GoldChart,
        mask: &ArcMask,
    ) -> ArcmargResult<(f32, ArcChart)> {
        let logits = run.logits();
        if logits.is_empty() {
            return Err(TrainError::EmptyTrace.into());
        }
        let n = logits[0].n();
        check_same_n(n, gold.n()).map_err(TrainError::Chart)?;
        check_same_n(n, mask.n()).map_err(TrainError::Chart)?;

        let count = Self::valid_count(gold, mask);
        if count == 0 {
            tracing::debug!("no supervisable arc positions; arc loss is zero");
            return Ok((0.0, run.marginals().clone()));
        }

        let rounds = logits.len();
        let mut loss = 0.0;
        for (t, l) in logits.iter().enumerate() {
            let weight = self.iteration_weight(rounds, t);
            if weight == 0.0 {
                continue;
            }
            let mut bce = 0.0;
            for i in 0..n {
                for j in 0..n {
                    if mask.allows(i, j) && gold.get(i, j) >= 0 {
                        bce += bce_with_logit(l.get(i, j), gold.get(i, j) as f32);
                    }
                }
            }
            loss += weight * bce / count as f32;
        }
        Ok((loss, run.marginals().clone()))
    }

    /// Per-iteration logit gradients of [`Self::arc_loss`]: one chart per
    /// traced iteration, `w_t * (q_t - y) / count` on supervised positions.
    pub fn arc_loss_gradients(
        &self,
        run: &InferenceRun,
        gold: &GoldChart,
        mask: &ArcMask,
    ) -> ArcmargResult<Vec<ArcChart>> {
        let trace = run.trace();
        if trace.is_empty() {
            return Err(TrainError::EmptyTrace.into());
        }
        let n = trace[0].n();
        check_same_n(n, gold.n()).map_err(TrainError::Chart)?;
        check_same_n(n, mask.n()).map_err(TrainError::Chart)?;

        let count = Self::valid_count(gold, mask);
        let rounds = trace.len();
        let mut grads = Vec::with_capacity(rounds);
        for (t, q) in trace.iter().enumerate() {
            let mut grad = ArcChart::zeros(n);
            if count > 0 {
                let weight = self.iteration_weight(rounds, t);
                if weight != 0.0 {
                    for i in 0..n {
                        for j in 0..n {
                            if mask.allows(i, j) && gold.get(i, j) >= 0 {
                                let y = gold.get(i, j) as f32;
                                grad.set(i, j, weight * (q.get(i, j) - y) / count as f32);
                            }
                        }
                    }
                }
            }
            grads.push(grad);
        }
        Ok(grads)
    }

    /// Softmax cross-entropy of the label scores against gold labels,
    /// restricted to gold arcs. Returns the mean loss and its gradient chart
    /// (same shape as the scores).
    pub fn label_loss(
        &self,
        scores: &LabelScores,
        labels: &LabelChart,
        mask: &ArcMask,
    ) -> ArcmargResult<(f32, LabelScores)> {
        let n = scores.n();
        check_same_n(n, labels.n()).map_err(TrainError::Chart)?;
        check_same_n(n, mask.n()).map_err(TrainError::Chart)?;
        let n_labels = scores.n_labels();

        let mut count = 0usize;
        for i in 0..n {
            for j in 0..n {
                if mask.allows(i, j) && labels.get(i, j) >= 0 {
                    count += 1;
                }
            }
        }
        let mut grad = LabelScores::zeros(n, n_labels);
        if count == 0 {
            return Ok((0.0, grad));
        }

        let mut loss = 0.0;
        for i in 0..n {
            for j in 0..n {
                let gold_label = labels.get(i, j);
                if !mask.allows(i, j) || gold_label < 0 {
                    continue;
                }
                if gold_label as usize >= n_labels {
                    return Err(TrainError::LabelOutOfRange {
                        label: gold_label,
                        n_labels,
                    }
                    .into());
                }
                let row = scores.scores(i, j);
                let lse = log_sum_exp(row);
                loss += lse - row[gold_label as usize];

                let grad_row = grad.scores_mut(i, j);
                for (g, &s) in grad_row.iter_mut().zip(row.iter()) {
                    *g = (s - lse).exp() / count as f32;
                }
                grad_row[gold_label as usize] -= 1.0 / count as f32;
            }
        }
        Ok((loss / count as f32, grad))
    }

    /// Arc loss interpolated with a label loss, as the full model trains:
    /// `interpolation * label + (1 - interpolation) * arc`.
    pub fn interpolated_loss(
        &self,
        run: &InferenceRun,
        gold: &GoldChart,
        mask: &ArcMask,
        scores: &LabelScores,
        labels: &LabelChart,
    ) -> ArcmargResult<(f32, ArcChart)> {
        let (arc, marginals) = self.arc_loss(run, gold, mask)?;
        let (label, _) = self.label_loss(scores, labels, mask)?;
        let w = self.config.interpolation;
        Ok((w * label + (1.0 - w) * arc, marginals))
    }

    /// One full training step for one sentence: loss, final marginals, and
    /// potential gradients through the unrolled inference loop.
    pub fn loss_and_gradients(
        &self,
        engine: &Engine,
        potentials: &Potentials,
        mask: &ArcMask,
        run: &InferenceRun,
        gold: &GoldChart,
    ) -> ArcmargResult<TrainOutput> {
        let (loss, marginals) = self.arc_loss(run, gold, mask)?;
        let grad_logits = self.arc_loss_gradients(run, gold, mask)?;
        let gradients = engine.infer_backward(potentials, mask, run, &grad_logits)?;
        Ok(TrainOutput {
            loss,
            marginals,
            gradients,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::{InferenceConfig, Strategy};
    use crate::num::sigmoid;

    fn simple_setup(max_iter: usize) -> (Engine, Potentials, ArcMask, GoldChart) {
        let n = 3;
        let mut unary = ArcChart::zeros(n);
        unary.set(0, 1, 2.0);
        unary.set(0, 2, -1.0);
        unary.set(1, 2, 1.0);
        unary.set(2, 1, 1.0);
        let potentials = Potentials::unary_only(unary).unwrap();
        let mask = ArcMask::full(n).unwrap();
        let mut gold = GoldChart::absent(n);
        gold.set(0, 1, 1);
        gold.set(1, 2, 1);
        let engine = Engine::new(InferenceConfig {
            strategy: Strategy::Mfvi,
            max_iter,
        });
        (engine, potentials, mask, gold)
    }

    #[test]
    fn zero_iteration_loss_matches_hand_computed_bce() {
        let (engine, potentials, mask, gold) = simple_setup(0);
        let run = engine.infer(&potentials, &mask).unwrap();
        let adapter = TrainingAdapter::default();
        let (loss, marginals) = adapter.arc_loss(&run, &gold, &mask).unwrap();

        // Four valid positions, all with known gold.
        let expected: f32 = [
            bce_with_logit(2.0, 1.0),
            bce_with_logit(-1.0, 0.0),
            bce_with_logit(1.0, 1.0),
            bce_with_logit(1.0, 0.0),
        ]
        .iter()
        .sum::<f32>()
            / 4.0;
        assert!((loss - expected).abs() < 1e-6);
        assert!((marginals.get(0, 1) - sigmoid(2.0)).abs() < 1e-6);
    }

    #[test]
    fn final_only_scope_zeroes_earlier_gradients() {
        let (engine, potentials, mask, gold) = simple_setup(3);
        let run = engine.infer(&potentials, &mask).unwrap();
        let adapter = TrainingAdapter::new(LossConfig {
            scope: LossScope::FinalOnly,
            ..Default::default()
        });
        let grads = adapter.arc_loss_gradients(&run, &gold, &mask).unwrap();
        assert_eq!(grads.len(), 3);
        assert!(grads[0].data().iter().all(|&v| v == 0.0));
        assert!(grads[1].data().iter().all(|&v| v == 0.0));
        assert!(grads[2].data().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn mean_reduction_scales_sum_by_iteration_count() {
        let (engine, potentials, mask, gold) = simple_setup(3);
        let run = engine.infer(&potentials, &mask).unwrap();
        let sum = TrainingAdapter::new(LossConfig {
            reduction: LossReduction::Sum,
            ..Default::default()
        });
        let mean = TrainingAdapter::new(LossConfig {
            reduction: LossReduction::Mean,
            ..Default::default()
        });
        let (loss_sum, _) = sum.arc_loss(&run, &gold, &mask).unwrap();
        let (loss_mean, _) = mean.arc_loss(&run, &gold, &mask).unwrap();
        assert!((loss_sum - 3.0 * loss_mean).abs() < 1e-5);
    }

    #[test]
    fn unknown_gold_positions_are_excluded() {
        let (engine, potentials, mask, mut gold) = simple_setup(2);
        let run = engine.infer(&potentials, &mask).unwrap();
        let adapter = TrainingAdapter::default();
        let (baseline, _) = adapter.arc_loss(&run, &gold, &mask).unwrap();

        // Marking the worst-scored position unknown must change the loss,
        // and its gradient must vanish.
        gold.set(2, 1, -1);
        let (reduced, _) = adapter.arc_loss(&run, &gold, &mask).unwrap();
        assert!(reduced != baseline);
        let grads = adapter.arc_loss_gradients(&run, &gold, &mask).unwrap();
        for grad in &grads {
            assert_eq!(grad.get(2, 1), 0.0);
        }
    }

    #[test]
    fn gradient_sign_follows_marginal_minus_gold() {
        let (engine, potentials, mask, gold) = simple_setup(1);
        let run = engine.infer(&potentials, &mask).unwrap();
        let adapter = TrainingAdapter::default();
        let grads = adapter.arc_loss_gradients(&run, &gold, &mask).unwrap();
        // Gold arc with q < 1: negative gradient pushes the logit up.
        assert!(grads[0].get(0, 1) < 0.0);
        // Non-arc with q > 0: positive gradient pushes the logit down.
        assert!(grads[0].get(0, 2) > 0.0);
    }

    #[test]
    fn label_loss_prefers_the_gold_label() {
        let n = 3;
        let mut scores = LabelScores::zeros(n, 4);
        scores.scores_mut(0, 1).copy_from_slice(&[0.0, 3.0, 0.0, 0.0]);
        scores.scores_mut(1, 2).copy_from_slice(&[2.0, 0.0, 0.0, 0.0]);
        let mut labels = LabelChart::unlabeled(n);
        labels.set(0, 1, 1);
        labels.set(1, 2, 3);
        let mask = ArcMask::full(n).unwrap();

        let adapter = TrainingAdapter::default();
        let (loss, grad) = adapter.label_loss(&scores, &labels, &mask).unwrap();
        assert!(loss > 0.0);
        // At (0,1) the argmax matches gold: gradient at gold label is
        // softmax - 1 < 0, the rest positive.
        assert!(grad.scores(0, 1)[1] < 0.0);
        assert!(grad.scores(0, 1)[0] > 0.0);
        // At (1,2) gold label 3 is scored low: strong negative gradient there.
        assert!(grad.scores(1, 2)[3] < 0.0);
    }

    #[test]
    fn label_loss_rejects_out_of_range_gold() {
        let n = 3;
        let scores = LabelScores::zeros(n, 2);
        let mut labels = LabelChart::unlabeled(n);
        labels.set(0, 1, 5);
        let mask = ArcMask::full(n).unwrap();
        let adapter = TrainingAdapter::default();
        assert!(adapter.label_loss(&scores, &labels, &mask).is_err());
    }

    #[test]
    fn interpolation_mixes_the_two_losses() {
        let (engine, potentials, mask, gold) = simple_setup(2);
        let run = engine.infer(&potentials, &mask).unwrap();
        let mut scores = LabelScores::zeros(3, 2);
        scores.scores_mut(0, 1).copy_from_slice(&[0.0, 1.0]);
        let mut labels = LabelChart::unlabeled(3);
        labels.set(0, 1, 1);

        let adapter = TrainingAdapter::new(LossConfig {
            interpolation: 0.25,
            ..Default::default()
        });
        let (arc, _) = adapter.arc_loss(&run, &gold, &mask).unwrap();
        let (label, _) = adapter.label_loss(&scores, &labels, &mask).unwrap();
        let (mixed, _) = adapter
            .interpolated_loss(&run, &gold, &mask, &scores, &labels)
            .unwrap();
        assert!((mixed - (0.25 * label + 0.75 * arc)).abs() < 1e-6);
    }
}

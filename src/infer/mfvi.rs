//! Mean-field variational inference.
//!
//! Approximates the posterior over arcs by a fully factorized distribution and
//! solves for its parameters by coordinate-wise fixed-point updates, using the
//! current beliefs as plug-in expectations for neighboring arcs. Every step is
//! a masked contraction followed by a sigmoid, so the whole unrolled loop is
//! reverse-differentiable; [`MfviKernel::backward`] replays it with the exact
//! adjoint of each contraction.

use crate::assemble::PotentialGradients;
use crate::chart::ArcChart;
use crate::error::InferError;
use crate::kernel::MathKernel;

use super::{
    masked_add, sigmoid_masked, unary_backward, unary_run, InferenceKernel, InferenceRun,
    MaskedPotentials, Replay, Strategy,
};

/// Mean-field strategy kernel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MfviKernel;

/// The expected second-order contribution to every arc's log-odds, given the
/// current beliefs `q`:
///
/// ```text
/// f[i,j] =   Σ_k q[i,k]·sib[i,j,k]      (i also heads k)
///          + Σ_k q[k,j]·cop[i,j,k]      (j also has head k)
///          + Σ_k q[j,k]·grd[i,j,k]      (chain i → j → k)
///          + Σ_k q[k,i]·grd[k,i,j]      (chain k → i → j)
/// ```
///
/// The first three sums are dot products along the contiguous triplet axis;
/// the last is a scaled row accumulation. Masked potentials are zero, so
/// inadmissible neighbors contribute nothing.
fn second_order(mp: &MaskedPotentials, q: &ArcChart, math: &dyn MathKernel) -> ArcChart {
    let n = mp.n;
    let qt = q.transposed();
    let mut f = ArcChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            if !mp.mask.allows(i, j) {
                continue;
            }
            let mut v = math.dot(mp.sib.row(i, j), q.row(i));
            v += math.dot(mp.cop.row(i, j), qt.row(j));
            v += math.dot(mp.grd.row(i, j), q.row(j));
            f.set(i, j, v);
        }
    }
    // Grandchild orientation: f[i,·] += q[k,i] · grd[k,i,·].
    for k in 0..n {
        for i in 0..n {
            let w = q.get(k, i);
            if w != 0.0 {
                math.axpy(w, mp.grd.row(k, i), f.row_mut(i));
            }
        }
    }
    f
}

impl InferenceKernel for MfviKernel {
    fn run(&self, mp: &MaskedPotentials, max_iter: usize, math: &dyn MathKernel) -> InferenceRun {
        if max_iter == 0 {
            return unary_run(mp, Strategy::Mfvi);
        }

        let q0 = sigmoid_masked(&mp.unary, &mp.mask);
        let mut q = q0.clone();
        let mut logits = Vec::with_capacity(max_iter);
        let mut marginals = Vec::with_capacity(max_iter);
        for _ in 0..max_iter {
            let f = second_order(mp, &q, math);
            let l = masked_add(&mp.unary, &f, &mp.mask);
            q = sigmoid_masked(&l, &mp.mask);
            logits.push(l);
            marginals.push(q.clone());
        }

        InferenceRun {
            strategy: Strategy::Mfvi,
            logits,
            marginals,
            replay: Replay::Mfvi { q0 },
        }
    }

    fn backward(
        &self,
        mp: &MaskedPotentials,
        run: &InferenceRun,
        grad_logits: &[ArcChart],
        math: &dyn MathKernel,
    ) -> Result<PotentialGradients, InferError> {
        let q0 = match &run.replay {
            Replay::Unary => return Ok(unary_backward(mp, grad_logits)),
            Replay::Mfvi { q0 } => q0,
            Replay::Lbp { .. } => {
                return Err(InferError::StrategyMismatch {
                    engine: Strategy::Mfvi.to_string(),
                    run: Strategy::Lbp.to_string(),
                });
            }
        };

        let n = mp.n;
        let trace = run.trace();
        let mut grads = PotentialGradients::zeros(n);
        // dL/dq_t flowing back from iterations after t.
        let mut g_q = ArcChart::zeros(n);

        for t in (0..trace.len()).rev() {
            let q_t = &trace[t];
            let q_prev = if t == 0 { q0 } else { &trace[t - 1] };
            let q_prev_t = q_prev.transposed();

            // Total gradient at this iteration's logits: the loss term plus the
            // chained term through q_t = sigmoid(l_t).
            let mut delta = ArcChart::zeros(n);
            for i in 0..n {
                for j in 0..n {
                    if !mp.mask.allows(i, j) {
                        continue;
                    }
                    let qv = q_t.get(i, j);
                    delta.set(
                        i,
                        j,
                        grad_logits[t].get(i, j) + g_q.get(i, j) * qv * (1.0 - qv),
                    );
                }
            }

            // l_t = u + f(q_prev): the unary adjoint is delta itself, the
            // potential adjoints scale the previous beliefs.
            for i in 0..n {
                for j in 0..n {
                    let d = delta.get(i, j);
                    if d == 0.0 {
                        continue;
                    }
                    grads.unary.set(i, j, grads.unary.get(i, j) + d);
                    math.axpy(d, q_prev.row(i), grads.sib.row_mut(i, j));
                    math.axpy(d, q_prev_t.row(j), grads.cop.row_mut(i, j));
                    math.axpy(d, q_prev.row(j), grads.grd.row_mut(i, j));
                }
            }
            // Grandchild orientation: grd[k,i,j] saw q_prev[k,i] scale delta[i,·].
            for k in 0..n {
                for i in 0..n {
                    let w = q_prev.get(k, i);
                    if w != 0.0 {
                        math.axpy(w, delta.row(i), grads.grd.row_mut(k, i));
                    }
                }
            }

            // Adjoint into the previous beliefs, mirroring each contraction.
            let mut g_prev = ArcChart::zeros(n);
            let mut g_prev_t = ArcChart::zeros(n);
            for i in 0..n {
                for j in 0..n {
                    let d = delta.get(i, j);
                    if d == 0.0 {
                        continue;
                    }
                    // q_prev[i,k] entered through sib[i,j,k].
                    math.axpy(d, mp.sib.row(i, j), g_prev.row_mut(i));
                    // q_prev[k,j] entered through cop[i,j,k]; accumulate
                    // transposed so the inner axis stays contiguous.
                    math.axpy(d, mp.cop.row(i, j), g_prev_t.row_mut(j));
                    // q_prev[j,k] entered through grd[i,j,k].
                    math.axpy(d, mp.grd.row(i, j), g_prev.row_mut(j));
                }
            }
            // q_prev[k,i] entered through grd[k,i,j] for every j.
            for k in 0..n {
                for i in 0..n {
                    let v = math.dot(mp.grd.row(k, i), delta.row(i));
                    if v != 0.0 {
                        g_prev.set(k, i, g_prev.get(k, i) + v);
                    }
                }
            }
            for j in 0..n {
                for k in 0..n {
                    let v = g_prev_t.get(j, k);
                    if v != 0.0 {
                        g_prev.set(k, j, g_prev.get(k, j) + v);
                    }
                }
            }

            g_q = g_prev;
        }

        // Initialization q0 = sigmoid(u) under mask.
        for i in 0..n {
            for j in 0..n {
                if !mp.mask.allows(i, j) {
                    continue;
                }
                let qv = q0.get(i, j);
                grads
                    .unary
                    .set(i, j, grads.unary.get(i, j) + g_q.get(i, j) * qv * (1.0 - qv));
            }
        }

        Ok(grads)
    }
}

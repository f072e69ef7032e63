//! Loopy belief propagation.
//!
//! Maintains directed log-space messages between each arc variable and each
//! triplet factor it participates in. Arc variables are binary, so a message
//! is stored as a single real: the log-ratio between its "arc on" and "arc
//! off" states. Under that representation the factor-to-variable
//! marginalization (log-sum-exp over the other arc's two states, weighted by
//! its variable-to-factor message `n`) collapses to
//!
//! ```text
//! m = softplus(n + s) - softplus(n)
//! ```
//!
//! where `s` is the factor potential, applied only when both arcs are on.
//! The variable-to-factor message excludes the factor's own previous
//! contribution (`n = belief - previous message from this factor`). Updates
//! are synchronous; the factor graph has cycles, so nothing is guaranteed to
//! converge and the kernel simply reports the belief after exactly
//! `max_iter` rounds.

use crate::assemble::PotentialGradients;
use crate::chart::{ArcChart, TripletChart};
use crate::error::InferError;
use crate::kernel::MathKernel;
use crate::num::{sigmoid, softplus};

use super::{
    masked_copy, sigmoid_masked, unary_backward, unary_run, InferenceKernel, InferenceRun,
    MaskedPotentials, Replay, Strategy,
};

/// One iteration's factor-to-variable messages, indexed like the potentials.
///
/// - `ms[i,j,k]` — from sibling factor `{(i,j), (i,k)}` to arc `(i,j)`; the
///   same factor's message to `(i,k)` lives at `ms[i,k,j]`.
/// - `mc[i,j,k]` — from co-parent factor `{(i,j), (k,j)}` to arc `(i,j)`.
/// - `mgh[i,j,k]` — from grandparent factor `i → j → k` to the upper arc `(i,j)`.
/// - `mgd[i,j,k]` — from the same factor to the lower arc `(j,k)`.
#[derive(Debug, Clone)]
pub(crate) struct LbpMessages {
    pub ms: TripletChart,
    pub mc: TripletChart,
    pub mgh: TripletChart,
    pub mgd: TripletChart,
}

impl LbpMessages {
    fn zeros(n: usize) -> Self {
        Self {
            ms: TripletChart::zeros(n),
            mc: TripletChart::zeros(n),
            mgh: TripletChart::zeros(n),
            mgd: TripletChart::zeros(n),
        }
    }
}

/// Synchronous message update from the previous iteration's beliefs and
/// messages. Factors with a zero (masked) potential send exactly zero, so
/// inadmissible triplets never speak.
fn update_messages(mp: &MaskedPotentials, b_prev: &ArcChart, m_prev: &LbpMessages) -> LbpMessages {
    let n = mp.n;
    let mut out = LbpMessages::zeros(n);
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                let s = mp.sib.get(i, j, k);
                if s != 0.0 {
                    let nv = b_prev.get(i, k) - m_prev.ms.get(i, k, j);
                    out.ms.set(i, j, k, softplus(nv + s) - softplus(nv));
                }
                let c = mp.cop.get(i, j, k);
                if c != 0.0 {
                    let nv = b_prev.get(k, j) - m_prev.mc.get(k, j, i);
                    out.mc.set(i, j, k, softplus(nv + c) - softplus(nv));
                }
                let g = mp.grd.get(i, j, k);
                if g != 0.0 {
                    let nv = b_prev.get(j, k) - m_prev.mgd.get(i, j, k);
                    out.mgh.set(i, j, k, softplus(nv + g) - softplus(nv));
                    let nv = b_prev.get(i, j) - m_prev.mgh.get(i, j, k);
                    out.mgd.set(i, j, k, softplus(nv + g) - softplus(nv));
                }
            }
        }
    }
    out
}

/// Belief at each arc: unary potential plus the sum of all incoming
/// factor-to-variable messages. Masked positions stay `0`.
fn belief(mp: &MaskedPotentials, msgs: &LbpMessages, math: &dyn MathKernel) -> ArcChart {
    let n = mp.n;
    // Lower-arc grandparent messages arrive indexed by the factor's head:
    // gd_in[i,j] = Σ_k mgd[k,i,j].
    let mut gd_in = ArcChart::zeros(n);
    for k in 0..n {
        for i in 0..n {
            math.axpy(1.0, msgs.mgd.row(k, i), gd_in.row_mut(i));
        }
    }

    let mut b = ArcChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            if !mp.mask.allows(i, j) {
                continue;
            }
            let v = mp.unary.get(i, j)
                + math.sum(msgs.ms.row(i, j))
                + math.sum(msgs.mc.row(i, j))
                + math.sum(msgs.mgh.row(i, j))
                + gd_in.get(i, j);
            b.set(i, j, v);
        }
    }
    b
}

/// Loopy-BP strategy kernel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LbpKernel;

impl InferenceKernel for LbpKernel {
    fn run(&self, mp: &MaskedPotentials, max_iter: usize, math: &dyn MathKernel) -> InferenceRun {
        if max_iter == 0 {
            return unary_run(mp, Strategy::Lbp);
        }

        let n = mp.n;
        let init = LbpMessages::zeros(n);
        let mut states: Vec<LbpMessages> = Vec::with_capacity(max_iter);
        let mut logits = Vec::with_capacity(max_iter);
        let mut marginals = Vec::with_capacity(max_iter);
        let mut b = mp.unary.clone();

        for _ in 0..max_iter {
            let msgs = update_messages(mp, &b, states.last().unwrap_or(&init));
            b = belief(mp, &msgs, math);
            logits.push(b.clone());
            marginals.push(sigmoid_masked(&b, &mp.mask));
            states.push(msgs);
        }

        InferenceRun {
            strategy: Strategy::Lbp,
            logits,
            marginals,
            replay: Replay::Lbp { states },
        }
    }

    fn backward(
        &self,
        mp: &MaskedPotentials,
        run: &InferenceRun,
        grad_logits: &[ArcChart],
        _math: &dyn MathKernel,
    ) -> Result<PotentialGradients, InferError> {
        let states = match &run.replay {
            Replay::Unary => return Ok(unary_backward(mp, grad_logits)),
            Replay::Lbp { states } => states,
            Replay::Mfvi { .. } => {
                return Err(InferError::StrategyMismatch {
                    engine: Strategy::Lbp.to_string(),
                    run: Strategy::Mfvi.to_string(),
                });
            }
        };

        let n = mp.n;
        let rounds = states.len();
        let init = LbpMessages::zeros(n);
        let mut grads = PotentialGradients::zeros(n);

        // Adjoints of the current iteration's belief and messages.
        let mut g_b = masked_copy(&grad_logits[rounds - 1], &mp.mask);
        let mut g_m = LbpMessages::zeros(n);

        for t in (1..=rounds).rev() {
            // Belief sum b_t = u + Σ messages: spread the belief adjoint onto
            // the unary chart and every incoming message slot.
            for i in 0..n {
                for j in 0..n {
                    if !mp.mask.allows(i, j) {
                        continue;
                    }
                    let g = g_b.get(i, j);
                    if g == 0.0 {
                        continue;
                    }
                    grads.unary.set(i, j, grads.unary.get(i, j) + g);
                    for v in g_m.ms.row_mut(i, j) {
                        *v += g;
                    }
                    for v in g_m.mc.row_mut(i, j) {
                        *v += g;
                    }
                    for v in g_m.mgh.row_mut(i, j) {
                        *v += g;
                    }
                    for k in 0..n {
                        g_m.mgd.set(k, i, j, g_m.mgd.get(k, i, j) + g);
                    }
                }
            }

            // Message ops: each one read the previous belief at the *other*
            // arc and subtracted this factor's own previous message.
            let (prev_b, prev_m) = if t >= 2 {
                (&run.logits()[t - 2], &states[t - 2])
            } else {
                (&mp.unary, &init)
            };
            let mut g_b_prev = if t >= 2 {
                masked_copy(&grad_logits[t - 2], &mp.mask)
            } else {
                ArcChart::zeros(n)
            };
            let mut g_m_prev = LbpMessages::zeros(n);

            for i in 0..n {
                for j in 0..n {
                    for k in 0..n {
                        let s = mp.sib.get(i, j, k);
                        if s != 0.0 {
                            let g = g_m.ms.get(i, j, k);
                            if g != 0.0 {
                                let nv = prev_b.get(i, k) - prev_m.ms.get(i, k, j);
                                let a = sigmoid(nv + s);
                                let dn = g * (a - sigmoid(nv));
                                g_b_prev.set(i, k, g_b_prev.get(i, k) + dn);
                                g_m_prev.ms.set(i, k, j, g_m_prev.ms.get(i, k, j) - dn);
                                grads.sib.set(i, j, k, grads.sib.get(i, j, k) + g * a);
                            }
                        }
                        let c = mp.cop.get(i, j, k);
                        if c != 0.0 {
                            let g = g_m.mc.get(i, j, k);
                            if g != 0.0 {
                                let nv = prev_b.get(k, j) - prev_m.mc.get(k, j, i);
                                let a = sigmoid(nv + c);
                                let dn = g * (a - sigmoid(nv));
                                g_b_prev.set(k, j, g_b_prev.get(k, j) + dn);
                                g_m_prev.mc.set(k, j, i, g_m_prev.mc.get(k, j, i) - dn);
                                grads.cop.set(i, j, k, grads.cop.get(i, j, k) + g * a);
                            }
                        }
                        let gp = mp.grd.get(i, j, k);
                        if gp != 0.0 {
                            let g = g_m.mgh.get(i, j, k);
                            if g != 0.0 {
                                let nv = prev_b.get(j, k) - prev_m.mgd.get(i, j, k);
                                let a = sigmoid(nv + gp);
                                let dn = g * (a - sigmoid(nv));
                                g_b_prev.set(j, k, g_b_prev.get(j, k) + dn);
                                g_m_prev.mgd.set(i, j, k, g_m_prev.mgd.get(i, j, k) - dn);
                                grads.grd.set(i, j, k, grads.grd.get(i, j, k) + g * a);
                            }
                            let g = g_m.mgd.get(i, j, k);
                            if g != 0.0 {
                                let nv = prev_b.get(i, j) - prev_m.mgh.get(i, j, k);
                                let a = sigmoid(nv + gp);
                                let dn = g * (a - sigmoid(nv));
                                g_b_prev.set(i, j, g_b_prev.get(i, j) + dn);
                                g_m_prev.mgh.set(i, j, k, g_m_prev.mgh.get(i, j, k) - dn);
                                grads.grd.set(i, j, k, grads.grd.get(i, j, k) + g * a);
                            }
                        }
                    }
                }
            }

            g_b = g_b_prev;
            g_m = g_m_prev;
        }

        // b_0 is the masked unary chart itself.
        for i in 0..n {
            for j in 0..n {
                if mp.mask.allows(i, j) {
                    grads.unary.set(i, j, grads.unary.get(i, j) + g_b.get(i, j));
                }
            }
        }

        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::Potentials;
    use crate::chart::ArcMask;
    use crate::kernel;
    use crate::num::sigmoid;

    #[test]
    fn zero_potentials_leave_all_messages_zero() {
        let n = 4;
        let mut unary = ArcChart::zeros(n);
        for i in 0..n {
            for j in 0..n {
                unary.set(i, j, 0.4 * (i as f32) - 0.2 * (j as f32));
            }
        }
        let potentials = Potentials::unary_only(unary.clone()).unwrap();
        let mask = ArcMask::full(n).unwrap();
        let mp = MaskedPotentials::new(&potentials, &mask);
        let math = kernel::best_kernel();

        let run = LbpKernel.run(&mp, 3, math.as_ref());
        let Replay::Lbp { states } = &run.replay else {
            panic!("expected LBP replay state");
        };
        for msgs in states {
            assert!(msgs.ms.data().iter().all(|&v| v == 0.0));
            assert!(msgs.mc.data().iter().all(|&v| v == 0.0));
            assert!(msgs.mgh.data().iter().all(|&v| v == 0.0));
            assert!(msgs.mgd.data().iter().all(|&v| v == 0.0));
        }
        for q in run.trace() {
            for i in 0..n {
                for j in 0..n {
                    let expected = if mask.allows(i, j) {
                        sigmoid(unary.get(i, j))
                    } else {
                        0.0
                    };
                    assert!((q.get(i, j) - expected).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn single_sibling_factor_recovers_exact_marginals() {
        // Two admissible arcs coupled by one sibling factor form a tree, so
        // BP is exact once the messages settle (two rounds suffice).
        let n = 3;
        let (u1, u2, s) = (0.8_f32, -0.5_f32, 1.2_f32);
        let mut unary = ArcChart::zeros(n);
        unary.set(0, 1, u1);
        unary.set(0, 2, u2);
        let mut sib = TripletChart::zeros(n);
        sib.set(0, 1, 2, s);
        sib.set(0, 2, 1, s);
        let potentials = Potentials::from_parts(
            unary,
            sib,
            TripletChart::zeros(n),
            TripletChart::zeros(n),
        )
        .unwrap();
        let mut mask = ArcMask::from_vec(n, vec![false; n * n]).unwrap();
        mask.set(0, 1, true);
        mask.set(0, 2, true);
        let mp = MaskedPotentials::new(&potentials, &mask);
        let math = kernel::best_kernel();

        let run = LbpKernel.run(&mp, 3, math.as_ref());

        // Enumerate the 2-variable joint exactly.
        let z = 1.0
            + u1.exp()
            + u2.exp()
            + (u1 + u2 + s).exp();
        let exact1 = (u1.exp() + (u1 + u2 + s).exp()) / z;
        let exact2 = (u2.exp() + (u1 + u2 + s).exp()) / z;

        assert!((run.marginals().get(0, 1) - exact1).abs() < 1e-5);
        assert!((run.marginals().get(0, 2) - exact2).abs() < 1e-5);
    }

    #[test]
    fn beliefs_stay_finite_under_extreme_potentials() {
        let n = 4;
        let mut unary = ArcChart::zeros(n);
        let mut cop = TripletChart::zeros(n);
        for i in 0..n {
            for j in 0..n {
                unary.set(i, j, if i < j { 400.0 } else { -400.0 });
                for k in 0..n {
                    cop.set(i, j, k, -250.0);
                }
            }
        }
        let potentials = Potentials::from_parts(
            unary,
            TripletChart::zeros(n),
            cop,
            TripletChart::zeros(n),
        )
        .unwrap();
        let mask = ArcMask::full(n).unwrap();
        let mp = MaskedPotentials::new(&potentials, &mask);
        let math = kernel::best_kernel();

        let run = LbpKernel.run(&mp, 5, math.as_ref());
        for q in run.trace() {
            for &v in q.data() {
                assert!(v.is_finite());
                assert!((0.0..=1.0).contains(&v));
            }
        }
    }

    #[test]
    fn determinism_bit_identical_across_calls() {
        let n = 4;
        let mut unary = ArcChart::zeros(n);
        let mut grd = TripletChart::zeros(n);
        for i in 0..n {
            for j in 0..n {
                unary.set(i, j, 0.1 * ((i * n + j) as f32) - 0.6);
                for k in 0..n {
                    grd.set(i, j, k, 0.05 * (k as f32) - 0.1 * (i as f32));
                }
            }
        }
        let potentials = Potentials::from_parts(
            unary,
            TripletChart::zeros(n),
            TripletChart::zeros(n),
            grd,
        )
        .unwrap();
        let mask = ArcMask::full(n).unwrap();
        let mp = MaskedPotentials::new(&potentials, &mask);
        let math = kernel::best_kernel();

        let a = LbpKernel.run(&mp, 4, math.as_ref());
        let b = LbpKernel.run(&mp, 4, math.as_ref());
        for (qa, qb) in a.trace().iter().zip(b.trace().iter()) {
            for (va, vb) in qa.data().iter().zip(qb.data().iter()) {
                assert_eq!(va.to_bits(), vb.to_bits());
            }
        }
    }
}

//! Data-parallel batch processing.
//!
//! The engine holds no per-sentence state, so a batch is just a rayon
//! parallel map over independent per-sentence inputs — no cross-element
//! interaction, no shared accumulators inside a call. Sentences of different
//! lengths coexist in one batch because every element carries its own mask.

use rayon::prelude::*;

use crate::assemble::Potentials;
use crate::chart::{ArcChart, ArcMask, GoldChart};
use crate::error::ArcmargResult;
use crate::infer::{Engine, InferenceRun};
use crate::train::{TrainOutput, TrainingAdapter};

/// One sentence's inference inputs.
pub struct BatchItem<'a> {
    pub potentials: &'a Potentials,
    pub mask: &'a ArcMask,
}

/// One sentence's training inputs.
pub struct TrainItem<'a> {
    pub potentials: &'a Potentials,
    pub mask: &'a ArcMask,
    pub gold: &'a GoldChart,
}

/// Run inference over a batch in parallel. The first element failure aborts
/// the whole batch — a shape mismatch is a caller bug, not data noise.
pub fn infer_batch(engine: &Engine, items: &[BatchItem<'_>]) -> ArcmargResult<Vec<InferenceRun>> {
    items
        .par_iter()
        .map(|item| engine.infer(item.potentials, item.mask))
        .collect()
}

/// One training step over a batch: per-sentence losses and gradients computed
/// in parallel, plus the batch-mean loss for reporting.
pub fn train_batch(
    engine: &Engine,
    adapter: &TrainingAdapter,
    items: &[TrainItem<'_>],
) -> ArcmargResult<(f32, Vec<TrainOutput>)> {
    let outputs: Vec<TrainOutput> = items
        .par_iter()
        .map(|item| {
            let run = engine.infer(item.potentials, item.mask)?;
            adapter.loss_and_gradients(engine, item.potentials, item.mask, &run, item.gold)
        })
        .collect::<ArcmargResult<_>>()?;

    let mean = if outputs.is_empty() {
        0.0
    } else {
        outputs.iter().map(|o| o.loss).sum::<f32>() / outputs.len() as f32
    };
    Ok((mean, outputs))
}

/// Predict marginals for a batch in parallel.
pub fn marginals_batch(
    engine: &Engine,
    items: &[BatchItem<'_>],
) -> ArcmargResult<Vec<ArcChart>> {
    Ok(infer_batch(engine, items)?
        .into_iter()
        .map(|run| run.marginals().clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::InferenceConfig;

    fn sentence(n: usize, bias: f32) -> (Potentials, ArcMask) {
        let mut unary = ArcChart::zeros(n);
        for i in 0..n {
            for j in 0..n {
                unary.set(i, j, bias + 0.3 * (i as f32) - 0.4 * (j as f32));
            }
        }
        (
            Potentials::unary_only(unary).unwrap(),
            ArcMask::full(n).unwrap(),
        )
    }

    #[test]
    fn batch_results_match_single_sentence_runs() {
        let engine = Engine::new(InferenceConfig::default());
        let sentences: Vec<_> = (0..6).map(|s| sentence(3 + s % 3, s as f32 * 0.1)).collect();
        let items: Vec<_> = sentences
            .iter()
            .map(|(p, m)| BatchItem {
                potentials: p,
                mask: m,
            })
            .collect();

        let batched = infer_batch(&engine, &items).unwrap();
        for ((potentials, mask), run) in sentences.iter().zip(batched.iter()) {
            let single = engine.infer(potentials, mask).unwrap();
            for (qa, qb) in single.trace().iter().zip(run.trace().iter()) {
                for (va, vb) in qa.data().iter().zip(qb.data().iter()) {
                    assert_eq!(va.to_bits(), vb.to_bits());
                }
            }
        }
    }

    #[test]
    fn train_batch_reports_the_mean_loss() {
        let engine = Engine::new(InferenceConfig::default());
        let adapter = TrainingAdapter::default();
        let sentences: Vec<_> = (0..4).map(|s| sentence(4, s as f32 * 0.2)).collect();
        let golds: Vec<_> = sentences
            .iter()
            .map(|(p, _)| {
                let mut gold = GoldChart::absent(p.n());
                gold.set(0, 1, 1);
                gold
            })
            .collect();
        let items: Vec<_> = sentences
            .iter()
            .zip(golds.iter())
            .map(|((p, m), g)| TrainItem {
                potentials: p,
                mask: m,
                gold: g,
            })
            .collect();

        let (mean, outputs) = train_batch(&engine, &adapter, &items).unwrap();
        assert_eq!(outputs.len(), 4);
        let expected = outputs.iter().map(|o| o.loss).sum::<f32>() / 4.0;
        assert!((mean - expected).abs() < 1e-6);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let engine = Engine::new(InferenceConfig::default());
        let adapter = TrainingAdapter::default();
        let (mean, outputs) = train_batch(&engine, &adapter, &[]).unwrap();
        assert_eq!(mean, 0.0);
        assert!(outputs.is_empty());
    }
}

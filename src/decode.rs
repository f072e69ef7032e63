//! Decoding marginals into discrete graphs.
//!
//! An arc is kept iff its marginal reaches the fixed `0.5` threshold; when
//! label scores are supplied, each kept arc takes its arg-max label and every
//! other position gets the [`crate::chart::NO_LABEL`] sentinel. Pure
//! functions, no state.

use serde::{Deserialize, Serialize};

use crate::chart::{check_same_n, ArcChart, LabelChart, LabelScores};
use crate::error::{ArcmargResult, ChartError, DecodeError};

/// The fixed decision threshold on marginals. Not tunable per call.
pub const ARC_THRESHOLD: f32 = 0.5;

/// A decoded semantic dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedGraph {
    n: usize,
    arcs: Vec<bool>,
    labels: Option<LabelChart>,
}

impl DecodedGraph {
    /// Number of token positions.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Whether the arc head `i` → dependent `j` was decoded.
    #[inline]
    pub fn has_arc(&self, i: usize, j: usize) -> bool {
        debug_assert!(i < self.n && j < self.n);
        self.arcs[i * self.n + j]
    }

    /// Decoded labels, if label scores participated in decoding.
    pub fn labels(&self) -> Option<&LabelChart> {
        self.labels.as_ref()
    }

    /// Number of decoded arcs.
    pub fn arc_count(&self) -> usize {
        self.arcs.iter().filter(|&&a| a).count()
    }
}

/// Threshold marginals into a bare arc graph.
pub fn decode_arcs(marginals: &ArcChart) -> DecodedGraph {
    let n = marginals.n();
    let arcs = marginals.data().iter().map(|&q| q >= ARC_THRESHOLD).collect();
    DecodedGraph {
        n,
        arcs,
        labels: None,
    }
}

/// Threshold marginals and label every decoded arc with its arg-max score;
/// positions without an arc get [`crate::chart::NO_LABEL`]. Ties break toward
/// the lowest label id, so decoding is deterministic.
pub fn decode_labeled(
    marginals: &ArcChart,
    scores: &LabelScores,
) -> ArcmargResult<DecodedGraph> {
    let n = marginals.n();
    check_same_n(n, scores.n()).map_err(DecodeError::Chart)?;
    if scores.n_labels() == 0 {
        return Err(DecodeError::Chart(ChartError::Empty).into());
    }

    let mut graph = decode_arcs(marginals);
    let mut labels = LabelChart::unlabeled(n);
    for i in 0..n {
        for j in 0..n {
            if !graph.has_arc(i, j) {
                continue;
            }
            let row = scores.scores(i, j);
            let mut best = 0usize;
            for (l, &s) in row.iter().enumerate() {
                if s > row[best] {
                    best = l;
                }
            }
            labels.set(i, j, best as i32);
        }
    }
    graph.labels = Some(labels);
    Ok(graph)
}

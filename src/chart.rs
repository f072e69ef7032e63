//! Dense chart value types.
//!
//! Every tensor the engine consumes or produces is a dense, row-major,
//! sentence-local chart indexed by token positions, with index 0 reserved for
//! the root. Charts are plain owned values: the engine never mutates a
//! caller's chart and always returns freshly allocated outputs.
//!
//! - [`ArcChart`] — `n × n` reals (unary potentials, logits, marginals)
//! - [`TripletChart`] — `n × n × n` reals (second-order potentials)
//! - [`ArcMask`] — `n × n` booleans (structurally admissible positions)
//! - [`GoldChart`] — `n × n` gold arc indicators with `-1` for unknown
//! - [`LabelScores`] / [`LabelChart`] — per-arc label scores and label ids

use serde::{Deserialize, Serialize};

use crate::error::ChartError;

/// Sentinel label id meaning "no label" / "no arc" in a [`LabelChart`].
pub const NO_LABEL: i32 = -1;

/// Check that a set of charts all share the same `n`.
pub(crate) fn check_same_n(expected: usize, actual: usize) -> Result<(), ChartError> {
    if expected != actual {
        return Err(ChartError::DimMismatch { expected, actual });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ArcChart
// ---------------------------------------------------------------------------

/// A dense `n × n` chart of per-arc reals, row-major over `(head, dependent)`.
///
/// `get(i, j)` reads the value for the candidate arc from head `i` to
/// dependent `j`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcChart {
    n: usize,
    data: Vec<f32>,
}

impl ArcChart {
    /// Create a zero-filled chart for a sentence of `n` positions.
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    /// Build a chart from a row-major buffer of `n * n` entries.
    pub fn from_vec(n: usize, data: Vec<f32>) -> Result<Self, ChartError> {
        if n == 0 {
            return Err(ChartError::Empty);
        }
        if data.len() != n * n {
            return Err(ChartError::DataLen {
                n,
                expected: n * n,
                len: data.len(),
            });
        }
        Ok(Self { n, data })
    }

    /// Number of token positions (including the root at index 0).
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    fn idx(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < self.n && j < self.n);
        i * self.n + j
    }

    /// Value for the arc head `i` → dependent `j`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.data[self.idx(i, j)]
    }

    /// Set the value for the arc head `i` → dependent `j`.
    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: f32) {
        let idx = self.idx(i, j);
        self.data[idx] = value;
    }

    /// Row `i` as a contiguous slice over dependents.
    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    /// Mutable row `i`.
    #[inline]
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.n..(i + 1) * self.n]
    }

    /// The full row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable full buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// A freshly allocated transpose (dependent-major view).
    ///
    /// The co-parent contraction reads beliefs by column; transposing once per
    /// iteration keeps its inner loop contiguous.
    pub fn transposed(&self) -> ArcChart {
        let mut out = ArcChart::zeros(self.n);
        for i in 0..self.n {
            for j in 0..self.n {
                out.data[j * self.n + i] = self.data[i * self.n + j];
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// TripletChart
// ---------------------------------------------------------------------------

/// A dense `n × n × n` chart of second-order reals.
///
/// Row-major with the third index contiguous: `get(i, j, k)` is
/// `data[(i*n + j)*n + k]`. The meaning of the indices depends on the factor
/// type — see [`crate::assemble`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripletChart {
    n: usize,
    data: Vec<f32>,
}

impl TripletChart {
    /// Create a zero-filled triplet chart.
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n * n],
        }
    }

    /// Build a chart from a row-major buffer of `n * n * n` entries.
    pub fn from_vec(n: usize, data: Vec<f32>) -> Result<Self, ChartError> {
        if n == 0 {
            return Err(ChartError::Empty);
        }
        if data.len() != n * n * n {
            return Err(ChartError::DataLen {
                n,
                expected: n * n * n,
                len: data.len(),
            });
        }
        Ok(Self { n, data })
    }

    /// Number of token positions.
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        debug_assert!(i < self.n && j < self.n && k < self.n);
        (i * self.n + j) * self.n + k
    }

    /// Value at `(i, j, k)`.
    #[inline]
    pub fn get(&self, i: usize, j: usize, k: usize) -> f32 {
        self.data[self.idx(i, j, k)]
    }

    /// Set the value at `(i, j, k)`.
    #[inline]
    pub fn set(&mut self, i: usize, j: usize, k: usize, value: f32) {
        let idx = self.idx(i, j, k);
        self.data[idx] = value;
    }

    /// The contiguous `k`-axis slice at `(i, j, ·)`.
    #[inline]
    pub fn row(&self, i: usize, j: usize) -> &[f32] {
        let base = (i * self.n + j) * self.n;
        &self.data[base..base + self.n]
    }

    /// Mutable `k`-axis slice at `(i, j, ·)`.
    #[inline]
    pub fn row_mut(&mut self, i: usize, j: usize) -> &mut [f32] {
        let base = (i * self.n + j) * self.n;
        &mut self.data[base..base + self.n]
    }

    /// The full row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable full buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

// ---------------------------------------------------------------------------
// ArcMask
// ---------------------------------------------------------------------------

/// Boolean chart of structurally admissible arc positions.
///
/// Masked-out positions never influence, and are never reported as, a valid
/// marginal. The standard constructor excludes self-loops, the root as a
/// dependent, and padding beyond the true sentence length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcMask {
    n: usize,
    data: Vec<bool>,
}

impl ArcMask {
    /// Admissible positions for a sentence of `len` real positions (root
    /// included) padded out to `n`: `i < len`, `j < len`, `j != 0`, `i != j`.
    pub fn for_len(n: usize, len: usize) -> Result<Self, ChartError> {
        if n == 0 {
            return Err(ChartError::Empty);
        }
        if len > n {
            return Err(ChartError::DimMismatch {
                expected: n,
                actual: len,
            });
        }
        let mut data = vec![false; n * n];
        for i in 0..len {
            for j in 1..len {
                if i != j {
                    data[i * n + j] = true;
                }
            }
        }
        Ok(Self { n, data })
    }

    /// All structurally admissible positions for an unpadded sentence.
    pub fn full(n: usize) -> Result<Self, ChartError> {
        Self::for_len(n, n)
    }

    /// Build a mask from a row-major boolean buffer.
    pub fn from_vec(n: usize, data: Vec<bool>) -> Result<Self, ChartError> {
        if n == 0 {
            return Err(ChartError::Empty);
        }
        if data.len() != n * n {
            return Err(ChartError::DataLen {
                n,
                expected: n * n,
                len: data.len(),
            });
        }
        Ok(Self { n, data })
    }

    /// Number of token positions.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Whether the arc head `i` → dependent `j` is admissible.
    #[inline]
    pub fn allows(&self, i: usize, j: usize) -> bool {
        debug_assert!(i < self.n && j < self.n);
        self.data[i * self.n + j]
    }

    /// Flip a single position.
    pub fn set(&mut self, i: usize, j: usize, admissible: bool) {
        debug_assert!(i < self.n && j < self.n);
        self.data[i * self.n + j] = admissible;
    }

    /// Number of admissible positions.
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&b| b).count()
    }
}

// ---------------------------------------------------------------------------
// GoldChart
// ---------------------------------------------------------------------------

/// Gold arc indicators: `1` = arc, `0` = no arc, negative = unknown/padding.
///
/// Unknown positions are excluded from the loss alongside mask-false ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldChart {
    n: usize,
    data: Vec<i8>,
}

impl GoldChart {
    /// All-absent gold chart (every position `0`).
    pub fn absent(n: usize) -> Self {
        Self {
            n,
            data: vec![0; n * n],
        }
    }

    /// Build from a row-major buffer of `n * n` indicators.
    pub fn from_vec(n: usize, data: Vec<i8>) -> Result<Self, ChartError> {
        if n == 0 {
            return Err(ChartError::Empty);
        }
        if data.len() != n * n {
            return Err(ChartError::DataLen {
                n,
                expected: n * n,
                len: data.len(),
            });
        }
        Ok(Self { n, data })
    }

    /// Derive arc indicators from a gold label chart: any labeled position is
    /// an arc, [`NO_LABEL`] positions are non-arcs. Positions that should be
    /// *unknown* (padding) must be marked with [`GoldChart::set`] afterwards.
    pub fn from_labels(labels: &LabelChart) -> Self {
        let data = labels
            .data
            .iter()
            .map(|&l| if l >= 0 { 1 } else { 0 })
            .collect();
        Self { n: labels.n, data }
    }

    /// Number of token positions.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Indicator at `(i, j)`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> i8 {
        debug_assert!(i < self.n && j < self.n);
        self.data[i * self.n + j]
    }

    /// Set the indicator at `(i, j)`.
    pub fn set(&mut self, i: usize, j: usize, value: i8) {
        debug_assert!(i < self.n && j < self.n);
        self.data[i * self.n + j] = value;
    }
}

// ---------------------------------------------------------------------------
// Label charts
// ---------------------------------------------------------------------------

/// Per-arc label scores: `n × n × n_labels`, label axis contiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScores {
    n: usize,
    n_labels: usize,
    data: Vec<f32>,
}

impl LabelScores {
    /// Zero-filled label scores.
    pub fn zeros(n: usize, n_labels: usize) -> Self {
        Self {
            n,
            n_labels,
            data: vec![0.0; n * n * n_labels],
        }
    }

    /// Build from a row-major buffer of `n * n * n_labels` entries.
    pub fn from_vec(n: usize, n_labels: usize, data: Vec<f32>) -> Result<Self, ChartError> {
        if n == 0 || n_labels == 0 {
            return Err(ChartError::Empty);
        }
        if data.len() != n * n * n_labels {
            return Err(ChartError::DataLen {
                n,
                expected: n * n * n_labels,
                len: data.len(),
            });
        }
        Ok(Self { n, n_labels, data })
    }

    /// Number of token positions.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Size of the label vocabulary.
    pub fn n_labels(&self) -> usize {
        self.n_labels
    }

    /// The contiguous label-score slice for arc `(i, j)`.
    #[inline]
    pub fn scores(&self, i: usize, j: usize) -> &[f32] {
        let base = (i * self.n + j) * self.n_labels;
        &self.data[base..base + self.n_labels]
    }

    /// Mutable label-score slice for arc `(i, j)`.
    #[inline]
    pub fn scores_mut(&mut self, i: usize, j: usize) -> &mut [f32] {
        let base = (i * self.n + j) * self.n_labels;
        &mut self.data[base..base + self.n_labels]
    }
}

/// Per-arc label ids, [`NO_LABEL`] where no arc exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelChart {
    n: usize,
    data: Vec<i32>,
}

impl LabelChart {
    /// A chart with every position set to [`NO_LABEL`].
    pub fn unlabeled(n: usize) -> Self {
        Self {
            n,
            data: vec![NO_LABEL; n * n],
        }
    }

    /// Build from a row-major buffer of `n * n` label ids.
    pub fn from_vec(n: usize, data: Vec<i32>) -> Result<Self, ChartError> {
        if n == 0 {
            return Err(ChartError::Empty);
        }
        if data.len() != n * n {
            return Err(ChartError::DataLen {
                n,
                expected: n * n,
                len: data.len(),
            });
        }
        Ok(Self { n, data })
    }

    /// Number of token positions.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Label id at `(i, j)`, [`NO_LABEL`] if absent.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> i32 {
        debug_assert!(i < self.n && j < self.n);
        self.data[i * self.n + j]
    }

    /// Set the label id at `(i, j)`.
    pub fn set(&mut self, i: usize, j: usize, label: i32) {
        debug_assert!(i < self.n && j < self.n);
        self.data[i * self.n + j] = label;
    }
}

//! Potential assembler.
//!
//! Trilinear scorers compute all `n³` index orderings independently, so their
//! raw sibling and co-parent charts do not satisfy the exchange invariants the
//! factor graph requires. The assembler builds valid potentials from the
//! upper-triangular half only: the lower half is produced by transposition,
//! never scored twice, so the symmetry holds bit-for-bit rather than up to
//! floating-point noise.
//!
//! Index conventions (all row-major, third axis contiguous):
//!
//! - `sib[i, j, k]` — head `i` with dependents `j` and `k`; symmetric in
//!   `(j, k)`, couples arcs `(i, j)` and `(i, k)`.
//! - `cop[i, j, k]` — dependent `j` with heads `i` and `k`; symmetric in
//!   `(i, k)`, couples arcs `(i, j)` and `(k, j)`.
//! - `grd[i, j, k]` — chain `i → j → k`; directional, couples arcs `(i, j)`
//!   and `(j, k)`, passed through unchanged.

use serde::{Deserialize, Serialize};

use crate::chart::{check_same_n, ArcChart, TripletChart};
use crate::error::ChartError;

/// Symmetrize over the two dependent indices `(j, k)`: the upper triangle
/// `j <= k` is kept, the lower triangle is its transpose.
pub fn symmetrize_outer(raw: &TripletChart) -> TripletChart {
    let n = raw.n();
    let mut sym = TripletChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                let value = if j <= k {
                    raw.get(i, j, k)
                } else {
                    raw.get(i, k, j)
                };
                sym.set(i, j, k, value);
            }
        }
    }
    sym
}

/// Adjoint of [`symmetrize_outer`]: fold a gradient over the symmetric chart
/// back onto the upper-triangular raw parameterization. The lower triangle of
/// the result is zero — those raw entries were never read.
pub fn symmetrize_outer_backward(grad_sym: &TripletChart) -> TripletChart {
    let n = grad_sym.n();
    let mut grad_raw = TripletChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            for k in j..n {
                let g = if j == k {
                    grad_sym.get(i, j, k)
                } else {
                    grad_sym.get(i, j, k) + grad_sym.get(i, k, j)
                };
                grad_raw.set(i, j, k, g);
            }
        }
    }
    grad_raw
}

/// Symmetrize over the two head indices `(i, k)`: the half `i <= k` is kept,
/// the other half is its transpose.
pub fn symmetrize_ends(raw: &TripletChart) -> TripletChart {
    let n = raw.n();
    let mut sym = TripletChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                let value = if i <= k {
                    raw.get(i, j, k)
                } else {
                    raw.get(k, j, i)
                };
                sym.set(i, j, k, value);
            }
        }
    }
    sym
}

/// Adjoint of [`symmetrize_ends`].
pub fn symmetrize_ends_backward(grad_sym: &TripletChart) -> TripletChart {
    let n = grad_sym.n();
    let mut grad_raw = TripletChart::zeros(n);
    for i in 0..n {
        for j in 0..n {
            for k in i..n {
                let g = if i == k {
                    grad_sym.get(i, j, k)
                } else {
                    grad_sym.get(i, j, k) + grad_sym.get(k, j, i)
                };
                grad_raw.set(i, j, k, g);
            }
        }
    }
    grad_raw
}

/// Assembled first- and second-order potentials for one sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Potentials {
    /// Per-arc log-odds.
    pub unary: ArcChart,
    /// Sibling potentials, symmetric in the two dependent indices.
    pub sib: TripletChart,
    /// Co-parent potentials, symmetric in the two head indices.
    pub cop: TripletChart,
    /// Grandparent potentials, directional.
    pub grd: TripletChart,
}

impl Potentials {
    /// Assemble valid potentials from raw scorer outputs: symmetrize sibling
    /// and co-parent charts, pass grandparent scores through.
    pub fn assemble(
        unary: ArcChart,
        raw_sib: &TripletChart,
        raw_cop: &TripletChart,
        grd: TripletChart,
    ) -> Result<Self, ChartError> {
        let n = unary.n();
        if n == 0 {
            return Err(ChartError::Empty);
        }
        check_same_n(n, raw_sib.n())?;
        check_same_n(n, raw_cop.n())?;
        check_same_n(n, grd.n())?;
        Ok(Self {
            unary,
            sib: symmetrize_outer(raw_sib),
            cop: symmetrize_ends(raw_cop),
            grd,
        })
    }

    /// Bundle already-valid potentials without symmetrizing. The caller is
    /// responsible for the exchange invariants.
    pub fn from_parts(
        unary: ArcChart,
        sib: TripletChart,
        cop: TripletChart,
        grd: TripletChart,
    ) -> Result<Self, ChartError> {
        let n = unary.n();
        if n == 0 {
            return Err(ChartError::Empty);
        }
        check_same_n(n, sib.n())?;
        check_same_n(n, cop.n())?;
        check_same_n(n, grd.n())?;
        Ok(Self {
            unary,
            sib,
            cop,
            grd,
        })
    }

    /// Unary-only potentials with all triplet charts zero.
    pub fn unary_only(unary: ArcChart) -> Result<Self, ChartError> {
        let n = unary.n();
        if n == 0 {
            return Err(ChartError::Empty);
        }
        Ok(Self {
            unary,
            sib: TripletChart::zeros(n),
            cop: TripletChart::zeros(n),
            grd: TripletChart::zeros(n),
        })
    }

    /// Number of token positions.
    pub fn n(&self) -> usize {
        self.unary.n()
    }
}

/// Gradients of a loss with respect to one sentence's potentials.
///
/// Produced by the backward pass in the *assembled* parameterization (the
/// sibling and co-parent charts are symmetric). Call [`Self::into_raw`] to
/// fold them onto the upper-triangular raw scorer outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct PotentialGradients {
    pub unary: ArcChart,
    pub sib: TripletChart,
    pub cop: TripletChart,
    pub grd: TripletChart,
}

impl PotentialGradients {
    /// Zero gradients for a sentence of `n` positions.
    pub fn zeros(n: usize) -> Self {
        Self {
            unary: ArcChart::zeros(n),
            sib: TripletChart::zeros(n),
            cop: TripletChart::zeros(n),
            grd: TripletChart::zeros(n),
        }
    }

    /// Map gradients from the assembled parameterization back to the raw
    /// scorer outputs: sibling and co-parent gradients fold onto their upper
    /// triangles, grandparent and unary gradients are already raw.
    pub fn into_raw(self) -> PotentialGradients {
        PotentialGradients {
            unary: self.unary,
            sib: symmetrize_outer_backward(&self.sib),
            cop: symmetrize_ends_backward(&self.cop),
            grd: self.grd,
        }
    }
}

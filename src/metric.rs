//! Precision / recall / F1 over labeled arc charts.
//!
//! Accumulates counts across sentences and batches; merge partial metrics
//! with `+=`. Predictions and gold use the [`LabelChart`] convention:
//! [`crate::chart::NO_LABEL`] means no arc.

use serde::{Deserialize, Serialize};

use crate::chart::{check_same_n, LabelChart};
use crate::error::ArcmargResult;

/// Running chart metric: unlabeled and labeled precision / recall / F1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartMetric {
    utp: usize,
    ltp: usize,
    pred: usize,
    gold: usize,
}

impl ChartMetric {
    /// Fresh metric with all counts zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one sentence's predicted and gold label charts.
    pub fn observe(&mut self, pred: &LabelChart, gold: &LabelChart) -> ArcmargResult<()> {
        check_same_n(pred.n(), gold.n())?;
        let n = pred.n();
        for i in 0..n {
            for j in 0..n {
                let p = pred.get(i, j);
                let g = gold.get(i, j);
                if p >= 0 {
                    self.pred += 1;
                }
                if g >= 0 {
                    self.gold += 1;
                }
                if p >= 0 && g >= 0 {
                    self.utp += 1;
                    if p == g {
                        self.ltp += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn ratio(num: usize, den: usize) -> f64 {
        if den == 0 {
            0.0
        } else {
            num as f64 / den as f64
        }
    }

    fn f1(p: f64, r: f64) -> f64 {
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    /// Unlabeled precision.
    pub fn up(&self) -> f64 {
        Self::ratio(self.utp, self.pred)
    }

    /// Unlabeled recall.
    pub fn ur(&self) -> f64 {
        Self::ratio(self.utp, self.gold)
    }

    /// Unlabeled F1.
    pub fn uf(&self) -> f64 {
        Self::f1(self.up(), self.ur())
    }

    /// Labeled precision.
    pub fn lp(&self) -> f64 {
        Self::ratio(self.ltp, self.pred)
    }

    /// Labeled recall.
    pub fn lr(&self) -> f64 {
        Self::ratio(self.ltp, self.gold)
    }

    /// Labeled F1.
    pub fn lf(&self) -> f64 {
        Self::f1(self.lp(), self.lr())
    }
}

impl std::ops::AddAssign for ChartMetric {
    fn add_assign(&mut self, rhs: Self) {
        self.utp += rhs.utp;
        self.ltp += rhs.ltp;
        self.pred += rhs.pred;
        self.gold += rhs.gold;
    }
}

impl std::fmt::Display for ChartMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UP: {:6.2}% UR: {:6.2}% UF: {:6.2}% LP: {:6.2}% LR: {:6.2}% LF: {:6.2}%",
            self.up() * 100.0,
            self.ur() * 100.0,
            self.uf() * 100.0,
            self.lp() * 100.0,
            self.lr() * 100.0,
            self.lf() * 100.0,
        )
    }
}

//! # arcmarg
//!
//! Approximate marginal inference over semantic dependency graphs — the
//! structured core of a second-order graph parser, with gradients through the
//! inference procedure itself.
//!
//! In a semantic dependency graph a token may take zero, one, or several
//! heads, so the output space is a general directed graph and exact marginals
//! are intractable once triplet (sibling / co-parent / grandparent) factors
//! enter the model. This crate turns per-arc and per-triplet potentials into
//! approximate arc marginals by unrolling a fixed number of fixed-point or
//! message-passing rounds, and replays the unrolled loop backward so a
//! surrounding learner can train its scorers through the inference.
//!
//! ## Architecture
//!
//! - **Potential assembler** (`assemble`): exact transposition-based
//!   symmetrization of raw triplet scores
//! - **Inference engine** (`infer`): one contract, two strategies — MFVI and
//!   loopy BP — selected by configuration
//! - **Training adapter** (`train`): per-iteration cross-entropy and the
//!   logit gradients the backward pass consumes
//! - **Decoder** (`decode`): fixed-threshold arc decisions, arg-max labels
//! - **SIMD kernels** (`kernel`): runtime-dispatched AVX2/generic contraction
//!   primitives
//! - **Batching** (`batch`): rayon data-parallelism across independent
//!   sentences
//!
//! ## Library usage
//!
//! ```
//! use arcmarg::assemble::Potentials;
//! use arcmarg::chart::{ArcChart, ArcMask};
//! use arcmarg::decode::decode_arcs;
//! use arcmarg::infer::{Engine, InferenceConfig};
//!
//! let mut unary = ArcChart::zeros(3);
//! unary.set(0, 1, 2.0);
//! unary.set(0, 2, -1.0);
//! let potentials = Potentials::unary_only(unary).unwrap();
//! let mask = ArcMask::full(3).unwrap();
//!
//! let engine = Engine::new(InferenceConfig::default());
//! let run = engine.infer(&potentials, &mask).unwrap();
//! let graph = decode_arcs(run.marginals());
//! assert!(graph.has_arc(0, 1));
//! assert!(!graph.has_arc(0, 2));
//! ```

pub mod assemble;
pub mod batch;
pub mod chart;
pub mod decode;
pub mod error;
pub mod infer;
pub mod kernel;
pub mod metric;
pub mod num;
pub mod train;

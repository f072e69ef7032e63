//! SIMD-accelerated kernels for chart contractions.
//!
//! This module provides a `MathKernel` trait with CPU-specific implementations.
//! At runtime, [`detect_isa`] determines the best available instruction set and
//! [`best_kernel`] returns the fastest implementation for the current CPU.
//!
//! The inference strategies express every second-order contraction through
//! these slice primitives (dot products over the contiguous triplet axis,
//! scaled row accumulation), which keeps the `O(n³)` work in matmul-shaped
//! inner loops instead of scattered scalar indexing.
//!
//! # Supported ISA levels
//!
//! - **Generic**: Pure-Rust scalar fallback — works everywhere
//! - **AVX2**: 256-bit SIMD for x86_64 systems with AVX2 support

pub mod avx2;
pub mod generic;

/// Instruction set architecture level detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsaLevel {
    /// Pure-Rust scalar operations, no SIMD.
    Generic,
    /// x86_64 AVX2 (256-bit vectors).
    Avx2,
}

impl std::fmt::Display for IsaLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsaLevel::Generic => write!(f, "Generic (scalar)"),
            IsaLevel::Avx2 => write!(f, "AVX2 (256-bit)"),
        }
    }
}

/// Detect the best ISA level available on the current CPU.
pub fn detect_isa() -> IsaLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return IsaLevel::Avx2;
        }
    }
    IsaLevel::Generic
}

/// Trait for SIMD-accelerated math kernels over `f32` slices.
///
/// Implementations must be deterministic: the same inputs produce bit-identical
/// outputs on every call within a process. Accumulation order may differ
/// between ISA levels, so cross-kernel comparisons carry a tolerance.
pub trait MathKernel: Send + Sync {
    /// The ISA level this kernel targets.
    fn isa_level(&self) -> IsaLevel;

    /// Dot product of two equal-length slices.
    fn dot(&self, a: &[f32], b: &[f32]) -> f32;

    /// Scaled accumulation `y[i] += alpha * x[i]`.
    fn axpy(&self, alpha: f32, x: &[f32], y: &mut [f32]);

    /// Sum of all elements.
    fn sum(&self, a: &[f32]) -> f32;
}

/// Return the best available kernel for the current CPU.
pub fn best_kernel() -> Box<dyn MathKernel> {
    match detect_isa() {
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Avx2 => Box::new(avx2::Avx2Kernel),
        _ => Box::new(generic::GenericKernel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_isa_returns_valid_level() {
        let level = detect_isa();
        assert!(level >= IsaLevel::Generic);
    }

    #[test]
    fn best_kernel_returns_working_kernel() {
        let kernel = best_kernel();
        assert!(kernel.isa_level() >= IsaLevel::Generic);
    }

    /// Run the full kernel test suite against any implementation.
    pub fn kernel_conformance_tests(kernel: &dyn MathKernel) {
        // Dot of a vector with itself is its squared norm.
        let a: Vec<f32> = (0..100).map(|i| i as f32 * 0.25).collect();
        let expected: f32 = a.iter().map(|x| x * x).sum();
        let dot = kernel.dot(&a, &a);
        assert!(
            (dot - expected).abs() <= expected.abs() * 1e-5,
            "dot={dot}, expected={expected}"
        );

        // Dot with zeros is zero.
        let zeros = vec![0.0f32; 100];
        assert_eq!(kernel.dot(&a, &zeros), 0.0);

        // Axpy with alpha = 0 leaves the target unchanged.
        let mut y = vec![1.5f32; 37];
        kernel.axpy(0.0, &a[..37], &mut y);
        assert!(y.iter().all(|&v| v == 1.5));

        // Axpy accumulates.
        let x = vec![2.0f32; 37];
        kernel.axpy(0.5, &x, &mut y);
        assert!(y.iter().all(|&v| (v - 2.5).abs() < 1e-6));

        // Sum over an odd-length slice exercises the scalar tail.
        let b = vec![0.125f32; 41];
        let sum = kernel.sum(&b);
        assert!((sum - 41.0 * 0.125).abs() < 1e-5, "sum={sum}");

        // Empty slices are a no-op.
        assert_eq!(kernel.dot(&[], &[]), 0.0);
        assert_eq!(kernel.sum(&[]), 0.0);
    }

    #[test]
    fn generic_kernel_conformance() {
        kernel_conformance_tests(&generic::GenericKernel);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn avx2_kernel_conformance() {
        if detect_isa() >= IsaLevel::Avx2 {
            kernel_conformance_tests(&avx2::Avx2Kernel);
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn kernels_agree_on_random_slices() {
        if detect_isa() < IsaLevel::Avx2 {
            return;
        }
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let a: Vec<f32> = (0..517).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let b: Vec<f32> = (0..517).map(|_| rng.gen_range(-2.0..2.0)).collect();

        let scalar = generic::GenericKernel.dot(&a, &b);
        let simd = avx2::Avx2Kernel.dot(&a, &b);
        assert!(
            (scalar - simd).abs() <= 1e-3 + scalar.abs() * 1e-4,
            "scalar={scalar}, simd={simd}"
        );

        let mut y1 = b.clone();
        let mut y2 = b.clone();
        generic::GenericKernel.axpy(0.75, &a, &mut y1);
        avx2::Avx2Kernel.axpy(0.75, &a, &mut y2);
        for (v1, v2) in y1.iter().zip(y2.iter()) {
            assert!((v1 - v2).abs() < 1e-5);
        }
    }
}

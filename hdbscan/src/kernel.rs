/// Distance function used by the ball tree and the MST solver.
///
/// Tree bounds (node gaps, radius corrections) only hold in linear distance,
/// so every kernel tells the tree how to convert between its own units and
/// linear distance.
pub trait Kernel {
    /// Distance between two vectors in kernel units.
    fn compute(&self, a: &[f32], b: &[f32]) -> f64;

    /// Converts a kernel-unit distance to linear distance.
    fn to_linear(&self, d: f64) -> f64;

    /// Converts a linear distance to kernel units.
    fn from_linear(&self, d: f64) -> f64;
}

/// Squared Euclidean distance: Σ(aᵢ − bᵢ)².
///
/// Cheaper than [`Euclidean`] and orders pairs identically, which is all the
/// neighbour search and the MST need. Only meaningful for continuous vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredEuclidean;

impl Kernel for SquaredEuclidean {
    fn compute(&self, a: &[f32], b: &[f32]) -> f64 {
        squared_sum(a, b)
    }

    fn to_linear(&self, d: f64) -> f64 {
        d.max(0.0).sqrt()
    }

    fn from_linear(&self, d: f64) -> f64 {
        d * d
    }
}

/// Plain Euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl Kernel for Euclidean {
    fn compute(&self, a: &[f32], b: &[f32]) -> f64 {
        squared_sum(a, b).sqrt()
    }

    fn to_linear(&self, d: f64) -> f64 {
        d
    }

    fn from_linear(&self, d: f64) -> f64 {
        d
    }
}

/// Uses f64 intermediate precision; extra trailing components of the longer
/// slice are ignored.
fn squared_sum(a: &[f32], b: &[f32]) -> f64 {
    let mut sum: f64 = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let d = x as f64 - y as f64;
        sum += d * d;
    }
    sum
}

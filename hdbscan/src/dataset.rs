use std::collections::HashMap;

use crate::error::HdbscanError;

/// Stable point identifier. Reused as the key of every exported table.
pub type Label = u64;

/// A labelled set of vectors fed to the ball tree.
///
/// Dimensionality is fixed by the first inserted vector. Internally points
/// are addressed by their insertion index (`0..len`).
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    labels: Vec<Label>,
    vectors: Vec<Vec<f32>>,
    index: HashMap<Label, usize>,
    dim: usize,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dataset labelled `0..vectors.len()`.
    pub fn from_vectors(vectors: Vec<Vec<f32>>) -> Result<Self, HdbscanError> {
        let mut ds = Self::new();
        for (i, v) in vectors.into_iter().enumerate() {
            ds.push(i as Label, v)?;
        }
        Ok(ds)
    }

    /// Appends a labelled vector.
    pub fn push(&mut self, label: Label, vector: Vec<f32>) -> Result<(), HdbscanError> {
        if vector.is_empty() {
            return Err(HdbscanError::EmptyVector);
        }
        if self.vectors.is_empty() {
            self.dim = vector.len();
        } else if vector.len() != self.dim {
            return Err(HdbscanError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        if self.index.contains_key(&label) {
            return Err(HdbscanError::DuplicateLabel(label));
        }
        self.index.insert(label, self.vectors.len());
        self.labels.push(label);
        self.vectors.push(vector);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Vector dimensionality, 0 while empty.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn label(&self, idx: usize) -> Label {
        self.labels[idx]
    }

    pub fn vector(&self, idx: usize) -> &[f32] {
        &self.vectors[idx]
    }

    pub fn index_of(&self, label: Label) -> Option<usize> {
        self.index.get(&label).copied()
    }

    pub fn get(&self, label: Label) -> Option<&[f32]> {
        self.index_of(label).map(|i| self.vector(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Label, &[f32])> {
        self.labels
            .iter()
            .copied()
            .zip(self.vectors.iter().map(|v| v.as_slice()))
    }
}

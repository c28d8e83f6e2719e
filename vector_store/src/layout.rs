use serde::{Deserialize, Serialize};

use crate::{Result, StoreErr};

/// The fixed shape shared by every vector in a store.
///
/// A dense layout materializes every coordinate. A masked layout only stores the
/// coordinates selected by a boolean mask, callers still exchange full length vectors
/// and the unselected coordinates read back as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    dim: usize,
    coords: Option<Box<[usize]>>,
}

impl Layout {
    /// Creates a new dense `Layout`.
    ///
    /// # Arguments
    /// * `dim` - The full length of every vector.
    ///
    /// # Returns
    /// A new `Layout` instance.
    pub fn dense(dim: usize) -> Self {
        Self { dim, coords: None }
    }

    /// Creates a new masked `Layout`.
    ///
    /// # Arguments
    /// * `mask` - Which coordinates are materialized.
    /// * `dim` - The full length of every vector.
    ///
    /// # Returns
    /// A new `Layout` or a `ShapeMismatch` if the mask and `dim` disagree.
    pub fn masked(mask: &[bool], dim: usize) -> Result<Self> {
        if mask.len() != dim {
            return Err(StoreErr::ShapeMismatch {
                what: "mask",
                got: mask.len(),
                expected: dim,
            });
        }

        let coords = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();

        Ok(Self {
            dim,
            coords: Some(coords),
        })
    }

    /// Returns the full length of the vectors.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the amount of coordinates actually stored per vector.
    pub fn stored_len(&self) -> usize {
        self.coords.as_ref().map_or(self.dim, |coords| coords.len())
    }

    pub fn is_masked(&self) -> bool {
        self.coords.is_some()
    }

    /// Selects the stored coordinates out of a full length vector.
    ///
    /// # Arguments
    /// * `vector` - A vector of length `dim`.
    ///
    /// # Returns
    /// The stored representation or a `ShapeMismatch`.
    pub fn compact(&self, vector: &[f32]) -> Result<Box<[f32]>> {
        if vector.len() != self.dim {
            return Err(StoreErr::ShapeMismatch {
                what: "vector",
                got: vector.len(),
                expected: self.dim,
            });
        }

        let stored = match &self.coords {
            Some(coords) => coords.iter().map(|&i| vector[i]).collect(),
            None => Box::from(vector),
        };

        Ok(stored)
    }

    /// Scatters a stored representation back into a full length vector.
    ///
    /// # Arguments
    /// * `stored` - A slice produced by `compact`.
    pub fn expand(&self, stored: &[f32]) -> Vec<f32> {
        match &self.coords {
            Some(coords) => {
                let mut vector = vec![0.; self.dim];
                coords
                    .iter()
                    .zip(stored)
                    .for_each(|(&i, &v)| vector[i] = v);
                vector
            }
            None => stored.to_vec(),
        }
    }

    pub(crate) fn record(&self) -> LayoutRecord {
        LayoutRecord {
            dim: self.dim,
            stored: self.stored_len(),
        }
    }
}

/// What gets written to a store directory to detect reopening it with another shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LayoutRecord {
    pub dim: usize,
    pub stored: usize,
}

impl LayoutRecord {
    pub fn check(&self, expected: &LayoutRecord) -> Result<()> {
        if self.dim != expected.dim {
            return Err(StoreErr::ShapeMismatch {
                what: "stored dimension",
                got: self.dim,
                expected: expected.dim,
            });
        }

        if self.stored != expected.stored {
            return Err(StoreErr::ShapeMismatch {
                what: "stored coordinates",
                got: self.stored,
                expected: expected.stored,
            });
        }

        Ok(())
    }
}

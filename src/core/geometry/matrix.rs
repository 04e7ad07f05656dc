//! 4x4 matrices.

use crate::core::common::Float;
use serde::{Deserialize, Serialize};

/// A 4x4 row-major matrix. Traversal frames carry these as opaque local
/// transforms; the coordination core never interprets them.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matrix4x4 {
    pub m: [[Float; 4]; 4],
}

impl Matrix4x4 {
    /// The identity matrix.
    pub const IDENTITY: Self = Self {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    /// Create a matrix from its 16 elements in row-major order.
    ///
    /// * `m` - The elements.
    pub fn new(m: [[Float; 4]; 4]) -> Self {
        Self { m }
    }
}

impl Default for Matrix4x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

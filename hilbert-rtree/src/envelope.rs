//! Axis-aligned bounding envelopes in two or three dimensions.
//!
//! `Envelope` is the immutable value type every other module works with:
//! node boundaries, data-entry extents and query regions are all
//! envelopes. The arithmetic here (`union`, `intersects`, `center`) is
//! pure; mixing dimensionalities in these operations is a programmer
//! error and fails fast rather than returning a recoverable result.

use serde::{Deserialize, Serialize};

use crate::store::types::{IndexResult, StoreIndexError};

/// Number of ordinates an envelope reserves per corner. Two-dimensional
/// envelopes leave the third ordinate at zero.
pub const MAX_DIM: usize = 3;

/// Dimensionality of a coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Two,
    Three,
}

impl Dimension {
    /// Number of axes.
    pub fn axes(self) -> usize {
        match self {
            Dimension::Two => 2,
            Dimension::Three => 3,
        }
    }
}

/// A coordinate reference system identifier paired with its
/// dimensionality. The index never interprets the `srid`; it is carried
/// in the store header so a reopened index can be matched against the
/// collaborator that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crs {
    pub srid: u32,
    pub dim: Dimension,
}

impl Crs {
    pub fn new(srid: u32, dim: Dimension) -> Self {
        Self { srid, dim }
    }
}

/// An axis-aligned bounding box with `lower[i] <= upper[i]` on every
/// axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    dim: Dimension,
    lower: [f64; MAX_DIM],
    upper: [f64; MAX_DIM],
}

impl Envelope {
    /// Creates an envelope from per-axis bounds, validating that every
    /// ordinate is finite and no axis is inverted.
    pub fn new(dim: Dimension, lower: &[f64], upper: &[f64]) -> IndexResult<Self> {
        let n = dim.axes();
        if lower.len() != n || upper.len() != n {
            return Err(StoreIndexError::InvalidArgument(format!(
                "expected {} ordinates per corner, got {}/{}",
                n,
                lower.len(),
                upper.len()
            )));
        }
        let mut lo = [0.0; MAX_DIM];
        let mut hi = [0.0; MAX_DIM];
        for i in 0..n {
            if !lower[i].is_finite() || !upper[i].is_finite() {
                return Err(StoreIndexError::InvalidArgument(format!(
                    "non-finite ordinate on axis {}",
                    i
                )));
            }
            if lower[i] > upper[i] {
                return Err(StoreIndexError::InvalidArgument(format!(
                    "inverted axis {}: {} > {}",
                    i, lower[i], upper[i]
                )));
            }
            lo[i] = lower[i];
            hi[i] = upper[i];
        }
        Ok(Self {
            dim,
            lower: lo,
            upper: hi,
        })
    }

    /// Two-dimensional envelope from corner coordinates.
    pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> IndexResult<Self> {
        Self::new(Dimension::Two, &[min_x, min_y], &[max_x, max_y])
    }

    /// Three-dimensional envelope from corner coordinates.
    #[allow(clippy::too_many_arguments)]
    pub fn cuboid(
        min_x: f64,
        min_y: f64,
        min_z: f64,
        max_x: f64,
        max_y: f64,
        max_z: f64,
    ) -> IndexResult<Self> {
        Self::new(
            Dimension::Three,
            &[min_x, min_y, min_z],
            &[max_x, max_y, max_z],
        )
    }

    /// Degenerate envelope covering a single 2-D point.
    pub fn point2(x: f64, y: f64) -> IndexResult<Self> {
        Self::rect(x, y, x, y)
    }

    /// Degenerate envelope covering a single 3-D point.
    pub fn point3(x: f64, y: f64, z: f64) -> IndexResult<Self> {
        Self::cuboid(x, y, z, x, y, z)
    }

    pub fn dim(&self) -> Dimension {
        self.dim
    }

    pub fn lower(&self, axis: usize) -> f64 {
        debug_assert!(axis < self.dim.axes());
        self.lower[axis]
    }

    pub fn upper(&self, axis: usize) -> f64 {
        debug_assert!(axis < self.dim.axes());
        self.upper[axis]
    }

    /// Componentwise min of lowers, max of uppers.
    pub fn union(&self, other: &Envelope) -> Envelope {
        assert_eq!(self.dim, other.dim, "envelope dimensionality mismatch");
        let mut out = *self;
        for i in 0..self.dim.axes() {
            out.lower[i] = self.lower[i].min(other.lower[i]);
            out.upper[i] = self.upper[i].max(other.upper[i]);
        }
        out
    }

    /// True when the closed boxes share at least one point.
    pub fn intersects(&self, other: &Envelope) -> bool {
        assert_eq!(self.dim, other.dim, "envelope dimensionality mismatch");
        for i in 0..self.dim.axes() {
            if self.upper[i] < other.lower[i] || self.lower[i] > other.upper[i] {
                return false;
            }
        }
        true
    }

    /// True when `other` lies entirely within this envelope.
    pub fn contains(&self, other: &Envelope) -> bool {
        assert_eq!(self.dim, other.dim, "envelope dimensionality mismatch");
        for i in 0..self.dim.axes() {
            if other.lower[i] < self.lower[i] || other.upper[i] > self.upper[i] {
                return false;
            }
        }
        true
    }

    /// Midpoint on every axis.
    pub fn center(&self) -> [f64; MAX_DIM] {
        let mut c = [0.0; MAX_DIM];
        for i in 0..self.dim.axes() {
            c[i] = (self.lower[i] + self.upper[i]) / 2.0;
        }
        c
    }

    /// Area in 2-D, volume in 3-D. Used by the least-enlargement descent
    /// heuristic; degenerate envelopes measure zero.
    pub fn measure(&self) -> f64 {
        let mut m = 1.0;
        for i in 0..self.dim.axes() {
            m *= self.upper[i] - self.lower[i];
        }
        m
    }

    /// Extra measure this envelope would gain by absorbing `other`.
    pub fn enlargement(&self, other: &Envelope) -> f64 {
        self.union(other).measure() - self.measure()
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope[")?;
        for i in 0..self.dim.axes() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}..{}", self.lower[i], self.upper[i])?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_is_componentwise() {
        let a = Envelope::rect(0.0, 0.0, 2.0, 2.0).unwrap();
        let b = Envelope::rect(1.0, -1.0, 3.0, 1.0).unwrap();
        let u = a.union(&b);
        assert_eq!(u, Envelope::rect(0.0, -1.0, 3.0, 2.0).unwrap());
        // Union is commutative
        assert_eq!(u, b.union(&a));
    }

    #[test]
    fn test_intersects_boundaries_touch() {
        let a = Envelope::rect(0.0, 0.0, 1.0, 1.0).unwrap();
        let b = Envelope::rect(1.0, 1.0, 2.0, 2.0).unwrap();
        let c = Envelope::rect(1.5, 0.0, 2.0, 0.5).unwrap();
        assert!(a.intersects(&b), "shared corner counts as intersection");
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_contains() {
        let outer = Envelope::rect(0.0, 0.0, 10.0, 10.0).unwrap();
        let inner = Envelope::rect(2.0, 2.0, 3.0, 3.0).unwrap();
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.contains(&outer));
    }

    #[test]
    fn test_center_and_measure() {
        let e = Envelope::rect(0.0, 2.0, 4.0, 6.0).unwrap();
        let c = e.center();
        assert_eq!(c[0], 2.0);
        assert_eq!(c[1], 4.0);
        assert_eq!(e.measure(), 16.0);

        let v = Envelope::cuboid(0.0, 0.0, 0.0, 2.0, 3.0, 4.0).unwrap();
        assert_eq!(v.measure(), 24.0);
    }

    #[test]
    fn test_rejects_inverted_axis() {
        assert!(Envelope::rect(1.0, 0.0, 0.0, 1.0).is_err());
        assert!(Envelope::rect(0.0, 0.0, 1.0, f64::NAN).is_err());
        assert!(Envelope::rect(0.0, 0.0, f64::INFINITY, 1.0).is_err());
    }

    #[test]
    fn test_degenerate_point_envelope() {
        let p = Envelope::point2(5.0, 5.0).unwrap();
        assert_eq!(p.measure(), 0.0);
        assert!(p.intersects(&Envelope::rect(0.0, 0.0, 10.0, 10.0).unwrap()));
    }

    #[test]
    #[should_panic(expected = "dimensionality mismatch")]
    fn test_mixed_dimensions_fail_fast() {
        let a = Envelope::rect(0.0, 0.0, 1.0, 1.0).unwrap();
        let b = Envelope::cuboid(0.0, 0.0, 0.0, 1.0, 1.0, 1.0).unwrap();
        let _ = a.union(&b);
    }

    #[test]
    fn test_enlargement() {
        let a = Envelope::rect(0.0, 0.0, 2.0, 2.0).unwrap();
        let b = Envelope::rect(0.0, 0.0, 4.0, 2.0).unwrap();
        assert_eq!(a.enlargement(&b), 4.0);
        assert_eq!(b.enlargement(&a), 0.0);
    }
}

// Axis-aligned bounding boxes over f64 intervals.
//
// A box is an ordered sequence of `(lo, hi)` pairs, one per axis. The
// manager carries the dimension every box of an index shares and performs
// the geometric operations; boxes themselves are plain owned values.

use crate::error::{Result, StoreError};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    axes: Box<[(f64, f64)]>,
}

impl BoundingBox {
    pub fn dimension(&self) -> usize {
        self.axes.len()
    }

    pub fn axis(&self, i: usize) -> (f64, f64) {
        self.axes[i]
    }

    pub fn axes(&self) -> &[(f64, f64)] {
        &self.axes
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (lo, hi)) in self.axes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "({lo}, {hi})")?;
        }
        write!(f, "]")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoxManager {
    dimension: usize,
}

impl BoxManager {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(StoreError::InvalidArgument("dimension must be > 0".into()));
        }
        Ok(Self { dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// A degenerate box at the origin.
    pub fn create(&self) -> BoundingBox {
        BoundingBox {
            axes: vec![(0.0, 0.0); self.dimension].into_boxed_slice(),
        }
    }

    /// Builds a box from `(lo, hi)` edges, rejecting inverted intervals
    /// and dimension mismatches.
    pub fn from_edges(&self, edges: &[(f64, f64)]) -> Result<BoundingBox> {
        if edges.len() != self.dimension {
            return Err(StoreError::InvalidArgument(format!(
                "{} edges for a {}-dimensional box",
                edges.len(),
                self.dimension
            )));
        }
        let mut b = self.create();
        for (axis, &(lo, hi)) in edges.iter().enumerate() {
            self.set_axis(&mut b, axis, lo, hi)?;
        }
        Ok(b)
    }

    pub fn copy(&self, b: &BoundingBox) -> BoundingBox {
        b.clone()
    }

    pub fn set_axis(&self, b: &mut BoundingBox, axis: usize, lo: f64, hi: f64) -> Result<()> {
        if axis >= self.dimension {
            return Err(StoreError::OutOfRange(format!(
                "axis {axis} of a {}-dimensional box",
                self.dimension
            )));
        }
        if lo > hi {
            return Err(StoreError::InvalidArgument(format!(
                "inverted interval ({lo}, {hi})"
            )));
        }
        b.axes[axis] = (lo, hi);
        Ok(())
    }

    pub fn get(&self, b: &BoundingBox, axis: usize) -> Result<(f64, f64)> {
        if axis >= self.dimension {
            return Err(StoreError::OutOfRange(format!(
                "axis {axis} of a {}-dimensional box",
                self.dimension
            )));
        }
        Ok(b.axes[axis])
    }

    pub fn equal(&self, a: &BoundingBox, b: &BoundingBox) -> bool {
        a.axes == b.axes
    }

    /// Product of the axis extents; zero for degenerate boxes.
    pub fn area(&self, b: &BoundingBox) -> f64 {
        b.axes.iter().map(|(lo, hi)| hi - lo).product()
    }

    /// Component-wise min/max cover of both boxes.
    pub fn union(&self, a: &BoundingBox, b: &BoundingBox) -> BoundingBox {
        let axes = a
            .axes
            .iter()
            .zip(b.axes.iter())
            .map(|(&(alo, ahi), &(blo, bhi))| (alo.min(blo), ahi.max(bhi)))
            .collect();
        BoundingBox { axes }
    }

    /// Component-wise max/min core of both boxes; axes may come out
    /// inverted when the boxes do not overlap.
    pub fn intersection(&self, a: &BoundingBox, b: &BoundingBox) -> BoundingBox {
        let axes = a
            .axes
            .iter()
            .zip(b.axes.iter())
            .map(|(&(alo, ahi), &(blo, bhi))| (alo.max(blo), ahi.min(bhi)))
            .collect();
        BoundingBox { axes }
    }

    /// Open-interval overlap: boxes that merely touch on an edge do not
    /// overlap.
    pub fn is_overlap(&self, a: &BoundingBox, b: &BoundingBox) -> bool {
        a.axes
            .iter()
            .zip(b.axes.iter())
            .all(|(&(alo, ahi), &(blo, bhi))| alo < bhi && blo < ahi)
    }

    /// Whether `outer` contains `inner`: `outer.lo <= inner.lo` and
    /// `inner.hi <= outer.hi` on every axis, closed on both edges.
    pub fn contains_range(&self, outer: &BoundingBox, inner: &BoundingBox) -> bool {
        outer
            .axes
            .iter()
            .zip(inner.axes.iter())
            .all(|(&(olo, ohi), &(ilo, ihi))| olo <= ilo && ihi <= ohi)
    }

    pub fn reset(&self, b: &mut BoundingBox, lo: f64, hi: f64) {
        for axis in b.axes.iter_mut() {
            *axis = (lo, hi);
        }
    }

    /// A box spanning `lo..hi` on every axis.
    pub fn universe(&self, lo: f64, hi: f64) -> BoundingBox {
        let mut b = self.create();
        self.reset(&mut b, lo, hi);
        b
    }
}

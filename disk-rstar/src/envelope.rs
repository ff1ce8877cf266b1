use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::rtree::{SpatialError, SpatialResult};

/// An n-dimensional axis-aligned bounding box used as the index key.
///
/// `Envelope` stores one lower and one upper bound per dimension. Values are
/// immutable once built: `union`, `intersection` and friends return new
/// envelopes. A distinguished empty envelope (lower = +inf, upper = -inf)
/// stands for "no bounds yet" and is the identity of `union`.
///
/// # Examples
///
/// ```rust
/// use disk_rstar::Envelope;
///
/// let a = Envelope::new(vec![0.0, 0.0], vec![10.0, 10.0]).unwrap();
/// let b = Envelope::new(vec![5.0, 5.0], vec![15.0, 15.0]).unwrap();
///
/// assert!(a.intersects(&b));
/// assert_eq!(a.union(&b).area(), 225.0);
/// ```
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Envelope {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Eq for Envelope {}

impl Hash for Envelope {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for value in self.lower.iter().chain(self.upper.iter()) {
            value.to_bits().hash(state);
        }
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "Envelope(empty, dim={})", self.dimension());
        }
        write!(f, "Envelope(")?;
        for (i, (lo, hi)) in self.lower.iter().zip(self.upper.iter()).enumerate() {
            if i > 0 {
                write!(f, " x ")?;
            }
            write!(f, "[{}, {}]", lo, hi)?;
        }
        write!(f, ")")
    }
}

impl Envelope {
    /// Creates a new envelope from per-dimension lower and upper bounds.
    ///
    /// # Arguments
    ///
    /// * `lower` - Minimum coordinate for each dimension
    /// * `upper` - Maximum coordinate for each dimension
    ///
    /// # Returns
    ///
    /// The envelope, or `InvalidEnvelope` when the dimension is zero, the two
    /// vectors differ in length, a bound is NaN, or `lower[i] > upper[i]`.
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> SpatialResult<Envelope> {
        if lower.is_empty() {
            return Err(SpatialError::InvalidEnvelope(
                "envelope must have at least one dimension".into(),
            ));
        }
        if lower.len() != upper.len() {
            return Err(SpatialError::InvalidEnvelope(format!(
                "lower has {} coordinates but upper has {}",
                lower.len(),
                upper.len()
            )));
        }
        for (i, (lo, hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if lo.is_nan() || hi.is_nan() {
                return Err(SpatialError::InvalidEnvelope(format!(
                    "NaN bound in dimension {}",
                    i
                )));
            }
            if lo > hi {
                return Err(SpatialError::InvalidEnvelope(format!(
                    "lower bound {} exceeds upper bound {} in dimension {}",
                    lo, hi, i
                )));
            }
        }
        Ok(Envelope { lower, upper })
    }

    /// Creates a degenerate envelope covering a single point.
    pub fn point(coords: Vec<f64>) -> SpatialResult<Envelope> {
        Envelope::new(coords.clone(), coords)
    }

    /// Creates a 2-D envelope from its corner coordinates.
    pub fn from_corners(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> SpatialResult<Envelope> {
        Envelope::new(vec![min_x, min_y], vec![max_x, max_y])
    }

    /// The "no bounds yet" envelope of the given dimension.
    pub fn empty(dimension: usize) -> Envelope {
        Envelope {
            lower: vec![f64::INFINITY; dimension],
            upper: vec![f64::NEG_INFINITY; dimension],
        }
    }

    pub fn dimension(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    pub fn is_empty(&self) -> bool {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .any(|(lo, hi)| lo > hi)
    }

    /// Component-wise min of lowers and max of uppers.
    pub fn union(&self, other: &Envelope) -> Envelope {
        let mut merged = self.clone();
        merged.expand(other);
        merged
    }

    /// Grows this envelope in place to cover `other`.
    pub(crate) fn expand(&mut self, other: &Envelope) {
        for i in 0..self.lower.len() {
            self.lower[i] = self.lower[i].min(other.lower[i]);
            self.upper[i] = self.upper[i].max(other.upper[i]);
        }
    }

    /// Closed-interval intersection test: boxes that only touch intersect.
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .zip(other.lower.iter().zip(other.upper.iter()))
            .all(|((lo, hi), (olo, ohi))| lo <= ohi && olo <= hi)
    }

    /// True when `other` lies entirely inside this envelope.
    pub fn contains(&self, other: &Envelope) -> bool {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .zip(other.lower.iter().zip(other.upper.iter()))
            .all(|((lo, hi), (olo, ohi))| lo <= olo && ohi <= hi)
    }

    /// The common region of both envelopes, or the empty envelope.
    pub fn intersection(&self, other: &Envelope) -> Envelope {
        if !self.intersects(other) {
            return Envelope::empty(self.dimension());
        }
        Envelope {
            lower: self
                .lower
                .iter()
                .zip(other.lower.iter())
                .map(|(a, b)| a.max(*b))
                .collect(),
            upper: self
                .upper
                .iter()
                .zip(other.upper.iter())
                .map(|(a, b)| a.min(*b))
                .collect(),
        }
    }

    /// Product of the per-dimension spans; 0 for degenerate and empty envelopes.
    pub fn area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.spans().product()
    }

    /// Sum of the per-dimension spans.
    pub fn margin(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.spans().sum()
    }

    /// Area added to this envelope by also covering `other`.
    pub fn enlargement(&self, other: &Envelope) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Area of the region shared with `other`.
    pub fn overlap(&self, other: &Envelope) -> f64 {
        self.intersection(other).area()
    }

    pub fn center(&self) -> Vec<f64> {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    /// Squared distance between the centers of two envelopes.
    pub fn center_distance_sq(&self, other: &Envelope) -> f64 {
        self.center()
            .iter()
            .zip(other.center().iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    /// Squared distance from a point to the nearest point of this envelope.
    /// Zero when the point is inside.
    pub fn min_distance_sq(&self, point: &[f64]) -> f64 {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .zip(point.iter())
            .map(|((lo, hi), p)| {
                let closest = p.clamp(*lo, *hi);
                (p - closest) * (p - closest)
            })
            .sum()
    }

    fn spans(&self) -> impl Iterator<Item = f64> + '_ {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .map(|(lo, hi)| hi - lo)
    }
}

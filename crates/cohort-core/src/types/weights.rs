//! Weight vectors used to break ties between peers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, totally ordered priority data.
///
/// Ordering is lexicographic over the components.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightVector(Vec<i64>);

impl WeightVector {
    pub fn new(weights: Vec<i64>) -> Self {
        Self(weights)
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<i64>> for WeightVector {
    fn from(weights: Vec<i64>) -> Self {
        Self(weights)
    }
}

impl fmt::Display for WeightVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Produces the local node's weight vector on demand
pub trait WeightGenerator: Send + Sync {
    fn generate(&self) -> WeightVector;
}

impl<F> WeightGenerator for F
where
    F: Fn() -> WeightVector + Send + Sync,
{
    fn generate(&self) -> WeightVector {
        self()
    }
}

/// Configured base weights followed by a random component drawn once per
/// incarnation, so two nodes with equal base weights still order strictly.
#[derive(Debug, Clone)]
pub struct DefaultWeightGenerator {
    base: Vec<i64>,
    tiebreak: i64,
}

impl DefaultWeightGenerator {
    pub fn new(base: Vec<i64>) -> Self {
        Self {
            base,
            tiebreak: rand::random::<i64>(),
        }
    }
}

impl WeightGenerator for DefaultWeightGenerator {
    fn generate(&self) -> WeightVector {
        let mut weights = self.base.clone();
        weights.push(self.tiebreak);
        WeightVector(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicographic_order() {
        let a = WeightVector::new(vec![1, 5, 0]);
        let b = WeightVector::new(vec![1, 4, 100]);
        let c = WeightVector::new(vec![2]);
        assert!(a > b);
        assert!(c > a);
        assert_eq!(a.clone().max(b.clone()), a);
    }

    #[test]
    fn test_default_generator_is_stable() {
        let generator = DefaultWeightGenerator::new(vec![10, 20]);
        let first = generator.generate();
        assert_eq!(first, generator.generate());
        assert_eq!(first.len(), 3);
        assert_eq!(&first.as_slice()[..2], &[10, 20]);
    }

    #[test]
    fn test_closure_generator() {
        let generator = || WeightVector::new(vec![7]);
        assert_eq!(generator.generate(), WeightVector::new(vec![7]));
    }
}

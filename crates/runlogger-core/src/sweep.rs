//! Parameter enumeration for grid sweeps and uniform sampling for random ones.

use rand::Rng;
use serde_json::Value;

use crate::models::{ParameterAssignment, SweepSpec};

// ---------------------------------------------------------------------------
// Grid enumeration
// ---------------------------------------------------------------------------

/// Direct-indexed view of the Cartesian product of a [`SweepSpec`].
///
/// Index `i` is decoded as a mixed-radix number whose last digit belongs to
/// the last parameter, so the first parameter varies slowest. Indices wrap
/// modulo the number of combinations; any index resolves in O(parameters).
#[derive(Debug, Clone, Copy)]
pub struct CombinationGenerator<'a> {
    spec: &'a SweepSpec,
}

impl<'a> CombinationGenerator<'a> {
    pub fn new(spec: &'a SweepSpec) -> Self {
        Self { spec }
    }

    /// Number of combinations in one cycle, or `None` if it overflows `u64`.
    pub fn total(&self) -> Option<u64> {
        total_combinations(self.spec)
    }

    pub fn combination_at(&self, index: u64) -> ParameterAssignment {
        combination_at(self.spec, index)
    }

    /// Iterate over one full cycle in canonical order.
    pub fn iter(&self) -> Combinations<'a> {
        Combinations {
            spec: self.spec,
            next: 0,
            end: self.total(),
        }
    }
}

/// `c1 * c2 * ... * cn`, or `None` on overflow.
pub fn total_combinations(spec: &SweepSpec) -> Option<u64> {
    spec.params()
        .iter()
        .try_fold(1u64, |acc, p| acc.checked_mul(p.choices.len() as u64))
}

/// The assignment at position `index mod T` of the canonical enumeration.
///
/// The caller guarantees every candidate list is non-empty
/// (see [`SweepSpec::validate`]).
pub fn combination_at(spec: &SweepSpec, index: u64) -> ParameterAssignment {
    let params = spec.params();
    let mut digits = vec![0usize; params.len()];
    let mut remainder = index;
    for (slot, param) in digits.iter_mut().zip(params).rev() {
        let radix = param.choices.len() as u64;
        *slot = (remainder % radix) as usize;
        remainder /= radix;
    }

    params
        .iter()
        .zip(digits)
        .map(|(param, digit)| (param.key.clone(), param.choices[digit].clone()))
        .collect()
}

/// Iterator over one cycle of a grid.
#[derive(Debug, Clone)]
pub struct Combinations<'a> {
    spec: &'a SweepSpec,
    next: u64,
    end: Option<u64>,
}

impl Iterator for Combinations<'_> {
    type Item = ParameterAssignment;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end.is_some_and(|end| self.next >= end) {
            return None;
        }
        let combo = combination_at(self.spec, self.next);
        self.next = self.next.checked_add(1)?;
        Some(combo)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.end {
            Some(end) => {
                let left = usize::try_from(end - self.next).ok();
                (left.unwrap_or(usize::MAX), left)
            }
            None => (usize::MAX, None),
        }
    }
}

// ---------------------------------------------------------------------------
// Random sampling
// ---------------------------------------------------------------------------

/// Independent uniform choice per parameter.
///
/// Workers do not coordinate, so two runs may draw the same assignment.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSampler;

impl RandomSampler {
    /// Draw one candidate per parameter.
    ///
    /// The caller guarantees every candidate list is non-empty
    /// (see [`SweepSpec::validate`]); an empty list panics.
    pub fn sample<R: Rng + ?Sized>(&self, spec: &SweepSpec, rng: &mut R) -> ParameterAssignment {
        spec.params()
            .iter()
            .map(|param| {
                let idx = rng.random_range(0..param.choices.len());
                (param.key.clone(), param.choices[idx].clone())
            })
            .collect()
    }
}

/// Render an assignment as `key=value` pairs, for logs and the CLI.
pub fn describe(assignment: &ParameterAssignment) -> String {
    assignment
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

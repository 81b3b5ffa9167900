//! Turning a run's sweep state into concrete parameter values.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::error::Result;
use crate::models::{ParameterAssignment, SweepState};
use crate::sweep::{combination_at, describe, RandomSampler};

/// Picks the parameters for a run that joined a sweep.
///
/// Grid sweeps map the index the backend handed out to its combination;
/// random sweeps draw every parameter independently. No coordination
/// happens here: uniqueness of grid assignments rests entirely on the
/// backend's atomic increment.
#[derive(Debug)]
pub struct SweepAssigner {
    rng: StdRng,
    sampler: RandomSampler,
}

impl SweepAssigner {
    /// Seeded assigners draw the same random assignments every time.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng,
            sampler: RandomSampler,
        }
    }

    pub fn assign(&mut self, state: &SweepState) -> Result<ParameterAssignment> {
        state.spec.validate()?;
        let assignment = match state.grid_index {
            Some(index) => combination_at(&state.spec, index),
            None => self.sampler.sample(&state.spec, &mut self.rng),
        };
        debug!(
            grid_index = ?state.grid_index,
            params = %describe(&assignment),
            "assigned parameters"
        );
        Ok(assignment)
    }
}

impl Default for SweepAssigner {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::error::RunLoggerError;
    use crate::models::{SweepMethod, SweepSpec};
    use serde_json::json;
    use std::collections::HashSet;
    use std::thread;

    fn spec() -> SweepSpec {
        SweepSpec::new()
            .with_choice("lr", vec![json!(0.1), json!(0.01)])
            .with_choice("batch", vec![json!(32), json!(64)])
    }

    #[test]
    fn grid_index_selects_combination() {
        let mut assigner = SweepAssigner::new(Some(0));
        let state = SweepState {
            spec: spec(),
            grid_index: Some(2),
        };
        let assignment = assigner.assign(&state).unwrap();
        assert_eq!(assignment["lr"], json!(0.01));
        assert_eq!(assignment["batch"], json!(32));
    }

    #[test]
    fn seeded_random_assignment_is_reproducible() {
        let state = SweepState {
            spec: spec(),
            grid_index: None,
        };
        let first: Vec<_> = {
            let mut a = SweepAssigner::new(Some(11));
            (0..10).map(|_| a.assign(&state).unwrap()).collect()
        };
        let second: Vec<_> = {
            let mut a = SweepAssigner::new(Some(11));
            (0..10).map(|_| a.assign(&state).unwrap()).collect()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_state_is_rejected() {
        let mut assigner = SweepAssigner::default();
        let state = SweepState {
            spec: SweepSpec::new().with_choice("lr", vec![]),
            grid_index: Some(0),
        };
        assert!(matches!(
            assigner.assign(&state),
            Err(RunLoggerError::InvalidSweepState(_))
        ));
    }

    #[test]
    fn concurrent_workers_cover_the_grid_exactly_once() {
        let mut backend = MemoryBackend::new();
        let sweep_id = backend
            .insert_sweep(SweepMethod::Grid, &json!({}), &spec(), &[])
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mut worker = backend.clone();
                thread::spawn(move || {
                    let run = worker.insert_run(&json!({}), &[], Some(sweep_id)).unwrap();
                    let state = run.sweep.unwrap();
                    let index = state.grid_index.unwrap();
                    let assignment = SweepAssigner::default().assign(&state).unwrap();
                    (index, serde_json::to_string(&assignment).unwrap())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let indices: HashSet<u64> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, (0..4).collect());
        let assignments: HashSet<&String> = results.iter().map(|(_, a)| a).collect();
        assert_eq!(assignments.len(), 4);
    }
}

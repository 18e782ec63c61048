//! Train/test partition of the cohort.
//!
//! The draw is per patient, never per row: assignments are made over the
//! deduplicated cohort table and broadcast back to observation rows by
//! patient id, so a patient with many observation rows still gets exactly
//! one split.

use crate::{Cohort, Observations, PatientId, Result};
use qu::ick_use::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
};

/// Marginal probability that a patient lands in the training split.
pub const TRAIN_FRACTION: f64 = 0.8;
/// Seed used by the pipeline binaries unless overridden.
pub const DEFAULT_SEED: u64 = 2021;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Split::Train => f.write_str("train"),
            Split::Test => f.write_str("test"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AssignmentRow {
    patient_num: PatientId,
    split: Split,
}

/// The per-patient train/test assignment.
pub struct SplitAssignments {
    els: BTreeMap<PatientId, Split>,
}

impl SplitAssignments {
    /// Draw one assignment per cohort patient.
    ///
    /// The cohort is visited in its sorted-by-id order, so the result is
    /// bit-reproducible for a fixed seed whatever order the underlying
    /// observation rows arrived in.
    pub fn draw(cohort: &Cohort, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let els = cohort
            .iter()
            .map(|patient| {
                let split = if rng.gen::<f64>() < TRAIN_FRACTION {
                    Split::Train
                } else {
                    Split::Test
                };
                (patient.patient_num, split)
            })
            .collect();
        SplitAssignments { els }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let rows: Vec<AssignmentRow> = crate::load(path)?;
        Ok(SplitAssignments {
            els: rows
                .into_iter()
                .map(|row| (row.patient_num, row.split))
                .collect(),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        let rows: Vec<AssignmentRow> = self
            .els
            .iter()
            .map(|(patient_num, split)| AssignmentRow {
                patient_num: *patient_num,
                split: *split,
            })
            .collect();
        crate::save(&rows, path)
    }

    pub fn get(&self, id: PatientId) -> Option<Split> {
        self.els.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.els.len()
    }

    pub fn is_empty(&self) -> bool {
        self.els.is_empty()
    }

    pub fn patients_in(&self, split: Split) -> BTreeSet<PatientId> {
        self.els
            .iter()
            .filter(|(_, s)| **s == split)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn count_splits(&self) -> BTreeMap<Split, usize> {
        // B Tree so we get a predictable ordering.
        let mut map = BTreeMap::new();
        map.insert(Split::Train, 0);
        map.insert(Split::Test, 0);
        for split in self.els.values() {
            *map.entry(*split).or_insert(0) += 1;
        }
        map
    }

    /// Broadcast the assignment back to observation rows, producing the
    /// (train, test) row-level tables. Rows for patients without an
    /// assignment are dropped with a warning.
    pub fn partition(&self, observations: &Observations) -> (Observations, Observations) {
        let mut warned = BTreeSet::new();
        for id in observations.patient_ids() {
            if self.get(id).is_none() && warned.insert(id) {
                event!(Level::WARN, "patient {} has no split assignment", id);
            }
        }
        let train = observations.filter(|obs| self.get(obs.patient_num) == Some(Split::Train));
        let test = observations.filter(|obs| self.get(obs.patient_num) == Some(Split::Test));
        (train, test)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CodeSystem, Observation};

    fn obs(patient_num: PatientId, days: i32) -> Observation {
        Observation {
            patient_num,
            code_system: CodeSystem::Icd10,
            concept_code: "U09.9".into(),
            days_since_admission: days,
            cohort: "PosAdm2020Q1".into(),
        }
    }

    fn cohort_of(n: u64) -> Cohort {
        let observations: Observations = (1..=n).map(|id| obs(id, 100)).collect();
        Cohort::from_observations(&observations)
    }

    #[test]
    fn split_is_a_partition() {
        let cohort = cohort_of(200);
        let assignments = SplitAssignments::draw(&cohort, DEFAULT_SEED);
        let train = assignments.patients_in(Split::Train);
        let test = assignments.patients_in(Split::Test);
        assert!(train.is_disjoint(&test));
        assert_eq!(train.len() + test.len(), 200);
        for patient in cohort.iter() {
            assert!(assignments.get(patient.patient_num).is_some());
        }
        // with 200 draws at 0.8 the training side should dominate
        assert!(train.len() > test.len());
    }

    #[test]
    fn split_is_reproducible() {
        let cohort = cohort_of(100);
        let a = SplitAssignments::draw(&cohort, 42);
        let b = SplitAssignments::draw(&cohort, 42);
        for patient in cohort.iter() {
            assert_eq!(a.get(patient.patient_num), b.get(patient.patient_num));
        }
        // a different seed should give a different assignment somewhere
        let c = SplitAssignments::draw(&cohort, 43);
        assert!(cohort
            .iter()
            .any(|p| a.get(p.patient_num) != c.get(p.patient_num)));
    }

    #[test]
    fn assignment_ignores_row_order() {
        // same patients, shuffled row order and different row counts
        let forward: Observations = (1..=50).flat_map(|id| [obs(id, 10), obs(id, 120)]).collect();
        let backward: Observations = (1..=50).rev().map(|id| obs(id, 50)).collect();
        let a = SplitAssignments::draw(&Cohort::from_observations(&forward), 7);
        let b = SplitAssignments::draw(&Cohort::from_observations(&backward), 7);
        for id in 1..=50 {
            assert_eq!(a.get(id), b.get(id));
        }
    }

    #[test]
    fn partition_is_by_patient_not_row() {
        let observations: Observations = (1..=30)
            .flat_map(|id| [obs(id, 10), obs(id, 120), obs(id, 200)])
            .collect();
        let cohort = Cohort::from_observations(&observations);
        let assignments = SplitAssignments::draw(&cohort, DEFAULT_SEED);
        let (train, test) = assignments.partition(&observations);
        assert_eq!(train.len() + test.len(), observations.len());
        assert!(train.patient_ids().is_disjoint(&test.patient_ids()));
        // every row of a patient lands in the same split
        for id in train.patient_ids() {
            assert_eq!(assignments.get(id), Some(Split::Train));
        }
        for id in test.patient_ids() {
            assert_eq!(assignments.get(id), Some(Split::Test));
        }
    }
}

//! Onset timing of phenotypes relative to the index admission.
//!
//! "New onset" means a patient's *first* occurrence of a rolled phenotype
//! category falls at or after the threshold. The minimum is taken over every
//! occurrence, including those before the threshold, so a patient whose
//! category first appears on day 30 is not new-onset for that category even
//! if they have another occurrence on day 120.

use crate::{
    phecodes::{PheCode, RolledPheCode},
    ArcStr, PatientId, Result,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    ops::Deref,
    path::Path,
};

/// Day offset from the index admission at which a phenotype occurrence
/// counts as post-acute.
pub const NEW_ONSET_THRESHOLD_DAYS: i32 = 90;

/// An observation row joined to one phenotype reference entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhenotypeRecord {
    pub patient_num: PatientId,
    pub days_since_admission: i32,
    pub phecode: PheCode,
    pub rolled: RolledPheCode,
    pub phenotype: ArcStr,
    pub rolled_phenotype: ArcStr,
    pub group: ArcStr,
}

/// The result of a phenotype join, one record per (observation, matching
/// reference entry) pair.
pub struct PhenotypeRecords {
    els: Vec<PhenotypeRecord>,
}

impl PhenotypeRecords {
    pub(crate) fn new(els: Vec<PhenotypeRecord>) -> Self {
        PhenotypeRecords { els }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(crate::load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        crate::save(&self.els, path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhenotypeRecord> + '_ {
        self.els.iter()
    }

    /// Records at or after `threshold` days since admission, without any
    /// deduplication.
    pub fn after_threshold(&self, threshold: i32) -> Self {
        Self::new(
            self.els
                .iter()
                .filter(|rec| rec.days_since_admission >= threshold)
                .cloned()
                .collect(),
        )
    }

    /// Keep, for each (patient, rolled category) group, only the record(s)
    /// with the minimum `days_since_admission`. Tied records all survive.
    pub fn first_occurrences(&self) -> Self {
        let mut mins: HashMap<(PatientId, RolledPheCode), i32> = HashMap::new();
        for rec in self.els.iter() {
            let entry = mins
                .entry((rec.patient_num, rec.rolled))
                .or_insert(rec.days_since_admission);
            if rec.days_since_admission < *entry {
                *entry = rec.days_since_admission;
            }
        }
        Self::new(
            self.els
                .iter()
                .filter(|rec| mins[&(rec.patient_num, rec.rolled)] == rec.days_since_admission)
                .cloned()
                .collect(),
        )
    }

    /// New-onset records: the first occurrence per (patient, rolled category)
    /// where that first occurrence is itself at or after the threshold.
    ///
    /// The order matters: the minimum is computed over all occurrences and
    /// the threshold is applied afterwards.
    pub fn new_onset(&self, threshold: i32) -> Self {
        self.first_occurrences().after_threshold(threshold)
    }

    pub fn patient_ids(&self) -> BTreeSet<PatientId> {
        self.els.iter().map(|rec| rec.patient_num).collect()
    }
}

impl Deref for PhenotypeRecords {
    type Target = [PhenotypeRecord];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl FromIterator<PhenotypeRecord> for PhenotypeRecords {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = PhenotypeRecord>,
    {
        Self::new(iter.into_iter().collect())
    }
}

/// Which column of a [`PhenotypeRecord`] becomes the feature/label dimension
/// for vectorization and frequency aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimension {
    /// The fine-grained phenotype label.
    Phenotype,
    /// The phecode itself.
    PheCode,
    /// The representative label of the rolled category.
    RolledPhenotype,
}

impl Dimension {
    pub fn value(self, rec: &PhenotypeRecord) -> ArcStr {
        match self {
            Dimension::Phenotype => rec.phenotype.clone(),
            Dimension::PheCode => rec.phecode.as_arc(),
            Dimension::RolledPhenotype => rec.rolled_phenotype.clone(),
        }
    }
}

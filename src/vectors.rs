//! One-hot patient feature matrices for the downstream clustering step.

use crate::{
    onset::{Dimension, PhenotypeRecords},
    report::FrequencyTable,
    AdmissionStatus, ArcStr, Cohort, Context, PatientId, Result,
};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::Path,
};

/// One patient's row: identifier and status first, then one binary value per
/// feature column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub patient_num: PatientId,
    pub status: AdmissionStatus,
    pub values: Vec<u8>,
}

/// A wide binary patient-by-phenotype matrix.
///
/// The feature columns are the distinct values observed in the source table
/// the matrix was built from, so column sets differ between matrices. The
/// row set is the source table's patient set: a patient with no qualifying
/// record anywhere in the source never appears, rather than appearing as an
/// all-zero row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub name: ArcStr,
    pub features: Vec<ArcStr>,
    pub rows: Vec<FeatureVector>,
}

impl FeatureMatrix {
    /// Pivot a phenotype record table into a one-hot matrix over the chosen
    /// feature dimension, joining each patient's admission status from the
    /// cohort.
    pub fn from_records(
        name: impl Into<ArcStr>,
        records: &PhenotypeRecords,
        dim: Dimension,
        cohort: &Cohort,
    ) -> Result<Self> {
        let mut features: BTreeSet<ArcStr> = BTreeSet::new();
        let mut per_patient: BTreeMap<PatientId, BTreeSet<ArcStr>> = BTreeMap::new();
        for rec in records.iter() {
            let value = dim.value(rec);
            features.insert(value.clone());
            per_patient.entry(rec.patient_num).or_default().insert(value);
        }
        let features: Vec<ArcStr> = features.into_iter().collect();
        let rows = per_patient
            .into_iter()
            .map(|(patient_num, present)| {
                let status = cohort.status_of(patient_num).with_context(|| {
                    format!("patient {} is missing from the cohort table", patient_num)
                })?;
                let values = features
                    .iter()
                    .map(|f| u8::from(present.contains(f)))
                    .collect();
                Ok(FeatureVector {
                    patient_num,
                    status,
                    values,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FeatureMatrix {
            name: name.into(),
            features,
            rows,
        })
    }

    pub fn patient_ids(&self) -> BTreeSet<PatientId> {
        self.rows.iter().map(|row| row.patient_num).collect()
    }
}

/// The named feature matrices produced by one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorBundle {
    pub matrices: Vec<FeatureMatrix>,
}

/// The named frequency tables produced by one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyBundle {
    pub tables: Vec<FrequencyTable>,
}

impl VectorBundle {
    pub fn new(matrices: Vec<FeatureMatrix>) -> Self {
        VectorBundle { matrices }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(crate::load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        crate::save(&self.matrices, path)
    }

    /// JSON copy for the (non-Rust) clustering consumer.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result {
        save_json(&self.matrices, path.as_ref())
    }
}

impl FrequencyBundle {
    pub fn new(tables: Vec<FrequencyTable>) -> Self {
        FrequencyBundle { tables }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(crate::load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        crate::save(&self.tables, path)
    }

    /// JSON copy for the (non-Rust) clustering consumer.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result {
        save_json(&self.tables, path.as_ref())
    }
}

fn save_json<T: Serialize>(contents: &[T], path: &Path) -> Result {
    fn inner<T: Serialize>(contents: &[T], path: &Path) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        if crate::path_exists(path)? {
            event!(Level::WARN, "overwriting existing file at \"{}\"", path.display());
        }
        let out = io::BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer(out, contents)?;
        Ok(())
    }
    let path = crate::output_path(path);
    crate::check_extension(&path, "json")?;
    inner(contents, &path)
        .with_context(|| format!("unable to save data to \"{}\"", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        onset::PhenotypeRecord,
        phecodes::PheCode,
        CodeSystem, Observation, Observations,
    };

    fn rec(patient_num: u64, phecode: &str, phenotype: &str, days: i32) -> PhenotypeRecord {
        let phecode = PheCode::from_str(phecode).unwrap();
        let rolled = phecode.rolled();
        PhenotypeRecord {
            patient_num,
            days_since_admission: days,
            phecode,
            rolled,
            phenotype: phenotype.into(),
            rolled_phenotype: phenotype.into(),
            group: "neurological".into(),
        }
    }

    fn cohort(labels: &[(u64, &str)]) -> Cohort {
        let observations: Observations = labels
            .iter()
            .map(|(id, label)| Observation {
                patient_num: *id,
                code_system: CodeSystem::Icd10,
                concept_code: "U09.9".into(),
                days_since_admission: 0,
                cohort: (*label).into(),
            })
            .collect();
        Cohort::from_observations(&observations)
    }

    #[test]
    fn values_are_binary_and_columns_come_from_the_source() {
        let cohort = cohort(&[(1, "PosAdm"), (2, "PosNotAdm")]);
        let records = PhenotypeRecords::new(vec![
            rec(1, "290.11", "Dementias", 100),
            rec(1, "290.11", "Dementias", 150),
            rec(1, "296.22", "Depression", 120),
            rec(2, "290.11", "Dementias", 95),
        ]);
        let matrix =
            FeatureMatrix::from_records("test", &records, Dimension::Phenotype, &cohort).unwrap();
        assert_eq!(
            matrix.features,
            vec![ArcStr::from("Dementias"), ArcStr::from("Depression")]
        );
        for row in &matrix.rows {
            assert!(row.values.iter().all(|v| *v == 0 || *v == 1));
        }
        // duplicate records still give a 1, not a count
        assert_eq!(matrix.rows[0].patient_num, 1);
        assert_eq!(matrix.rows[0].values, vec![1, 1]);
        assert_eq!(matrix.rows[1].patient_num, 2);
        assert_eq!(matrix.rows[1].values, vec![1, 0]);
        assert_eq!(matrix.rows[1].status, AdmissionStatus::NotAdmitted);
    }

    #[test]
    fn row_set_equals_source_patient_set() {
        // patient 3 is in the cohort but has no record in the source table,
        // so they get no row at all
        let cohort = cohort(&[(1, "PosAdm"), (2, "PosAdm"), (3, "PosAdm")]);
        let records = PhenotypeRecords::new(vec![
            rec(1, "290.11", "Dementias", 100),
            rec(2, "296.22", "Depression", 95),
        ]);
        let matrix =
            FeatureMatrix::from_records("test", &records, Dimension::Phenotype, &cohort).unwrap();
        assert_eq!(matrix.patient_ids(), records.patient_ids());
        assert_eq!(matrix.rows.len(), 2);
        // each source patient appears exactly once, with at least one 1
        for row in &matrix.rows {
            assert!(row.values.iter().any(|v| *v == 1));
        }
    }

    #[test]
    fn dimension_changes_the_columns() {
        let cohort = cohort(&[(1, "PosAdm")]);
        let mut a = rec(1, "290.11", "Dementias", 100);
        let mut b = rec(1, "290.2", "Delirium", 100);
        // both phecodes roll to category 290, whose representative label is
        // that of the first member
        a.rolled_phenotype = "Dementias".into();
        b.rolled_phenotype = "Dementias".into();
        let records = PhenotypeRecords::new(vec![a, b]);
        let by_code =
            FeatureMatrix::from_records("codes", &records, Dimension::PheCode, &cohort).unwrap();
        assert_eq!(
            by_code.features,
            vec![ArcStr::from("290.11"), ArcStr::from("290.2")]
        );
        let by_rolled =
            FeatureMatrix::from_records("rolled", &records, Dimension::RolledPhenotype, &cohort)
                .unwrap();
        assert_eq!(by_rolled.features, vec![ArcStr::from("Dementias")]);
    }

    #[test]
    fn save_json_replaces_an_existing_file() {
        let bundle = FrequencyBundle::new(Vec::new());
        let name = "test_frequency_bundle.json";
        bundle.save_json(name).unwrap();
        // the second save warns and replaces, rather than failing or
        // appending
        bundle.save_json(name).unwrap();
        let path = crate::output_path(Path::new(name));
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "[]");
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_cohort_patient_is_an_error() {
        let cohort = cohort(&[(1, "PosAdm")]);
        let records = PhenotypeRecords::new(vec![rec(9, "290.11", "Dementias", 100)]);
        assert!(
            FeatureMatrix::from_records("test", &records, Dimension::Phenotype, &cohort).is_err()
        );
    }
}

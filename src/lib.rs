pub mod onset;
pub mod phecodes;
pub mod report;
pub mod split;
mod util;
pub mod vectors;

pub use anyhow::{Context, Error};
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs, io,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

pub use crate::util::{header, path_exists};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
pub type PatientId = u64;

/// Cohort labels for COVID-positive patients all contain this marker
/// (e.g. "PosAdm2020Q1", "PosNotAdm2020Q2"). Matching is case-sensitive.
pub const COVID_POSITIVE_MARKER: &str = "Pos";
/// Cohort labels for patients who were never admitted contain this marker.
pub const NOT_ADMITTED_MARKER: &str = "NotAdm";
/// Recognized cohort labels all carry an admission marker; labels without
/// one fall back to `Admitted` with a warning.
pub const ADMITTED_MARKER: &str = "Adm";

/// The code system a diagnosis code belongs to.
///
/// Only ICD-9 and ICD-10 rows take part in the analysis; observation rows
/// tagged with anything else (labs, procedures, demographics) are dropped
/// when the raw extract is imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CodeSystem {
    #[serde(rename = "DIAG-ICD9")]
    Icd9,
    #[serde(rename = "DIAG-ICD10")]
    Icd10,
}

impl CodeSystem {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "DIAG-ICD9" => Some(CodeSystem::Icd9),
            "DIAG-ICD10" => Some(CodeSystem::Icd10),
            _ => None,
        }
    }
}

impl fmt::Display for CodeSystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodeSystem::Icd9 => f.write_str("ICD-9"),
            CodeSystem::Icd10 => f.write_str("ICD-10"),
        }
    }
}

/// Whether a patient was admitted to hospital during their acute infection.
///
/// Derived from the raw cohort label: labels containing [`NOT_ADMITTED_MARKER`]
/// map to `NotAdmitted`, everything else maps to `Admitted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AdmissionStatus {
    Admitted,
    NotAdmitted,
}

impl AdmissionStatus {
    pub fn from_cohort_label(label: &str) -> Self {
        if label.contains(NOT_ADMITTED_MARKER) {
            AdmissionStatus::NotAdmitted
        } else {
            AdmissionStatus::Admitted
        }
    }
}

impl fmt::Display for AdmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AdmissionStatus::Admitted => f.write_str("Admitted"),
            AdmissionStatus::NotAdmitted => f.write_str("Not Admitted"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ObservationRaw {
    patient_num: PatientId,
    concept_type: ArcStr,
    concept_code: ArcStr,
    days_since_admission: i32,
    cohort: ArcStr,
}

/// A row in the observations dataset: one diagnosis code recorded for one
/// patient at a signed day offset from their index admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub patient_num: PatientId,
    pub code_system: CodeSystem,
    pub concept_code: ArcStr,
    pub days_since_admission: i32,
    pub cohort: ArcStr,
}

impl Observation {
    fn from_raw(raw: ObservationRaw) -> Option<Self> {
        let code_system = CodeSystem::from_tag(&raw.concept_type)?;
        Some(Observation {
            patient_num: raw.patient_num,
            code_system,
            concept_code: raw.concept_code,
            days_since_admission: raw.days_since_admission,
            cohort: raw.cohort,
        })
    }

    pub fn status(&self) -> AdmissionStatus {
        AdmissionStatus::from_cohort_label(&self.cohort)
    }
}

/// The parsed list of observations, with a pre-built index for the
/// `patient_num` field.
pub struct Observations {
    els: Arc<Vec<Observation>>,
    id_idx: BTreeMap<PatientId, Vec<usize>>,
}

impl Observations {
    /// Load the raw CSV extract, keeping only ICD-9/ICD-10 diagnosis rows.
    pub fn load_orig(path: impl AsRef<Path>) -> Result<Self> {
        let els: Vec<ObservationRaw> = load_orig(path)?;
        let before = els.len();
        let els: Vec<Observation> = els.into_iter().filter_map(Observation::from_raw).collect();
        event!(
            Level::INFO,
            "kept {} of {} observation rows (ICD-9/ICD-10 diagnoses)",
            els.len(),
            before
        );
        Ok(Self::new(els))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        save(&self.els, path)
    }

    pub fn iter(&self) -> impl Iterator<Item = Observation> + '_ {
        self.els.iter().cloned()
    }

    /// Get an `Observations` object containing only rows that match the filter.
    pub fn filter(&self, f: impl Fn(&Observation) -> bool) -> Self {
        Observations::new(self.iter().filter(f).collect())
    }

    pub fn retain(&mut self, f: impl Fn(&Observation) -> bool) {
        Arc::make_mut(&mut self.els).retain(f);
        self.rebuild_id_map();
    }

    /// Only rows for COVID-positive patients.
    pub fn filter_positive(&self) -> Self {
        self.filter(|obs| obs.cohort.contains(COVID_POSITIVE_MARKER))
    }

    pub fn observations_for_patient(
        &self,
        patient_num: PatientId,
    ) -> impl Iterator<Item = &Observation> + '_ {
        self.id_idx
            .get(&patient_num)
            .into_iter()
            .flatten()
            .map(|idx| &self.els[*idx])
    }

    /// The distinct patients in this table, in ascending id order.
    pub fn patient_ids(&self) -> BTreeSet<PatientId> {
        self.id_idx.keys().copied().collect()
    }

    pub fn count_code_systems(&self) -> BTreeMap<CodeSystem, usize> {
        // B Tree so we get a predictable ordering.
        let mut map = BTreeMap::new();
        map.insert(CodeSystem::Icd9, 0);
        map.insert(CodeSystem::Icd10, 0);
        for el in self.els.iter() {
            *map.entry(el.code_system).or_insert(0) += 1;
        }
        map
    }

    fn new(els: Vec<Observation>) -> Self {
        let mut this = Observations {
            els: Arc::new(els),
            id_idx: BTreeMap::new(),
        };
        this.rebuild_id_map();
        this
    }

    fn rebuild_id_map(&mut self) {
        self.id_idx.clear();
        for (idx, obs) in self.els.iter().enumerate() {
            self.id_idx
                .entry(obs.patient_num)
                .or_insert_with(Vec::new)
                .push(idx);
        }
    }
}

impl Deref for Observations {
    type Target = [Observation];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl<'a> IntoIterator for &'a Observations {
    type IntoIter = <&'a [Observation] as IntoIterator>::IntoIter;
    type Item = &'a Observation;
    fn into_iter(self) -> Self::IntoIter {
        self.els.iter()
    }
}

impl FromIterator<Observation> for Observations {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Observation>,
    {
        Self::new(iter.into_iter().collect())
    }
}

/// One record per distinct patient in the analysis cohort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortPatient {
    pub patient_num: PatientId,
    pub status: AdmissionStatus,
}

/// The parsed cohort, one entry per patient, sorted by `patient_num`, with a
/// pre-built index for the `patient_num` field.
pub struct Cohort {
    els: Vec<CohortPatient>,
    id_idx: BTreeMap<PatientId, usize>,
}

impl Cohort {
    /// Derive the patient-level cohort from (already positive-filtered)
    /// observation rows.
    ///
    /// The status is derived from the first row seen for each patient.
    /// Labels that carry neither admission marker fall back to `Admitted`,
    /// with a warning once per distinct label.
    pub fn from_observations(observations: &Observations) -> Self {
        let mut statuses: BTreeMap<PatientId, AdmissionStatus> = BTreeMap::new();
        let mut warned: BTreeSet<ArcStr> = BTreeSet::new();
        for obs in observations.iter() {
            if !obs.cohort.contains(ADMITTED_MARKER) && warned.insert(obs.cohort.clone()) {
                event!(
                    Level::WARN,
                    "cohort label \"{}\" carries no admission marker, assuming admitted",
                    obs.cohort
                );
            }
            statuses
                .entry(obs.patient_num)
                .or_insert_with(|| obs.status());
        }
        Self::new(
            statuses
                .into_iter()
                .map(|(patient_num, status)| CohortPatient {
                    patient_num,
                    status,
                })
                .collect(),
        )
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        save(&self.els, path)
    }

    pub fn find_by_id(&self, id: PatientId) -> Option<&CohortPatient> {
        let idx = self.id_idx.get(&id)?;
        self.els.get(*idx)
    }

    pub fn status_of(&self, id: PatientId) -> Option<AdmissionStatus> {
        self.find_by_id(id).map(|p| p.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CohortPatient> + '_ {
        self.els.iter()
    }

    pub fn count_statuses(&self) -> BTreeMap<AdmissionStatus, usize> {
        // B Tree so we get a predictable ordering.
        let mut map = BTreeMap::new();
        // Manually insert to make sure all categories are included.
        map.insert(AdmissionStatus::Admitted, 0);
        map.insert(AdmissionStatus::NotAdmitted, 0);
        for el in self.els.iter() {
            *map.entry(el.status).or_insert(0) += 1;
        }
        map
    }

    /// Status breakdown with percentages, for the summary binaries.
    ///
    /// Errors on an empty cohort rather than printing NaN percentages.
    pub fn term_table(&self) -> Result<comfy_table::Table> {
        ensure!(!self.els.is_empty(), "cohort table is empty");
        let mut table = comfy_table::Table::new();
        table.set_header(vec!["Status", "Patients", "Percentage"]);
        for (status, count) in self.count_statuses() {
            table.add_row(vec![
                status.to_string(),
                count.to_string(),
                format!("{:.1}%", count as f64 / self.els.len() as f64 * 100.),
            ]);
        }
        Ok(table)
    }

    /// Sorted-by-id order: the splitter contract depends on this.
    fn new(mut els: Vec<CohortPatient>) -> Self {
        els.sort_by_key(|el| el.patient_num);
        let id_idx = els
            .iter()
            .enumerate()
            .map(|(idx, el)| (el.patient_num, idx))
            .collect();
        Cohort { els, id_idx }
    }
}

impl Deref for Cohort {
    type Target = [CohortPatient];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

/// Load data into memory.
pub(crate) fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    fn inner<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let path = output_path(path);
        let reader = io::BufReader::new(fs::File::open(path)?);
        bincode::deserialize_from(reader).map_err(Into::into)
    }
    let path = path.as_ref();
    check_extension(path, "bin")?;

    inner(path).with_context(|| format!("unable to load data from \"{}\"", path.display()))
}

/// Save data to disk.
pub(crate) fn save<T: Serialize>(contents: &[T], path: impl AsRef<Path>) -> Result {
    fn inner<T: Serialize>(contents: &[T], path: &Path) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        if util::path_exists(path)? {
            event!(
                Level::WARN,
                "overwriting existing file at \"{}\"",
                path.display()
            );
        }
        let mut out = io::BufWriter::new(fs::File::create(path)?);
        bincode::serialize_into(&mut out, contents)?;
        Ok(())
    }
    let path = path.as_ref();
    let path = output_path(path);
    check_extension(&path, "bin")?;

    inner(contents, &path).with_context(|| format!("unable to save data to \"{}\"", path.display()))
}

/// Load data into memory from the original extract.
pub(crate) fn load_orig<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let path = orig_path(path);
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(&path)?
        .into_deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("while loading \"{}\"", path.display()))
}

/// Note: No protection from escaping the root directory.
pub fn orig_path(input: &Path) -> PathBuf {
    Path::new("data/extract").join(input)
}

/// Note: No protection from escaping the root directory.
pub fn output_path(input: &Path) -> PathBuf {
    Path::new("data/output").join(input)
}

pub fn check_extension(path: &Path, ext: &str) -> Result<()> {
    ensure!(
        matches!(path.extension(), Some(p) if p == ext),
        "filename should end with `.{}`",
        ext
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    pub(crate) fn obs(
        patient_num: PatientId,
        concept_type: &str,
        code: &str,
        days: i32,
        cohort: &str,
    ) -> Option<Observation> {
        Observation::from_raw(ObservationRaw {
            patient_num,
            concept_type: concept_type.into(),
            concept_code: code.into(),
            days_since_admission: days,
            cohort: cohort.into(),
        })
    }

    #[test]
    fn non_icd_rows_dropped() {
        assert!(obs(1, "DIAG-ICD9", "290.1", 10, "PosAdm").is_some());
        assert!(obs(1, "DIAG-ICD10", "F32.9", 10, "PosAdm").is_some());
        assert!(obs(1, "LAB-LOINC", "1234-5", 10, "PosAdm").is_none());
        assert!(obs(1, "PROC-ICD10", "0BH17EZ", 10, "PosAdm").is_none());
    }

    #[test]
    fn status_derivation() {
        assert_eq!(
            AdmissionStatus::from_cohort_label("PosAdm2020Q1"),
            AdmissionStatus::Admitted
        );
        assert_eq!(
            AdmissionStatus::from_cohort_label("PosNotAdm2020Q2"),
            AdmissionStatus::NotAdmitted
        );
        // unrecognized labels fall back to admitted
        assert_eq!(
            AdmissionStatus::from_cohort_label("PosUnknown"),
            AdmissionStatus::Admitted
        );
    }

    #[test]
    fn positive_filter() {
        let observations: Observations = [
            obs(1, "DIAG-ICD10", "U09.9", 100, "PosAdm2020Q1").unwrap(),
            obs(2, "DIAG-ICD10", "U09.9", 100, "NegNotAdm2020Q1").unwrap(),
        ]
        .into_iter()
        .collect();
        let positive = observations.filter_positive();
        assert_eq!(positive.len(), 1);
        assert_eq!(positive[0].patient_num, 1);
    }

    #[test]
    fn cohort_is_per_patient_and_sorted() {
        let observations: Observations = [
            obs(5, "DIAG-ICD10", "G93.3", 10, "PosAdm2020Q1").unwrap(),
            obs(5, "DIAG-ICD10", "R53.1", 95, "PosAdm2020Q1").unwrap(),
            obs(2, "DIAG-ICD9", "780.7", 120, "PosNotAdm2020Q2").unwrap(),
        ]
        .into_iter()
        .collect();
        let cohort = Cohort::from_observations(&observations);
        assert_eq!(cohort.len(), 2);
        assert_eq!(cohort[0].patient_num, 2);
        assert_eq!(cohort[0].status, AdmissionStatus::NotAdmitted);
        assert_eq!(cohort[1].patient_num, 5);
        assert_eq!(cohort[1].status, AdmissionStatus::Admitted);
    }

    #[test]
    fn cohort_summary_percentages() {
        let observations: Observations = [
            obs(1, "DIAG-ICD10", "U09.9", 10, "PosAdm2020Q1").unwrap(),
            obs(2, "DIAG-ICD10", "U09.9", 10, "PosNotAdm2020Q2").unwrap(),
        ]
        .into_iter()
        .collect();
        let cohort = Cohort::from_observations(&observations);
        let rendered = cohort.term_table().unwrap().to_string();
        assert!(rendered.contains("50.0%"));
    }

    #[test]
    fn empty_cohort_summary_is_an_error() {
        let observations: Observations = std::iter::empty::<Observation>().collect();
        let cohort = Cohort::from_observations(&observations);
        assert!(cohort.term_table().is_err());
    }
}

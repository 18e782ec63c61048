//! PheCode phenotype classification and the reference tables mapping ICD
//! diagnosis codes onto it.

use crate::{
    onset::PhenotypeRecords,
    util::{bool_01, optional_string},
    ArcStr, Observations, Result,
};
use once_cell::sync::Lazy;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    path::Path,
};

/// Reference-table group label for neurological phenotypes.
pub const NEURO_GROUP: &str = "neurological";
/// Reference-table group label for mental-disorder phenotypes.
pub const MENTAL_GROUP: &str = "mental disorders";

/// A PheCode: a dotted numeric string such as `290.11`, where the integer
/// part is the top-level phenotype category.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PheCode(ArcStr);

impl PheCode {
    pub fn from_str(s: &str) -> Result<Self> {
        let (int, frac) = match s.split_once('.') {
            Some((int, frac)) => (int, Some(frac)),
            None => (s, None),
        };
        ensure!(
            !int.is_empty() && int.bytes().all(|b| b.is_ascii_digit()),
            "phecode \"{}\" should start with its numeric category",
            s
        );
        ensure!(
            int.parse::<u16>().is_ok(),
            "phecode \"{}\" category out of range",
            s
        );
        if let Some(frac) = frac {
            ensure!(
                !frac.is_empty() && frac.bytes().all(|b| b.is_ascii_digit()),
                "phecode \"{}\" has a non-numeric fraction",
                s
            );
        }
        Ok(PheCode(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_arc(&self) -> ArcStr {
        self.0.clone()
    }

    /// The top-level category: the integer part of the code.
    pub fn rolled(&self) -> RolledPheCode {
        let int = match self.0.split_once('.') {
            Some((int, _)) => int,
            None => &self.0,
        };
        // validated in `from_str`
        RolledPheCode(int.parse().unwrap_or_default())
    }

    fn parts(&self) -> (u16, &str) {
        match self.0.split_once('.') {
            Some((_, frac)) => (self.rolled().0, frac),
            None => (self.rolled().0, ""),
        }
    }
}

impl fmt::Debug for PheCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for PheCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// Numeric on the category, then by fraction digits. Within a category the
// fraction digits compare like decimal fractions, so `290.1 < 290.11 < 290.2`.
impl PartialOrd for PheCode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PheCode {
    fn cmp(&self, other: &Self) -> Ordering {
        let (int_a, frac_a) = self.parts();
        let (int_b, frac_b) = other.parts();
        int_a.cmp(&int_b).then_with(|| frac_a.cmp(frac_b))
    }
}

impl<'a> TryFrom<&'a str> for PheCode {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::from_str(s)
    }
}

// Deserialization goes through `from_str` so persisted data is validated
// just like the CSV reference tables.
impl TryFrom<String> for PheCode {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<PheCode> for String {
    fn from(code: PheCode) -> Self {
        code.0.as_ref().to_owned()
    }
}

/// A PheCode truncated to its top-level category.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RolledPheCode(pub u16);

impl fmt::Display for RolledPheCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One phenotype mapping: a phecode, its human label and coarse group, and
/// the diagnosis codes that map to it.
///
/// One entry per reference-table row. A diagnosis code appearing in several
/// rows matches all of them, which is what gives the join its multi-match
/// semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhenotypeEntry {
    pub phecode: PheCode,
    pub phenotype: ArcStr,
    pub group: ArcStr,
    pub codes: Vec<ArcStr>,
}

/// A row of the curated ("HZ") phenotype table: phenotypes judged plausibly
/// causally linked to prior infection, with their ICD-10/ICD-9 mappings and
/// an inclusion flag.
#[derive(Debug, Deserialize)]
struct CuratedRaw {
    phecode: ArcStr,
    #[serde(rename = "Phenotype")]
    phenotype: ArcStr,
    group: ArcStr,
    #[serde(deserialize_with = "optional_string")]
    icd10: Option<ArcStr>,
    #[serde(deserialize_with = "optional_string")]
    icd9: Option<ArcStr>,
    #[serde(rename = "HZ", deserialize_with = "bool_01")]
    hz: bool,
}

/// A row of the full phenotype catalog (ICD-10-CM mappings only).
#[derive(Debug, Deserialize)]
struct CatalogRaw {
    phecode: ArcStr,
    phecode_str: ArcStr,
    icd10cm: ArcStr,
    #[serde(rename = "icd10cm_str")]
    _icd10cm_str: ArcStr,
    group: ArcStr,
}

static NO_ENTRIES: Lazy<Vec<usize>> = Lazy::new(Vec::new);

/// A phenotype reference table with a pre-built diagnosis-code index.
pub struct PhenotypeReference {
    els: Vec<PhenotypeEntry>,
    code_idx: HashMap<ArcStr, Vec<usize>>,
}

impl PhenotypeReference {
    /// Load the curated phenotype table, keeping only rows with the
    /// inclusion flag set.
    pub fn load_curated(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw: Vec<CuratedRaw> = crate::load_orig(path)?;
        let els = raw
            .into_iter()
            .filter(|row| row.hz)
            .map(|row| {
                let phecode = PheCode::from_str(&row.phecode)?;
                let codes = row.icd10.into_iter().chain(row.icd9).collect::<Vec<_>>();
                ensure!(
                    !codes.is_empty(),
                    "curated phecode {} has no diagnosis code mapping",
                    phecode
                );
                Ok(PhenotypeEntry {
                    phecode,
                    phenotype: row.phenotype,
                    group: row.group,
                    codes,
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("loading curated phenotypes from \"{}\"", path.display()))?;
        Ok(Self::new(els))
    }

    /// Load the full phenotype catalog.
    pub fn load_catalog(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw: Vec<CatalogRaw> = crate::load_orig(path)?;
        let els = raw
            .into_iter()
            .map(|row| {
                Ok(PhenotypeEntry {
                    phecode: PheCode::from_str(&row.phecode)?,
                    phenotype: row.phecode_str,
                    group: row.group,
                    codes: vec![row.icd10cm],
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("loading phenotype catalog from \"{}\"", path.display()))?;
        Ok(Self::new(els))
    }

    /// Restrict to the neurological and mental-disorders groups, rescuing any
    /// phecode that also appears in `rescue` (the curated set).
    pub fn restrict_neuro_mental(&self, rescue: &PhenotypeReference) -> Self {
        let rescue_codes = rescue.phecode_set();
        let els = self
            .els
            .iter()
            .filter(|entry| {
                &*entry.group == NEURO_GROUP
                    || &*entry.group == MENTAL_GROUP
                    || rescue_codes.contains(&entry.phecode)
            })
            .cloned()
            .collect();
        Self::new(els)
    }

    pub fn phecode_set(&self) -> BTreeSet<PheCode> {
        self.els.iter().map(|entry| entry.phecode.clone()).collect()
    }

    /// Indices of the entries a diagnosis code maps to.
    pub fn entries_for_code(&self, code: &str) -> impl Iterator<Item = &PhenotypeEntry> + '_ {
        self.code_idx
            .get(code)
            .unwrap_or(&NO_ENTRIES)
            .iter()
            .map(|idx| &self.els[*idx])
    }

    pub fn len(&self) -> usize {
        self.els.len()
    }

    pub fn is_empty(&self) -> bool {
        self.els.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhenotypeEntry> + '_ {
        self.els.iter()
    }

    /// Representative label for each rolled category: the label of the
    /// numerically first member phecode.
    pub fn rolled_labels(&self) -> BTreeMap<RolledPheCode, ArcStr> {
        let mut firsts: BTreeMap<RolledPheCode, (&PheCode, &ArcStr)> = BTreeMap::new();
        for entry in self.els.iter() {
            let rolled = entry.phecode.rolled();
            match firsts.get(&rolled) {
                Some((code, _)) if *code <= &entry.phecode => (),
                _ => {
                    firsts.insert(rolled, (&entry.phecode, &entry.phenotype));
                }
            }
        }
        firsts
            .into_iter()
            .map(|(rolled, (_, label))| (rolled, label.clone()))
            .collect()
    }

    /// Inner-join observation rows against this reference by diagnosis code.
    ///
    /// Rows with no matching phenotype are dropped; a row matching several
    /// entries produces one output record per match.
    pub fn join(&self, observations: &Observations) -> PhenotypeRecords {
        let rolled_labels = self.rolled_labels();
        let mut out = Vec::new();
        for obs in observations.iter() {
            for entry in self.entries_for_code(&obs.concept_code) {
                let rolled = entry.phecode.rolled();
                out.push(crate::onset::PhenotypeRecord {
                    patient_num: obs.patient_num,
                    days_since_admission: obs.days_since_admission,
                    phecode: entry.phecode.clone(),
                    rolled,
                    phenotype: entry.phenotype.clone(),
                    // every rolled category has at least this entry as a member
                    rolled_phenotype: rolled_labels[&rolled].clone(),
                    group: entry.group.clone(),
                });
            }
        }
        if out.is_empty() && !observations.is_empty() {
            event!(Level::WARN, "phenotype join produced no records");
        }
        PhenotypeRecords::new(out)
    }

    fn new(els: Vec<PhenotypeEntry>) -> Self {
        let mut this = PhenotypeReference {
            els,
            code_idx: HashMap::new(),
        };
        this.rebuild_code_idx();
        this
    }

    fn rebuild_code_idx(&mut self) {
        self.code_idx.clear();
        for (idx, entry) in self.els.iter().enumerate() {
            for code in entry.codes.iter() {
                self.code_idx
                    .entry(code.clone())
                    .or_insert_with(Vec::new)
                    .push(idx);
            }
        }
    }
}

//! Prevalence aggregation and rendering.
//!
//! Terminal tables for interactive runs, plus an HTML report with one
//! scatter panel per coarse phenotype group and click-to-sort tables.

use crate::{
    onset::{Dimension, PhenotypeRecords},
    util::round2,
    AdmissionStatus, ArcStr, Cohort, PatientId, Result,
};
use itertools::Itertools;
use noisy_float::prelude::*;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    fs, io,
    io::Write as _,
    path::Path,
};

/// Prevalence of one phenotype label in one admission-status stratum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyRow {
    pub phenotype: ArcStr,
    pub group: ArcStr,
    pub status: AdmissionStatus,
    /// Distinct patients with at least one qualifying record.
    pub count: usize,
    /// `count` over the distinct-patient count of the whole training split,
    /// as a percentage rounded to 2 decimal places.
    pub percent: f64,
}

/// Per-phenotype patient counts and percentages, sorted descending by
/// percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyTable {
    pub name: ArcStr,
    pub rows: Vec<FrequencyRow>,
}

impl FrequencyTable {
    /// Aggregate a phenotype record table.
    ///
    /// `denominator` is the distinct-patient count of the entire training
    /// split, not of `records`: phenotype prevalence is always relative to
    /// everyone who could have had the phenotype recorded.
    pub fn from_records(
        name: impl Into<ArcStr>,
        records: &PhenotypeRecords,
        dim: Dimension,
        cohort: &Cohort,
        denominator: usize,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(
            denominator > 0,
            "cannot compute prevalence for \"{}\": the training cohort is empty",
            name
        );
        let mut patients: BTreeMap<(ArcStr, AdmissionStatus), (ArcStr, BTreeSet<PatientId>)> =
            BTreeMap::new();
        for rec in records.iter() {
            let status = cohort.status_of(rec.patient_num).with_context(|| {
                format!("patient {} is missing from the cohort table", rec.patient_num)
            })?;
            patients
                .entry((dim.value(rec), status))
                .or_insert_with(|| (rec.group.clone(), BTreeSet::new()))
                .1
                .insert(rec.patient_num);
        }
        let mut rows: Vec<FrequencyRow> = patients
            .into_iter()
            .map(|((phenotype, status), (group, ids))| FrequencyRow {
                phenotype,
                group,
                status,
                count: ids.len(),
                percent: round2(ids.len() as f64 / denominator as f64 * 100.),
            })
            .collect();
        rows.sort_by(|a, b| {
            n64(b.percent)
                .cmp(&n64(a.percent))
                .then_with(|| a.phenotype.cmp(&b.phenotype))
                .then_with(|| a.status.cmp(&b.status))
        });
        Ok(FrequencyTable { name, rows })
    }

    pub fn term_table(&self) -> comfy_table::Table {
        let mut table = comfy_table::Table::new();
        table.set_header(vec!["Phenotype", "Group", "Status", "Patients", "Percent"]);
        for row in &self.rows {
            table.add_row(vec![
                row.phenotype.to_string(),
                row.group.to_string(),
                row.status.to_string(),
                row.count.to_string(),
                format!("{:.2}", row.percent),
            ]);
        }
        table
    }

    /// The coarse groups in this table, in first-appearance order.
    fn groups(&self) -> Vec<ArcStr> {
        self.rows.iter().map(|row| row.group.clone()).unique().collect()
    }
}

const ADMITTED_COLOR: &str = "#1f77b4";
const NOT_ADMITTED_COLOR: &str = "#ff7f0e";

fn status_color(status: AdmissionStatus) -> &'static str {
    match status {
        AdmissionStatus::Admitted => ADMITTED_COLOR,
        AdmissionStatus::NotAdmitted => NOT_ADMITTED_COLOR,
    }
}

/// An HTML report collecting frequency tables and their scatter panels.
pub struct Report {
    title: String,
    body: String,
}

impl Report {
    pub fn new(title: &str) -> Self {
        Report {
            title: title.to_owned(),
            body: String::new(),
        }
    }

    pub fn add_frequency_table(&mut self, table: &FrequencyTable) {
        let _ = write!(
            self.body,
            "<h2>{}</h2>",
            html_escape::encode_text(&table.name)
        );
        for group in table.groups() {
            self.add_scatter(table, &group);
        }
        self.add_sortable_table(table);
    }

    /// One panel per coarse phenotype group: phenotype labels on the y axis,
    /// prevalence percentage on the x axis, one point per status, the raw
    /// patient count written above each point.
    fn add_scatter(&mut self, table: &FrequencyTable, group: &str) {
        let rows: Vec<&FrequencyRow> =
            table.rows.iter().filter(|row| &*row.group == group).collect();
        let labels: Vec<&ArcStr> = rows.iter().map(|row| &row.phenotype).unique().collect();
        let max_percent = rows
            .iter()
            .map(|row| n64(row.percent))
            .max()
            .map(|v| v.raw())
            .unwrap_or(0.)
            .max(1.);

        const LEFT: f64 = 260.;
        const PLOT_W: f64 = 380.;
        const ROW_H: f64 = 24.;
        let height = labels.len() as f64 * ROW_H + 50.;

        let out = &mut self.body;
        let _ = write!(out, "<h3>{}</h3>", html_escape::encode_text(group));
        let _ = write!(
            out,
            r#"<svg width="{}" height="{}" font-family="sans-serif" font-size="11">"#,
            LEFT + PLOT_W + 40.,
            height
        );
        for (idx, label) in labels.iter().enumerate() {
            let y = 30. + idx as f64 * ROW_H;
            let _ = write!(
                out,
                r#"<text x="{}" y="{}" text-anchor="end">{}</text>"#,
                LEFT - 12.,
                y + 4.,
                html_escape::encode_text(label)
            );
            let _ = write!(
                out,
                r##"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="#ddd"/>"##,
                LEFT,
                y,
                LEFT + PLOT_W,
                y
            );
            for row in rows.iter().filter(|row| &row.phenotype == *label) {
                let x = LEFT + row.percent / max_percent * PLOT_W;
                let _ = write!(
                    out,
                    r#"<circle cx="{:.1}" cy="{}" r="5" fill="{}" fill-opacity="0.8"/>"#,
                    x,
                    y,
                    status_color(row.status)
                );
                let _ = write!(
                    out,
                    r#"<text x="{:.1}" y="{}" text-anchor="middle">{}</text>"#,
                    x,
                    y - 9.,
                    row.count
                );
            }
        }
        // x axis
        let axis_y = height - 18.;
        let _ = write!(
            out,
            r##"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="#333"/>"##,
            LEFT,
            axis_y,
            LEFT + PLOT_W,
            axis_y
        );
        let _ = write!(
            out,
            r#"<text x="{}" y="{}">0%</text><text x="{}" y="{}" text-anchor="end">{:.2}%</text>"#,
            LEFT,
            axis_y + 14.,
            LEFT + PLOT_W,
            axis_y + 14.,
            max_percent
        );
        // legend
        let _ = write!(
            out,
            r#"<circle cx="{}" cy="12" r="5" fill="{}"/><text x="{}" y="16">Admitted</text>"#,
            LEFT,
            ADMITTED_COLOR,
            LEFT + 10.
        );
        let _ = write!(
            out,
            r#"<circle cx="{}" cy="12" r="5" fill="{}"/><text x="{}" y="16">Not Admitted</text>"#,
            LEFT + 90.,
            NOT_ADMITTED_COLOR,
            LEFT + 100.
        );
        out.push_str("</svg>");
    }

    fn add_sortable_table(&mut self, table: &FrequencyTable) {
        let out = &mut self.body;
        out.push_str(
            "<table class=\"freq\"><thead><tr>\
             <th>Phenotype</th><th>Group</th><th>Status</th>\
             <th>Patients</th><th>Percent</th></tr></thead><tbody>",
        );
        for row in &table.rows {
            let _ = write!(
                out,
                "<tr><td>{}</td><td>{}</td><td>{}</td>\
                 <td data-num=\"{}\">{}</td><td data-num=\"{}\">{:.2}</td></tr>",
                html_escape::encode_text(&row.phenotype),
                html_escape::encode_text(&row.group),
                row.status,
                row.count,
                row.count,
                row.percent,
                row.percent,
            );
        }
        out.push_str("</tbody></table>");
    }

    /// Write the report out as a self-contained HTML file.
    pub fn write(&self, path: impl AsRef<Path>, overwrite: bool) -> Result {
        fn inner(this: &Report, path: &Path, overwrite: bool) -> Result {
            ensure!(
                overwrite || !crate::path_exists(path)?,
                "file already exists"
            );
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = io::BufWriter::new(fs::File::create(path)?);
            write!(
                file,
                "<!doctype html><html><head><meta charset=\"utf-8\"><title>{}</title>\
                 <style>{}</style></head><body><h1>{}</h1>{}<script>{}</script></body></html>",
                html_escape::encode_text(&this.title),
                REPORT_CSS,
                html_escape::encode_text(&this.title),
                this.body,
                SORT_SCRIPT,
            )?;
            Ok(())
        }

        let path = crate::output_path(path.as_ref());
        crate::check_extension(&path, "html")?;
        inner(self, &path, overwrite)
            .with_context(|| format!("error writing report to \"{}\"", path.display()))?;
        event!(Level::INFO, "wrote report to \"{}\"", path.display());
        Ok(())
    }
}

const REPORT_CSS: &str = "body{font-family:sans-serif;margin:2em}\
table.freq{border-collapse:collapse;margin:1em 0}\
table.freq th,table.freq td{border:1px solid #ccc;padding:2px 8px;text-align:left}\
table.freq th{cursor:pointer;background:#f0f0f0}";

// click a header to sort; numeric columns carry their value in data-num
const SORT_SCRIPT: &str = "\
document.querySelectorAll('table.freq th').forEach(function(th){\
th.addEventListener('click',function(){\
var table=th.closest('table'),tbody=table.querySelector('tbody');\
var idx=Array.prototype.indexOf.call(th.parentNode.children,th);\
var asc=th.asc=!th.asc;\
var rows=Array.prototype.slice.call(tbody.querySelectorAll('tr'));\
rows.sort(function(a,b){\
var ca=a.children[idx],cb=b.children[idx];\
var va=ca.dataset.num!==undefined?parseFloat(ca.dataset.num):ca.textContent;\
var vb=cb.dataset.num!==undefined?parseFloat(cb.dataset.num):cb.textContent;\
return (va<vb?-1:va>vb?1:0)*(asc?1:-1);});\
rows.forEach(function(r){tbody.appendChild(r);});});});";

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        onset::{PhenotypeRecord, PhenotypeRecords},
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
    fn counts_distinct_patients_per_status() {
        let cohort = cohort(&[(1, "PosAdm"), (2, "PosAdm"), (3, "PosNotAdm")]);
        // patient 1 has two records of the same phenotype: counted once
        let records = PhenotypeRecords::new(vec![
            rec(1, "290.11", "Dementias", 100),
            rec(1, "290.11", "Dementias", 150),
            rec(2, "290.11", "Dementias", 120),
            rec(3, "290.11", "Dementias", 95),
        ]);
        let table =
            FrequencyTable::from_records("test", &records, Dimension::Phenotype, &cohort, 4)
                .unwrap();
        assert_eq!(table.rows.len(), 2);
        let admitted = table
            .rows
            .iter()
            .find(|r| r.status == AdmissionStatus::Admitted)
            .unwrap();
        assert_eq!(admitted.count, 2);
        assert_eq!(admitted.percent, 50.);
        let not_admitted = table
            .rows
            .iter()
            .find(|r| r.status == AdmissionStatus::NotAdmitted)
            .unwrap();
        assert_eq!(not_admitted.count, 1);
        assert_eq!(not_admitted.percent, 25.);
    }

    #[test]
    fn percent_is_rounded_and_bounded() {
        let cohort = cohort(&[(1, "PosAdm")]);
        let records = PhenotypeRecords::new(vec![rec(1, "290.11", "Dementias", 100)]);
        let table =
            FrequencyTable::from_records("test", &records, Dimension::Phenotype, &cohort, 3)
                .unwrap();
        // 1/3 = 33.333..% rounds to 33.33
        assert_eq!(table.rows[0].percent, 33.33);
        for row in &table.rows {
            assert!(row.percent >= 0. && row.percent <= 100.);
        }
    }

    #[test]
    fn rows_sorted_descending_by_percent() {
        let cohort = cohort(&[(1, "PosAdm"), (2, "PosAdm"), (3, "PosAdm")]);
        let records = PhenotypeRecords::new(vec![
            rec(1, "290.11", "Dementias", 100),
            rec(2, "290.11", "Dementias", 100),
            rec(3, "296.22", "Depression", 100),
        ]);
        let table =
            FrequencyTable::from_records("test", &records, Dimension::Phenotype, &cohort, 3)
                .unwrap();
        let percents: Vec<f64> = table.rows.iter().map(|r| r.percent).collect();
        let mut sorted = percents.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(percents, sorted);
        assert_eq!(&*table.rows[0].phenotype, "Dementias");
    }

    #[test]
    fn groups_keep_first_appearance_order() {
        let row = |phenotype: &str, group: &str| FrequencyRow {
            phenotype: phenotype.into(),
            group: group.into(),
            status: AdmissionStatus::Admitted,
            count: 1,
            percent: 1.,
        };
        let table = FrequencyTable {
            name: "test".into(),
            rows: vec![
                row("Dementias", "neurological"),
                row("Depression", "mental disorders"),
                row("Delirium", "neurological"),
            ],
        };
        assert_eq!(
            table.groups(),
            vec![ArcStr::from("neurological"), ArcStr::from("mental disorders")]
        );
    }

    #[test]
    fn empty_denominator_is_an_error() {
        let cohort = cohort(&[]);
        let records = PhenotypeRecords::new(vec![]);
        assert!(
            FrequencyTable::from_records("test", &records, Dimension::Phenotype, &cohort, 0)
                .is_err()
        );
    }
}

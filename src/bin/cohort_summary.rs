//! Descriptive statistics of the imported and split data.

use pasc_phenotypes::{
    header,
    split::{Split, SplitAssignments},
    Cohort, Observations,
};
use qu::ick_use::*;
use std::collections::BTreeMap;

#[qu::ick]
pub fn main() -> Result {
    let observations = Observations::load("observations.bin")?;
    let cohort = Cohort::load("cohort.bin")?;
    let assignments = SplitAssignments::load("splits.bin")?;

    header("Observations");
    println!("total rows: {}", observations.len());
    println!("total patients: {}", observations.patient_ids().len());
    let mut table = comfy_table::Table::new();
    table.set_header(vec!["Code system", "Rows"]);
    for (system, count) in observations.count_code_systems() {
        table.add_row(vec![system.to_string(), count.to_string()]);
    }
    println!("{}", table);

    header("Cohort");
    println!("patients: {}", cohort.len());
    println!("{}", cohort.term_table()?);

    header("Split by admission status");
    // cross-tabulate the assignment against the status it was drawn over
    let mut cross: BTreeMap<_, usize> = BTreeMap::new();
    for patient in cohort.iter() {
        let Some(split) = assignments.get(patient.patient_num) else {
            event!(Level::WARN, "patient {} has no split assignment", patient.patient_num);
            continue;
        };
        *cross.entry((split, patient.status)).or_insert(0) += 1;
    }
    let mut table = comfy_table::Table::new();
    table.set_header(vec!["Split", "Status", "Patients"]);
    for ((split, status), count) in &cross {
        table.add_row(vec![split.to_string(), status.to_string(), count.to_string()]);
    }
    println!("{}", table);

    for split in [Split::Train, Split::Test] {
        println!("{}: {} patients", split, assignments.patients_in(split).len());
    }
    Ok(())
}

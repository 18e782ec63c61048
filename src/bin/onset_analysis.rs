//! The main analysis: join the training split against the phenotype
//! reference tables, compute any-occurrence and new-onset tables, aggregate
//! prevalence, render the report and persist the feature-matrix bundles.

use clap::Parser;
use pasc_phenotypes::{
    header,
    onset::{Dimension, PhenotypeRecords, NEW_ONSET_THRESHOLD_DAYS},
    phecodes::PhenotypeReference,
    report::{FrequencyTable, Report},
    vectors::{FeatureMatrix, FrequencyBundle, VectorBundle},
    Cohort, Observations,
};
use qu::ick_use::*;

#[derive(Parser)]
struct Opt {
    /// Overwrite an existing report.
    #[clap(long, short)]
    overwrite: bool,
    /// Day offset at which an occurrence counts as post-acute.
    #[clap(long, default_value_t = NEW_ONSET_THRESHOLD_DAYS)]
    threshold: i32,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let train = Observations::load("train.bin")?;
    let cohort = Cohort::load("cohort.bin")?;
    let curated = PhenotypeReference::load_curated("hz_phecodes.csv")?;
    let catalog = PhenotypeReference::load_catalog("phecode_icd10.csv")?;
    let broad = catalog.restrict_neuro_mental(&curated);

    // prevalence is always relative to the whole training split
    let denominator = train.patient_ids().len();

    header("Inputs");
    println!("training rows: {}", train.len());
    println!("training patients: {}", denominator);
    println!("curated phenotype entries: {}", curated.len());
    println!(
        "broad phenotype entries: {} (of {} in the catalog)",
        broad.len(),
        catalog.len()
    );

    let curated_join = curated.join(&train);
    let broad_join = broad.join(&train);
    let curated_after = curated_join.after_threshold(opt.threshold);
    let curated_onset = curated_join.new_onset(opt.threshold);
    let broad_after = broad_join.after_threshold(opt.threshold);
    let broad_onset = broad_join.new_onset(opt.threshold);

    header("Joined record counts");
    for (name, records) in [
        ("curated join", &curated_join),
        ("curated after threshold", &curated_after),
        ("curated new onset", &curated_onset),
        ("broad join", &broad_join),
        ("broad after threshold", &broad_after),
        ("broad new onset", &broad_onset),
    ] {
        println!(
            "{}: {} records, {} patients",
            name,
            records.len(),
            records.patient_ids().len()
        );
    }

    // any-occurrence tables aggregate on the fine phenotype label, new-onset
    // tables on the rolled category label
    let tables = [
        frequency(
            "curated phenotypes, any occurrence after threshold",
            &curated_after,
            Dimension::Phenotype,
            &cohort,
            denominator,
        )?,
        frequency(
            "curated phenotypes, new onset",
            &curated_onset,
            Dimension::RolledPhenotype,
            &cohort,
            denominator,
        )?,
        frequency(
            "neuro/mental phenotypes, any occurrence after threshold",
            &broad_after,
            Dimension::Phenotype,
            &cohort,
            denominator,
        )?,
        frequency(
            "neuro/mental phenotypes, new onset",
            &broad_onset,
            Dimension::RolledPhenotype,
            &cohort,
            denominator,
        )?,
    ];

    let mut report = Report::new("Post-acute phenotype prevalence");
    for table in &tables {
        report.add_frequency_table(table);
    }
    report.write("onset_report.html", opt.overwrite)?;

    let matrices = vec![
        matrix("curated_join", &curated_join, Dimension::PheCode, &cohort)?,
        matrix("curated_after", &curated_after, Dimension::Phenotype, &cohort)?,
        matrix("curated_new_onset", &curated_onset, Dimension::RolledPhenotype, &cohort)?,
        matrix("broad_join", &broad_join, Dimension::PheCode, &cohort)?,
        matrix("broad_after", &broad_after, Dimension::Phenotype, &cohort)?,
        matrix("broad_new_onset", &broad_onset, Dimension::RolledPhenotype, &cohort)?,
    ];

    header("Feature matrices");
    for m in &matrices {
        println!(
            "{}: {} patients x {} features",
            m.name,
            m.rows.len(),
            m.features.len()
        );
    }

    let vector_bundle = VectorBundle::new(matrices);
    vector_bundle.save("feature_matrices.bin")?;
    vector_bundle.save_json("feature_matrices.json")?;

    let frequency_bundle = FrequencyBundle::new(tables.into_iter().collect());
    frequency_bundle.save("frequency_tables.bin")?;
    frequency_bundle.save_json("frequency_tables.json")?;

    Ok(())
}

fn frequency(
    name: &str,
    records: &PhenotypeRecords,
    dim: Dimension,
    cohort: &Cohort,
    denominator: usize,
) -> Result<FrequencyTable> {
    let table = FrequencyTable::from_records(name, records, dim, cohort, denominator)?;
    header(name);
    println!("{}", table.term_table());
    Ok(table)
}

fn matrix(
    name: &str,
    records: &PhenotypeRecords,
    dim: Dimension,
    cohort: &Cohort,
) -> Result<FeatureMatrix> {
    FeatureMatrix::from_records(name, records, dim, cohort)
}

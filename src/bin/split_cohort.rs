use clap::Parser;
use pasc_phenotypes::{
    header,
    split::{SplitAssignments, DEFAULT_SEED},
    Cohort, Observations,
};
use qu::ick_use::*;

#[derive(Parser)]
struct Opt {
    /// Seed for the train/test draw. The split is reproducible for a fixed
    /// seed.
    #[clap(long, default_value_t = DEFAULT_SEED)]
    seed: u64,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let observations = Observations::load("observations.bin")?;
    let positive = observations.filter_positive();
    let cohort = Cohort::from_observations(&positive);
    let assignments = SplitAssignments::draw(&cohort, opt.seed);
    let (train, test) = assignments.partition(&positive);

    header("Cohort");
    println!("observation rows: {}", observations.len());
    println!("COVID-positive rows: {}", positive.len());
    println!("COVID-positive patients: {}", cohort.len());
    for (status, count) in cohort.count_statuses() {
        println!("{}: {}", status, count);
    }

    header("Train/test split");
    println!("seed: {}", opt.seed);
    for (split, count) in assignments.count_splits() {
        println!("{}: {} patients", split, count);
    }
    println!("train rows: {}", train.len());
    println!("test rows: {}", test.len());

    cohort.save("cohort.bin")?;
    assignments.save("splits.bin")?;
    train.save("train.bin")?;
    test.save("test.bin")?;
    Ok(())
}

use pasc_phenotypes::Observations;
use qu::ick_use::*;

#[qu::ick]
fn main() -> Result {
    let observations = Observations::load_orig("observations.csv")?;
    observations.save("observations.bin")?;

    println!(
        "imported {} diagnosis rows for {} patients",
        observations.len(),
        observations.patient_ids().len()
    );
    for (system, count) in observations.count_code_systems() {
        println!("{}: {} rows", system, count);
    }
    Ok(())
}

mod simulate;

use clap::{Parser, Subcommand};
use log::info;
use simulate::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LUPIN",
    long_about = "Hyperspherical variational autoencoders (S-VAE) with a\n\
		  k-nearest-neighbour memory for few-shot anomaly detection.\n\
		  Latent codes live on the unit sphere under von Mises-Fisher\n\
		  posteriors; a handful of labelled anomalies are pushed to the\n\
		  cap opposite the normal population and stored in the memory."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Simulate data, train an S-VAE and a memory, and score held-out samples",
        long_about = "Run the whole pipeline on synthetic data in four stages: \n\
		      (1) Simulate a low-rank normal population and shifted anomalies\n\
		      (2) Train a two-cap S-VAE with a few labelled anomalies\n\
		      (3) Write the labelled examples into the KNN memory\n\
		      (4) Score a test set and report ROC AUC as JSON.\n"
    )]
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
    }

    info!("Done");
    Ok(())
}

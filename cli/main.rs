#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use neurocombat::table::{load_table, write_table};
use neurocombat::{CombatConfig, CombatHarmonizer, ColumnRoles, Retain};
use std::path::PathBuf;
use std::process;

/// Column roles shared by `fit` and `fit-transform`.
#[derive(Args)]
pub struct RoleArgs {
    /// Path to a tab-separated table with a header row
    pub table: PathBuf,

    /// Column holding the site (batch) label of each sample
    #[arg(long, value_name = "COL")]
    pub sites: String,

    /// Categorical covariate column whose effect is preserved (repeatable)
    #[arg(long = "discrete", value_name = "COL")]
    pub discrete: Vec<String>,

    /// Numeric covariate column whose effect is preserved (repeatable)
    #[arg(long = "continuous", value_name = "COL")]
    pub continuous: Vec<String>,

    /// Column to leave out of harmonization, e.g. a sample identifier (repeatable)
    #[arg(long = "exclude", value_name = "COL")]
    pub exclude: Vec<String>,

    /// TOML file with solver settings (convergence_tolerance, max_iterations, empirical_bayes)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl RoleArgs {
    fn roles(&self) -> ColumnRoles {
        ColumnRoles {
            sites: self.sites.clone(),
            discrete_covariates: self.discrete.clone(),
            continuous_covariates: self.continuous.clone(),
            excluded_columns: self.exclude.clone(),
        }
    }

    fn harmonizer(&self) -> Result<CombatHarmonizer, Box<dyn std::error::Error>> {
        let config = match &self.config {
            Some(path) => {
                println!("Loading configuration from: {}", path.display());
                CombatConfig::load(path)?
            }
            None => CombatConfig::default(),
        };
        Ok(CombatHarmonizer::new(self.roles()).with_config(config))
    }
}

/// Which non-feature columns to copy into the harmonized table.
#[derive(Args)]
pub struct RetainArgs {
    /// Re-insert every site, covariate and excluded column at its original position
    #[arg(long, conflicts_with = "keep")]
    pub retain: bool,

    /// Re-insert only this non-feature column (repeatable)
    #[arg(long = "keep", value_name = "COL")]
    pub keep: Vec<String>,
}

impl RetainArgs {
    fn retain(&self) -> Retain {
        if self.retain {
            Retain::All
        } else if self.keep.is_empty() {
            Retain::None
        } else {
            Retain::Only(self.keep.clone())
        }
    }
}

#[derive(Parser)]
#[command(
    name = "neurocombat",
    about = "Empirical Bayes (ComBat) harmonization of multi-site measurements",
    long_about = "Removes site effects from tabular feature data while preserving the effects \
                 of known biological covariates, using the ComBat empirical Bayes model."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fit a harmonization model (outputs: combat_model.toml)")]
    Fit {
        #[command(flatten)]
        roles: RoleArgs,

        /// Where to write the fitted model and column manifest
        #[arg(long, default_value = "combat_model.toml")]
        output: PathBuf,
    },
    #[command(about = "Apply a fitted model to new data (outputs: harmonized.tsv)")]
    Transform {
        /// Path to a tab-separated table with the same columns as at fit time
        table: PathBuf,

        /// Model written by `fit`
        #[arg(long)]
        model: PathBuf,

        #[arg(long, default_value = "harmonized.tsv")]
        output: PathBuf,

        #[command(flatten)]
        retain: RetainArgs,
    },
    #[command(
        name = "fit-transform",
        about = "Fit on a table and harmonize it in one step (outputs: harmonized.tsv)"
    )]
    FitTransform {
        #[command(flatten)]
        roles: RoleArgs,

        #[arg(long, default_value = "harmonized.tsv")]
        output: PathBuf,

        /// Also save the fitted model here
        #[arg(long)]
        model: Option<PathBuf>,

        #[command(flatten)]
        retain: RetainArgs,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Fit { roles, output }) => fit(roles, output),
        Some(Commands::Transform {
            table,
            model,
            output,
            retain,
        }) => transform(table, model, output, retain),
        Some(Commands::FitTransform {
            roles,
            output,
            model,
            retain,
        }) => fit_transform(roles, output, model, retain),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
                process::exit(1);
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn fit(roles: RoleArgs, output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let df = load_table(&roles.table)?;
    let mut harmonizer = roles.harmonizer()?;
    harmonizer.fit(&df)?;
    if let Some(model) = harmonizer.model() {
        println!(
            "Fitted {} sites over {} features.",
            model.n_sites(),
            model.n_features()
        );
    }
    harmonizer.save(&output)?;
    println!("Model saved to: {}", output.display());
    Ok(())
}

fn transform(
    table: PathBuf,
    model: PathBuf,
    output: PathBuf,
    retain: RetainArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", model.display());
    let harmonizer = CombatHarmonizer::load(&model)?.with_retain(retain.retain());
    let df = load_table(&table)?;
    let mut harmonized = harmonizer.transform(&df)?;
    write_table(&mut harmonized, &output)?;
    println!(
        "Harmonized {} samples written to: {}",
        harmonized.height(),
        output.display()
    );
    Ok(())
}

fn fit_transform(
    roles: RoleArgs,
    output: PathBuf,
    model: Option<PathBuf>,
    retain: RetainArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let df = load_table(&roles.table)?;
    let mut harmonizer = roles.harmonizer()?.with_retain(retain.retain());
    let mut harmonized = harmonizer.fit_transform(&df)?;
    if let Some(path) = model {
        harmonizer.save(&path)?;
        println!("Model saved to: {}", path.display());
    }
    write_table(&mut harmonized, &output)?;
    println!(
        "Harmonized {} samples written to: {}",
        harmonized.height(),
        output.display()
    );
    Ok(())
}

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use log::{error, info};

use rejig::{
    queue::{slurm::Slurm, SubmissionDriver},
    reconstruct::Reconstructor,
    reset::{confirm, reset, tidy, ResetOptions},
    scan::scan,
    settings::SubmitSettings,
};

#[derive(Parser)]
#[command(name = "rejig")]
#[command(about = "Submit, check, reset and reassemble crystal optimisation jobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit every job under the current directory that has not run yet
    Submit {
        /// settings file, created with the defaults if missing
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Print the submission settings, writing the defaults if needed
    Settings {
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Classify every job under ROOT and write the completed, incomplete and
    /// pending lists into ROOT
    DidComplete {
        #[arg(default_value = ".")]
        root: PathBuf,
    },

    /// Rewind unfinished jobs to their last geometry so they can be
    /// resubmitted
    Reset {
        /// don't ask for confirmation
        #[arg(long)]
        yes: bool,

        /// report what would change without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove scratch files from jobs that exited normally
    Tidy {
        #[arg(long)]
        dry_run: bool,
    },

    /// Merge finished molecules back into their crystals
    Reconstruct {
        /// directory holding one subdirectory per crystal
        #[arg(long = "ReJig_dirpath", default_value = "rejigged_crystals")]
        dirpath: PathBuf,

        /// also merge crystals whose unfinished molecules have all started
        #[arg(
            long = "process_all_crystals",
            default_value = "false",
            action = clap::ArgAction::Set,
            value_parser = parse_flag
        )]
        process_all_crystals: bool,
    },
}

/// accept true/false and their first letters, in any case
fn parse_flag(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" => Ok(true),
        "false" | "f" => Ok(false),
        _ => Err(format!("expected true or false, got `{s}`")),
    }
}

fn settings(path: Option<PathBuf>) -> Result<SubmitSettings, String> {
    let path = path.unwrap_or_else(SubmitSettings::default_path);
    SubmitSettings::load(&path).map_err(|e| e.to_string())
}

fn run(cli: Cli) -> Result<bool, String> {
    let here = Path::new(".");
    match cli.command {
        Commands::Submit { settings: path } => {
            let settings = settings(path)?;
            let slurm = Slurm::new();
            info!("submitting as {}", slurm.user());
            let mut driver = SubmissionDriver::new(&slurm, settings);
            let report = driver.run(here).map_err(|e| e.to_string())?;
            print!("{report}");
            Ok(report.is_success())
        }
        Commands::Settings { settings: path } => {
            print!("{}", settings(path)?);
            Ok(true)
        }
        Commands::DidComplete { root } => {
            let results = scan(&root).map_err(|e| e.to_string())?;
            results.write_lists(&root).map_err(|e| e.to_string())?;
            println!(
                "{} complete, {} incomplete, {} not begun",
                results.successful.len(),
                results.unsuccessful.len(),
                results.not_begun.len()
            );
            for (path, e) in &results.errors {
                println!("failed to classify {}: {e}", path.display());
            }
            Ok(results.errors.is_empty())
        }
        Commands::Reset { yes, dry_run } => {
            if !yes && !dry_run {
                let go = confirm(
                    io::stdin().lock(),
                    io::stdout(),
                    "reset archives the input and log of every unfinished \
		     job; make sure none of them are still running. continue?",
                )
                .map_err(|e| e.to_string())?;
                if !go {
                    println!("nothing was changed");
                    return Ok(true);
                }
            }
            let report = reset(here, &ResetOptions { dry_run })
                .map_err(|e| e.to_string())?;
            print!("{report}");
            Ok(report.is_success())
        }
        Commands::Tidy { dry_run } => {
            let report = tidy(here, dry_run).map_err(|e| e.to_string())?;
            print!("{report}");
            Ok(report.failed.is_empty())
        }
        Commands::Reconstruct {
            dirpath,
            process_all_crystals,
        } => {
            let report = Reconstructor::default()
                .run(&dirpath, process_all_crystals)
                .map_err(|e| e.to_string())?;
            print!("{report}");
            Ok(report.failed.is_empty())
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();
    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

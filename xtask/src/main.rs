use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run every workspace test
    Test,
    /// Trace the frames a load of FILE would send, without a device
    DryRun {
        /// Binary image to trace
        file: String,

        /// Load address of the first byte
        #[arg(long, default_value = "0xC0D00000")]
        base: String,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Testing project...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::DryRun { file, base } => {
            println!("Tracing load of {}...", file);
            cargo(
                &[
                    "run",
                    "-p",
                    "hexload-cli",
                    "--",
                    "--dry-run",
                    "-v",
                    "load",
                    file.as_str(),
                    "--base",
                    base.as_str(),
                ],
                "Dry run",
            )?;
        }
    }

    Ok(())
}

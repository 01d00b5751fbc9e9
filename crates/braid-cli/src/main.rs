mod definition;
mod run;
mod validate;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "braid", version, about = "Braid workflow execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition file without executing it.
    Validate(validate::ValidateArgs),
    /// Execute a workflow definition file in-process.
    Run(run::RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    braid_core::init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Validate(args)) => validate::validate(args).await,
        Some(Command::Run(args)) => run::run(args).await,
        None => {
            println!("braid v0.1.0");
            Ok(())
        }
    }
}

use anyhow::Result;
use clap::Parser;
use lockstep_cli::Cli;
use lockstep_migrate::ProcedureRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    lockstep_cli::run(cli, ProcedureRegistry::new()).await
}

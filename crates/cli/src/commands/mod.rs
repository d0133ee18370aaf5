mod check;
mod print_config;
mod run;

use crate::cli::{Cli, Commands};

/// Runs the selected command and returns the process exit code.
pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
	let config = cli.load_config()?;
	match cli.command() {
		Commands::Run => run::execute(config).await,
		Commands::Check => check::execute(&config),
		Commands::PrintConfig => print_config::execute(&config),
	}
}

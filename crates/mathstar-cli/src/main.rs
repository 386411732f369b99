use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = mathstar_cli::Cli::parse();
    mathstar_cli::run_cli(cli)
}

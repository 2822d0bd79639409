pub mod rollback;
pub mod selftest;

use anyhow::Result;
use clap::{Parser, Subcommand};

use selftest::SelftestConfig;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach to an emulated card, run the DMA scenario, map the buffer and detach.
    Selftest(SelftestConfig),
    /// Fail every attach step in turn and check that nothing is left behind.
    Rollback,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();
    let args = Args::parse();
    match args.command {
        Command::Selftest(cfg) => {
            log::info!("Running self-test");
            selftest::run(&cfg)?;
        }
        Command::Rollback => {
            log::info!("Running rollback check");
            rollback::run()?;
        }
    }

    Ok(())
}

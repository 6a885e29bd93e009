use abscissa_core::{Command, Runnable};
use clap::Parser;

#[derive(Debug, Parser, Command)]
#[command(author, about, version)]
pub struct EntryPoint {
    #[command(subcommand)]
    pub(crate) cmd: PaywatchCmd,

    /// Enable verbose logging
    #[arg(short, long)]
    pub(crate) verbose: bool,

    /// Use the specified config file
    #[arg(short, long)]
    pub(crate) config: Option<String>,
}

#[derive(Debug, Parser, Command, Runnable)]
pub(crate) enum PaywatchCmd {
    /// Start the chain monitors and run until interrupted
    Start(StartCmd),

    /// Write an example `paywatch.toml` to stdout or a file
    ExampleConfig(ExampleConfigCmd),
}

/// `start` subcommand
#[derive(Debug, Parser, Command)]
pub(crate) struct StartCmd {}

/// `example-config` subcommand
#[derive(Debug, Parser, Command)]
pub(crate) struct ExampleConfigCmd {
    /// Write the example config to this path instead of stdout
    #[arg(short, long)]
    pub(crate) output: Option<String>,

    /// Overwrite the output file if it already exists
    #[arg(long)]
    pub(crate) force: bool,
}

//! Command surface. Follows the `st_organiser` clap-derive idiom: a top-level [`ClapArgs`] with
//! an optional subcommand, doc comments becoming `--help` text.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive voice-tour client")]
pub struct ClapArgs {
    #[command(subcommand)]
    pub command: Option<SubCommands>,
}

#[derive(Subcommand, Debug)]
pub enum SubCommands {
    /// Start the tour from the first stop.
    #[clap(alias = "s")]
    Start,
    /// Ask a one-off question and print the answer once the turn settles.
    #[clap(alias = "q")]
    Ask { text: String },
    /// Print a health check of the remote server and exit.
    Health,
}

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml and the data files.
    /// Defaults to ~/.local/share/markly
    #[clap(long, global = true)]
    pub base_path: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the http api and the enrichment queue
    Daemon {},

    /// Run extraction and analysis for a single url without storing anything
    Analyze {
        url: String,

        /// Use this text instead of scraping the page
        #[clap(short, long)]
        description: Option<String>,

        /// Analyze with the configured nano model
        #[clap(long, default_value = "false")]
        nano: bool,
    },

    /// Parse a browser export (Netscape html or Firefox json) and print the
    /// import payload it would produce
    ParseExport { file: String },
}

use std::path::PathBuf;

use clap::Args;

/// Run the synchronization engine with the given configuration file.
#[derive(Args)]
pub struct Run {
    /// Path to the TOML configuration file.
    #[clap(short, long)]
    pub config: PathBuf,
}

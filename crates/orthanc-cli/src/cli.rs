use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "orthanc-server", about = "A DICOM store SCP/SCU server", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load a YAML configuration file and run the server until shutdown.
    Serve {
        /// Path to the configuration file.
        config: PathBuf,
    },
}

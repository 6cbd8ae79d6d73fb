use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(about, long_about = None)]
pub struct Cli {
    /// Set a custom config file
    #[arg(short, visible_short_alias = 'f', long, value_name = "FILE")]
    pub config: Option<String>,

    /// Set configuration directory
    #[arg(short = 'C', visible_short_alias = 'd', long, value_name = "PATH")]
    pub config_dir: Option<PathBuf>,

    /// Show current version
    #[arg(short = 'v', visible_short_alias = 'V', long, action = ArgAction::SetTrue)]
    pub version: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as the public Gateway
    Gateway,

    /// Run as a Private Client
    Client,

    /// Write a default configuration file and exit
    Init {
        /// Specify the configuration file format
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Where to write the file, relative to the current directory
        #[arg(short, long, default_value = "config.yaml")]
        out: PathBuf,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

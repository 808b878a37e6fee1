use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "runarc")]
#[command(version)]
#[command(about = "HTTP Range-based remote archive preview server", long_about = None)]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,
}

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "filtersync")]
#[command(about = "Keeps a .vcxproj.filters folder tree in sync with its file paths")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// Path to the .vcxproj.filters file (defaults to the engine filters file
    /// one directory above the tool)
    #[arg(short, long)]
    pub project: Option<PathBuf>,
}

mod cli;
mod filters;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use cli::Cli;
use filters::FilterFile;

const FILTERS_FILE_NAME: &str = "KashipanEngine.vcxproj.filters";

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filters_path = match cli.project {
        Some(path) => path,
        None => default_filters_path()?,
    };

    let mut filter_file = FilterFile::load(&filters_path)?;
    let added = filter_file.sync()?;
    filter_file.save()?;

    println!(
        "Updated `{}`: added {} folder filters",
        display_path(&filters_path),
        added
    );
    Ok(())
}

// The tool ships in a tools/ directory next to the project root; the filters
// file sits one directory up under a fixed name.
fn default_filters_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the running tool")?;
    let tool_dir = exe.parent().context("Tool path has no parent directory")?;
    let root = tool_dir.parent().unwrap_or(tool_dir);
    Ok(root.join(FILTERS_FILE_NAME))
}

fn display_path(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| path.strip_prefix(cwd).ok())
        .unwrap_or(path)
        .display()
        .to_string()
}

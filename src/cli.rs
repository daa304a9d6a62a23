//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download open-access copies of the works cited by a paper.
///
/// Reads a JSON array of citations, resolves each one against arXiv,
/// Unpaywall, OpenAlex, Semantic Scholar, Crossref, PubMed Central and CORE
/// in priority order, and saves validated PDFs to the output directory.
#[derive(Parser, Debug)]
#[command(name = "bibp")]
#[command(author, version, about)]
pub struct Args {
    /// Citations JSON file (`-` or omitted reads stdin)
    pub input: Option<PathBuf>,

    /// Directory for downloaded PDFs (created if missing)
    #[arg(short, long)]
    pub output_dir: PathBuf,

    /// Config file (default: $XDG_CONFIG_HOME/bibp/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum citations processed concurrently (1-100)
    #[arg(short = 't', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub max_threads: Option<u8>,

    /// Maximum retries for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Skip citations whose output file already exists
    #[arg(long)]
    pub skip_existing: bool,

    /// Contact e-mail for polite API pools (enables Unpaywall)
    #[arg(long)]
    pub email: Option<String>,

    /// Print the full run report as JSON
    #[arg(long)]
    pub json: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Input path, with `-` meaning stdin.
    #[must_use]
    pub fn input_file(&self) -> Option<&PathBuf> {
        self.input.as_ref().filter(|path| path.as_os_str() != "-")
    }
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "prism",
    version,
    about = "Incremental column cache and requirement grading for prompt evaluation"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Inspect or clear the column cache of a project
    Cache(CacheArgs),
    /// Find the window of a prompt that best matches a requirement snippet
    Align(AlignArgs),
    /// Print a prompt with requirement spans marked up
    Annotate(AnnotateArgs),
    /// Check a project config file
    Validate(ValidateArgs),
    Version,
}

#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[arg(long, env = "PRISM_CONFIG", default_value = "prism.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: CacheSub,
}

#[derive(Subcommand, Debug)]
pub enum CacheSub {
    /// List cached columns with their row and missing counts
    List {
        #[arg(long)]
        json: bool,
    },
    /// Delete cached columns
    Clear {
        /// Also delete folders, tags, slices, reports and prompts
        #[arg(long)]
        all: bool,
    },
    /// Print one cached column as JSON
    Inspect {
        /// Canonical column name, as shown by `prism cache list`
        column: String,
    },
}

#[derive(Parser, Debug)]
pub struct AlignArgs {
    #[arg(long)]
    pub prompt: String,

    #[arg(long)]
    pub snippet: String,

    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct AnnotateArgs {
    #[arg(long)]
    pub prompt: String,

    /// Requirement as `name=snippet`; repeatable
    #[arg(long = "snippet", value_parser = parse_named_snippet)]
    pub snippets: Vec<(String, String)>,
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    #[arg(long, env = "PRISM_CONFIG", default_value = "prism.yaml")]
    pub config: PathBuf,
}

fn parse_named_snippet(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, snippet)) if !name.trim().is_empty() && !snippet.trim().is_empty() => {
            Ok((name.trim().to_string(), snippet.to_string()))
        }
        _ => Err(format!("expected name=snippet, got '{}'", raw)),
    }
}

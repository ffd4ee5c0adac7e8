use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use graph_indexer::indexer::watcher;
use graph_indexer::{Config, Indexer, Result, Summary};

#[derive(Parser, Debug)]
#[command(name = "graph-indexer")]
#[command(about = "Incremental source-graph indexer for UI, data and logic elements")]
#[command(version)]
#[command(after_long_help = r#"
EXAMPLES:
    # Index the current directory
    graph-indexer

    # Re-extract every file, ignoring modification times
    graph-indexer ./app --full

    # Print the run summary as JSON
    graph-indexer ./app --json

    # Keep the index current while editing
    graph-indexer ./app --watch --jobs 4

CONFIGURATION:
    .graph-indexer.yml, .graph-indexer.yaml or .graph-indexer.json in the
    indexed root. The index is written to <root>/.graph-index.json.
"#)]
pub struct Cli {
    /// Directory to index
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Re-extract unchanged files too
    #[arg(long)]
    pub full: bool,

    /// Re-run after every change under the root
    #[arg(long)]
    pub watch: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Extraction threads (default: available parallelism)
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    pub jobs: Option<u64>,
}

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    let mut config = Config::load(&cli.path)
        .with_context(|| format!("Failed to load configuration for {}", cli.path.display()))?;
    if let Some(jobs) = cli.jobs {
        config.jobs = Some(jobs as usize);
    }

    if cli.watch {
        watcher::watch(&cli.path, config, cli.full, |result| {
            report(result, cli.json);
        })?;
        return Ok(());
    }

    let summary = Indexer::new(&cli.path, config)
        .full(cli.full)
        .run()
        .with_context(|| format!("Failed to index {}", cli.path.display()))?;
    print_summary(&summary, cli.json)
}

fn report(result: &Result<Summary>, json: bool) {
    match result {
        Ok(summary) => {
            if let Err(e) = print_summary(summary, json) {
                tracing::error!("Failed to print summary: {}", e);
            }
        }
        Err(e) => tracing::error!("Indexing failed: {}", e),
    }
}

fn print_summary(summary: &Summary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}

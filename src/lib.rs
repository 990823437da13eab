pub mod config;
pub mod model;
pub mod search;
pub mod storage;

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing::info;

use config::SearchConfig;
use model::types::ContentFragment;
use search::embedding_generator::{BuildPhase, BuildProgress, ProgressFn};
use search::facet_index::FacetConstraint;
use search::orchestrator::SearchOrchestrator;
use search::query::{SearchMode, SearchQuery, SearchResponse};
use storage::index_store::IndexStore;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "mmsearch",
    version,
    about = "Vector, semantic and facet search over document fragments"
)]
pub struct Cli {
    /// TOML config file (defaults to the platform config dir, if present)
    #[arg(long, global = true, env = "MMSEARCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an index from a JSONL file of fragments
    Index {
        /// One fragment per line: {"id", "text", "kind"?, "weight"?, "metadata"?}
        #[arg(long)]
        input: PathBuf,

        /// Output index directory
        #[arg(long)]
        out: PathBuf,

        /// Hide the progress bar
        #[arg(long, default_value_t = false)]
        quiet: bool,
    },
    /// Query a saved index
    Search {
        query: String,

        #[arg(long)]
        index: PathBuf,

        #[arg(long, default_value = "hybrid")]
        mode: SearchMode,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        min_score: Option<f32>,

        /// Facet filter `dimension:facet=value[,value]`; repeat to AND
        #[arg(long = "filter")]
        filters: Vec<FacetConstraint>,

        /// Score multiplier `key=factor` for a fragment kind or metadata key
        #[arg(long = "boost", value_parser = parse_boost)]
        boosts: Vec<(String, f32)>,

        /// Emit JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show statistics for a saved index
    Stats {
        #[arg(long)]
        index: PathBuf,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_boost(raw: &str) -> Result<(String, f32), String> {
    let (key, factor) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=factor, got `{raw}`"))?;
    let factor: f32 = factor
        .trim()
        .parse()
        .map_err(|_| format!("invalid boost factor in `{raw}`"))?;
    if key.trim().is_empty() || !factor.is_finite() || factor < 0.0 {
        return Err(format!("invalid boost `{raw}`"));
    }
    Ok((key.trim().to_string(), factor))
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().or_else(default_config_path);

    match cli.command {
        Commands::Index { input, out, quiet } => {
            let config = SearchConfig::load(config_path.as_deref())?;
            run_index(config, &input, &out, quiet).await
        }
        Commands::Search {
            query,
            index,
            mode,
            limit,
            min_score,
            filters,
            boosts,
            json,
        } => {
            let config = SearchConfig::load(config_path.as_deref())?;
            let query = SearchQuery {
                text: query,
                mode,
                filters,
                limit,
                min_score,
                boosts: boosts.into_iter().collect::<BTreeMap<_, _>>(),
                vector: None,
            };
            run_search(config, &index, query, json).await
        }
        Commands::Stats { index, json } => run_stats(&index, json),
        Commands::Config => {
            let config = SearchConfig::load(config_path.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "mmsearch", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Read fragments from a JSONL file. Blank lines are skipped.
pub fn read_fragments(path: &Path) -> Result<Vec<ContentFragment>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {path:?}"))?;
    let mut fragments = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {path:?}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let fragment: ContentFragment = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid fragment", path.display(), idx + 1))?;
        fragments.push(fragment);
    }
    Ok(fragments)
}

async fn run_index(config: SearchConfig, input: &Path, out: &Path, quiet: bool) -> Result<()> {
    let fragments = read_fragments(input)?;
    info!(fragments = fragments.len(), input = %input.display(), "read fragments");

    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(fragments.len() as u64)
    };
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg:<16} [{bar:30}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    let progress_bar = bar.clone();
    let progress: ProgressFn = Arc::new(move |p: BuildProgress| {
        progress_bar.set_message(p.phase.as_str());
        progress_bar.set_length(p.total as u64);
        progress_bar.set_position(p.completed as u64);
        if p.phase == BuildPhase::Fusion {
            progress_bar.finish_with_message("done");
        }
    });

    let orchestrator = SearchOrchestrator::new(config)?;
    let index = orchestrator.build_index(fragments, Some(progress)).await?;
    bar.finish_and_clear();
    IndexStore::new(out).save(&index)?;

    let stats = index.stats();
    println!(
        "indexed {} fragments into {} ({} embedded, {} failed, {} via fallback)",
        stats.fragment_count,
        out.display(),
        stats.embedded,
        stats.failed_embeddings,
        stats.fallback_used
    );
    Ok(())
}

async fn run_search(
    mut config: SearchConfig,
    dir: &Path,
    query: SearchQuery,
    json: bool,
) -> Result<()> {
    let index = IndexStore::new(dir).load()?;
    if let Some(vector) = index.vector() {
        config.vector.dimension = vector.dimension();
    }
    if let Some(mode) = index.stats().embedding_mode {
        config.embedding.mode = mode;
    }
    let orchestrator = SearchOrchestrator::from_index(config, index)?;
    let response = orchestrator.search(query).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_table(&response);
    }
    Ok(())
}

fn print_table(response: &SearchResponse) {
    if response.hits.is_empty() {
        println!("no results for \"{}\" ({})", response.query, response.mode);
        return;
    }
    println!("{:>4}  {:>8}  {:<4}  {:<16}  TEXT", "#", "SCORE", "SRC", "ID");
    for (rank, hit) in response.hits.iter().enumerate() {
        let sources = format!(
            "{}{}{}",
            if hit.sources.vector { "v" } else { "-" },
            if hit.sources.semantic { "s" } else { "-" },
            if hit.sources.facet { "f" } else { "-" },
        );
        let snippet = search::canonicalize::truncate_to_chars(&hit.text, 60);
        println!(
            "{:>4}  {:>8.4}  {:<4}  {:<16}  {}",
            rank + 1,
            hit.score,
            sources,
            hit.id,
            snippet
        );
    }
    println!(
        "{} of {} candidates, {:.1} ms",
        response.hits.len(),
        response.candidates,
        response.elapsed_ms
    );
}

fn run_stats(dir: &Path, json: bool) -> Result<()> {
    let store = IndexStore::new(dir);
    if !store.exists() {
        bail!("no index found at {}", dir.display());
    }
    let index = store.load()?;
    let facets: Vec<_> = index
        .facet()
        .summary()
        .into_iter()
        .map(|(dimension, facet, values)| {
            json!({ "dimension": dimension.as_str(), "facet": facet, "values": values })
        })
        .collect();
    let report = json!({
        "fragments": index.len(),
        "created_at": index.created_at().to_rfc3339(),
        "vectors": index.vector().map(|v| json!({
            "rows": v.len(),
            "dimension": v.dimension(),
            "embedder": v.embedder_id(),
            "ann": v.uses_ann(),
        })),
        "vocabulary": index.semantic().vocabulary_size(),
        "business_terms": index.semantic().business_term_count(),
        "facets": facets,
        "fusion": index.fusion(),
        "build": index.stats(),
    });
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("fragments:      {}", index.len());
        println!("created:        {}", index.created_at().to_rfc3339());
        match index.vector() {
            Some(v) => println!(
                "vectors:        {} x {} ({}, ann: {})",
                v.len(),
                v.dimension(),
                v.embedder_id(),
                v.uses_ann()
            ),
            None => println!("vectors:        none"),
        }
        println!("vocabulary:     {}", index.semantic().vocabulary_size());
        println!("business terms: {}", index.semantic().business_term_count());
        for (dimension, facet, values) in index.facet().summary() {
            println!("facet:          {dimension}:{facet} ({values} values)");
        }
    }
    Ok(())
}

/// `config.toml` in the platform config dir, when it exists.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "multimodal-search", "mmsearch")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .filter(|path| path.is_file())
}

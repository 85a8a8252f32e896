use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use quarry_core::{App, Config, resolve_config_path};
use quarry_index::{
    FileChange, IndexError, QueryFilters, RetrievalQuery, format_as_context,
};

/// Incremental chunk indexing and budget-aware retrieval.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to `QUARRY_CONFIG`, then config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a change set to the index
    Index {
        /// Repository root that change paths are relative to
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// JSON array of changes (`{"path", "status", "previous_path"}`); `-` reads stdin
        #[arg(long)]
        changes: Option<PathBuf>,
        /// Paths to treat as modified, in addition to `--changes`
        paths: Vec<String>,
        /// Report planned mutations without writing
        #[arg(long)]
        dry_run: bool,
        /// Abort on the first failing file
        #[arg(long)]
        strict: bool,
    },
    /// Retrieve ranked chunks for a query
    Query {
        text: String,
        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,
        /// Token budget (defaults to `retrieval.max_tokens`)
        #[arg(long)]
        max_tokens: Option<usize>,
        /// Minimum raw similarity for candidates
        #[arg(long)]
        min_score: Option<f32>,
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long = "path-prefix")]
        path_prefixes: Vec<String>,
        #[arg(long = "lang")]
        languages: Vec<String>,
        #[arg(long = "chunk-type")]
        chunk_types: Vec<String>,
        #[arg(long)]
        commit_range: Option<String>,
        #[arg(short, long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Show cache statistics and the active vector backend
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Context,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let app = App::build(config).await?;

    let outcome = run(&app, cli.command).await;
    app.shutdown().await;
    outcome
}

async fn run(app: &App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Index {
            root,
            changes,
            paths,
            dry_run,
            strict,
        } => {
            let mut change_set = match changes {
                Some(source) => read_changes(&source).await?,
                None => Vec::new(),
            };
            change_set.extend(paths.iter().map(|p| FileChange::modified(p)));
            if change_set.is_empty() {
                bail!("no changes given; pass --changes or one or more paths");
            }
            run_index(app, root, &change_set, dry_run, strict).await
        }
        Command::Query {
            text,
            top_k,
            max_tokens,
            min_score,
            files,
            path_prefixes,
            languages,
            chunk_types,
            commit_range,
            format,
        } => {
            let query = RetrievalQuery {
                text,
                filters: QueryFilters {
                    files,
                    path_prefixes,
                    languages,
                    chunk_types,
                    commit_range,
                },
                top_k,
                min_score,
            };
            let result = app
                .retriever()?
                .retrieve(&query, app.config.retrieval.budget(max_tokens))
                .await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                OutputFormat::Context => println!("{}", format_as_context(&result)),
            }
            Ok(())
        }
        Command::Stats => {
            let stats = app.cache.stats();
            let out = serde_json::json!({
                "cache": {
                    "count": stats.count,
                    "total_bytes": stats.total_bytes,
                    "hits": stats.hits,
                    "misses": stats.misses,
                    "hit_rate": stats.hit_rate,
                },
                "vector_backend": app.index.backend_name(),
                "collection": app.index.collection(),
                "healthy": app.index.health().await,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    }
}

async fn run_index(
    app: &App,
    root: PathBuf,
    changes: &[FileChange],
    dry_run: bool,
    strict: bool,
) -> anyhow::Result<()> {
    let mut options = app.batch_options();
    options.dry_run |= dry_run;
    options.strict |= strict;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e:#}");
            return;
        }
        tracing::info!("received shutdown signal, finishing current group");
        on_signal.cancel();
    });

    match app.orchestrator(root).process(changes, &options, &cancel).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(IndexError::Aborted { reason, report }) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            bail!("indexing aborted: {reason}")
        }
        Err(e) => Err(e.into()),
    }
}

async fn read_changes(source: &Path) -> anyhow::Result<Vec<FileChange>> {
    let raw = if source.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read changes from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("failed to read {}", source.display()))?
    };
    serde_json::from_str(&raw).context("failed to parse change set")
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_query_filters() {
        let cli = Cli::try_parse_from([
            "quarry", "query", "retry logic", "-k", "5", "--lang", "rust", "--lang", "go",
            "--path-prefix", "src/", "--format", "context",
        ])
        .unwrap();
        let Command::Query {
            text,
            top_k,
            languages,
            path_prefixes,
            format,
            ..
        } = cli.command
        else {
            panic!("expected query");
        };
        assert_eq!(text, "retry logic");
        assert_eq!(top_k, 5);
        assert_eq!(languages, vec!["rust", "go"]);
        assert_eq!(path_prefixes, vec!["src/"]);
        assert_eq!(format, OutputFormat::Context);
    }

    #[test]
    fn parses_index_with_global_config() {
        let cli = Cli::try_parse_from([
            "quarry", "index", "--config", "q.toml", "--dry-run", "a.rs", "b.rs",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("q.toml")));
        let Command::Index { paths, dry_run, .. } = cli.command else {
            panic!("expected index");
        };
        assert!(dry_run);
        assert_eq!(paths, vec!["a.rs", "b.rs"]);
    }

    #[tokio::test]
    async fn reads_change_set_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changes.json");
        std::fs::write(
            &path,
            r#"[{"path": "new.rs", "status": "renamed", "previous_path": "old.rs"},
                {"path": "gone.rs", "status": "deleted"}]"#,
        )
        .unwrap();
        let changes = read_changes(&path).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0], FileChange::renamed("old.rs", "new.rs"));
        assert_eq!(changes[1], FileChange::deleted("gone.rs"));
    }
}

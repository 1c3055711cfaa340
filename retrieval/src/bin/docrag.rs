use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use docrag_retrieval::{Collection, RagConfig, RagEngine, WatchMode};
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docrag")]
#[command(about = "Index document folders and answer questions from them")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load indices, watch collections and run until Ctrl-C (default)
    Serve,
    /// Register a folder as a collection and index it
    Add {
        /// Collection name
        name: String,
        /// Root folder
        path: PathBuf,
        /// File extensions to index, e.g. `--ext md --ext pdf`
        #[arg(long = "ext")]
        extensions: Vec<String>,
        /// Only reindex on request instead of watching
        #[arg(long)]
        manual: bool,
    },
    /// List registered collections
    List,
    /// Rebuild a collection's index
    Index {
        /// Collection name
        name: String,
    },
    /// Remove a collection and its index
    Remove {
        /// Collection name
        name: String,
    },
    /// Enable a collection
    Enable {
        /// Collection name
        name: String,
    },
    /// Disable a collection
    Disable {
        /// Collection name
        name: String,
    },
    /// Show the chunks most similar to a query
    Search {
        query: String,
        #[arg(long)]
        collection: Option<String>,
        #[arg(long)]
        max_results: Option<usize>,
    },
    /// Answer a question from the indexed collections
    Ask {
        question: String,
        #[arg(long)]
        collection: Option<String>,
        #[arg(long)]
        max_results: Option<usize>,
        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RagConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let engine = RagEngine::new(config)
        .await
        .context("failed to initialize engine")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            engine.start().await?;
            info!("Serving; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            engine.shutdown().await;
        }
        Commands::Add {
            name,
            path,
            extensions,
            manual,
        } => {
            let mut collection = Collection::new(name, path);
            if !extensions.is_empty() {
                collection = collection.with_extensions(extensions);
            }
            if manual {
                collection = collection.with_mode(WatchMode::Manual);
            }
            let collection = engine.register_collection(collection).await?;
            let report = engine.index_collection(&collection.name).await?;
            println!(
                "{}: indexed {}/{} files, {} chunks",
                collection.name, report.processed_count, report.total_count, report.chunk_count
            );
        }
        Commands::List => {
            for collection in engine.list_collections().await {
                let last_indexed = collection
                    .last_indexed
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}\t{}\t{}\t{} chunks\tlast indexed {last_indexed}",
                    collection.name,
                    collection.root_path.display(),
                    if collection.enabled { "enabled" } else { "disabled" },
                    collection.chunk_count,
                );
            }
        }
        Commands::Index { name } => {
            let report = engine.index_collection(&name).await?;
            println!(
                "{name}: indexed {}/{} files, {} chunks",
                report.processed_count, report.total_count, report.chunk_count
            );
        }
        Commands::Remove { name } => {
            engine.remove_collection(&name).await?;
            println!("removed {name}");
        }
        Commands::Enable { name } => {
            engine.enable_collection(&name).await?;
            println!("enabled {name}");
        }
        Commands::Disable { name } => {
            engine.disable_collection(&name).await?;
            println!("disabled {name}");
        }
        Commands::Search {
            query,
            collection,
            max_results,
        } => {
            let sources = engine
                .search(&query, collection.as_deref(), max_results)
                .await?;
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
        Commands::Ask {
            question,
            collection,
            max_results,
            stream,
        } => {
            if stream {
                let mut answer = engine
                    .answer_stream(&question, collection.as_deref(), max_results)
                    .await?;
                let mut stdout = std::io::stdout();
                while let Some(delta) = answer.text.next().await {
                    write!(stdout, "{}", delta?)?;
                    stdout.flush()?;
                }
                writeln!(stdout)?;
                print_sources(&answer.sources);
            } else {
                let answer = engine
                    .answer(&question, collection.as_deref(), max_results)
                    .await?;
                println!("{}", answer.answer);
                print_sources(&answer.sources);
            }
        }
    }

    Ok(())
}

fn print_sources(sources: &[docrag_retrieval::Source]) {
    for source in sources {
        println!(
            "  [{:.3}] {}/{}",
            source.score, source.collection, source.source
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["docrag"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn add_command_with_extensions() {
        let cli = Cli::try_parse_from([
            "docrag", "add", "notes", "/tmp/notes", "--ext", "md", "--ext", "pdf", "--manual",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Add {
                name,
                path,
                extensions,
                manual,
            }) => {
                assert_eq!(name, "notes");
                assert_eq!(path, PathBuf::from("/tmp/notes"));
                assert_eq!(extensions, vec!["md".to_string(), "pdf".to_string()]);
                assert!(manual);
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn ask_command_with_global_config() {
        let cli = Cli::try_parse_from([
            "docrag",
            "ask",
            "what is new?",
            "--collection",
            "notes",
            "--config",
            "/etc/docrag.toml",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/etc/docrag.toml")));
        match cli.command {
            Some(Commands::Ask {
                question,
                collection,
                stream,
                ..
            }) => {
                assert_eq!(question, "what is new?");
                assert_eq!(collection.as_deref(), Some("notes"));
                assert!(!stream);
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn invalid_command() {
        let err = Cli::try_parse_from(["docrag", "invalid"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use callflow::config::Config;
use callflow::core::TreeSnapshot;
use callflow::orchestration::RecipeKind;
use callflow::render::{Frames, RenderState};
use callflow::session::{Outcome, Session};
use callflow::transport::SimulatedTransport;
use callflow::{cflog, Result};

/// Callflow - watch asynchronous combinators run as a live status tree
#[derive(Parser, Debug)]
#[command(name = "callflow")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CALLFLOW_DEBUG=1     Enable debug logging (alternative to --debug)\n    CALLFLOW_LOG=<lvl>   Log level: error, warn, info, debug, trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.callflow/callflow.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Configuration file (defaults to ~/.callflow/callflow.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a recipe and print the tree as it changes
    Run {
        /// Recipe to run
        #[arg(value_enum)]
        recipe: RecipeKind,

        /// Print only the final result as JSON
        #[arg(long)]
        json: bool,

        /// Ignore configured delays
        #[arg(long)]
        instant: bool,
    },

    /// List the available recipes
    List,

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    callflow::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            recipe,
            json,
            instant,
        } => {
            let config = if instant { Config::instant() } else { config };
            run_recipe(recipe, config, json)
        }
        Command::List => {
            for kind in RecipeKind::ALL {
                println!("  {:<12} {}", kind.name(), kind.summary());
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run_recipe(kind: RecipeKind, config: Config, json: bool) -> Result<()> {
    cflog!("Run command: recipe={}, json={}", kind, json);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(watch_recipe(kind, config, json))
}

async fn watch_recipe(kind: RecipeKind, config: Config, json: bool) -> Result<()> {
    let transport = SimulatedTransport::placeholder(config.transport_latency());
    let mut session = Session::new(Arc::new(transport), config);
    let handle = session.request_kind(kind)?;
    let id = handle.id();
    let mut tree = handle.tree();

    let outcome = handle.outcome();
    tokio::pin!(outcome);

    let mut frames = Frames::default();
    if !json {
        draw(&mut frames, &tree.borrow_and_update());
    }

    let outcome: Outcome = loop {
        tokio::select! {
            result = &mut outcome => break result?,
            changed = tree.changed() => {
                if changed.is_err() {
                    break (&mut outcome).await?;
                }
                let snapshot = tree.borrow_and_update().clone();
                if !json {
                    draw(&mut frames, &snapshot);
                }
            }
        }
    };

    if json {
        let output = serde_json::json!({
            "run": id.to_string(),
            "recipe": kind.name(),
            "outcome": outcome,
            "tree": session.tree(),
            "diagnostics": session.diagnostics().entries(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    print!("{}", RenderState::capture(&session).render());
    println!("Run {}: {}", id.short(), outcome);
    for value in outcome.values() {
        println!("  {}", value);
    }
    Ok(())
}

fn draw(frames: &mut Frames, snapshot: &TreeSnapshot) {
    if let Some(frame) = frames.frame(snapshot) {
        println!("{}", frame);
    }
}

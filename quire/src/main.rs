//! Quire command-line client.
//!
//! Every command opens the project, applies one operation and closes it
//! again, which flushes queued bodies and saves the binder.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quire_core::config::ProjectConfig;
use quire_core::{DocumentContent, FlatItem, ItemType, Project};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Manage Quire writing projects")]
struct Cli {
    /// Project directory
    #[arg(short, long, global = true, env = "QUIRE_PROJECT", default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new project
    Init,

    /// Print the binder
    Tree {
        /// Include trashed items
        #[arg(long)]
        trash: bool,

        /// Emit JSON instead of an indented listing
        #[arg(long)]
        json: bool,
    },

    /// Add an item and print its id
    Create {
        title: String,

        /// Parent container id (binder root when omitted)
        #[arg(long)]
        parent: Option<String>,

        #[arg(short = 't', long = "type", value_enum, default_value = "text")]
        kind: Kind,
    },

    /// Change an item's title
    Rename { id: String, title: String },

    /// Move an item under another container
    Mv {
        id: String,

        /// New parent id (binder root when omitted)
        #[arg(long)]
        to: Option<String>,
    },

    /// Move an item and its subtree to the trash
    Rm { id: String },

    /// Bring an item back from the trash
    Recover {
        id: String,

        /// Destination container id (binder root when omitted)
        #[arg(long)]
        to: Option<String>,
    },

    /// Count words in one subtree or the whole binder
    Words { id: Option<String> },

    /// Print the body of a text item
    Cat { id: String },

    /// Replace the body of a text item
    Write {
        id: String,

        /// Read the body from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Snapshot the index into the backups directory
    Backup,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Text,
    Folder,
    Research,
}

impl From<Kind> for ItemType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Text => ItemType::Text,
            Kind::Folder => ItemType::Folder,
            Kind::Research => ItemType::Research,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quire=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    debug!(project = %cli.project.display(), "loading configuration");
    let config = ProjectConfig::load(&cli.project)
        .await
        .with_context(|| format!("reading configuration in {}", cli.project.display()))?;

    if let Commands::Init = cli.command {
        let project = Project::init(&cli.project, config)
            .await
            .with_context(|| format!("creating project in {}", cli.project.display()))?;
        project.close().await?;
        println!("initialized project in {}", cli.project.display());
        return Ok(());
    }

    let project = open(&cli.project, config).await?;
    let outcome = run(&project, cli.command).await;
    let closed = project.close().await.context("closing project");
    outcome?;
    closed
}

async fn open(root: &Path, config: ProjectConfig) -> Result<Project> {
    Project::open(root, config)
        .await
        .with_context(|| format!("opening project in {}", root.display()))
}

async fn run(project: &Project, command: Commands) -> Result<()> {
    let tree = project.tree();
    match command {
        Commands::Init => bail!("project is already open"),
        Commands::Tree { trash, json } => {
            let items = tree.get_all(trash)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                print_tree(&items);
            }
        }
        Commands::Create { title, parent, kind } => {
            let id = tree
                .create(&title, parent.as_deref(), kind.into())
                .await
                .with_context(|| format!("creating {title:?}"))?;
            println!("{id}");
        }
        Commands::Rename { id, title } => {
            tree.rename(&id, &title).with_context(|| format!("renaming {id}"))?;
        }
        Commands::Mv { id, to } => {
            tree.move_item(&id, to.as_deref())
                .with_context(|| format!("moving {id}"))?;
        }
        Commands::Rm { id } => {
            tree.delete(&id).with_context(|| format!("trashing {id}"))?;
        }
        Commands::Recover { id, to } => {
            tree.recover(&id, to.as_deref())
                .with_context(|| format!("recovering {id}"))?;
        }
        Commands::Words { id } => {
            let count = tree.word_count(id.as_deref()).await?;
            println!("{} words, {} characters", count.words, count.chars);
        }
        Commands::Cat { id } => {
            let body = project
                .read_document(&id)
                .await
                .with_context(|| format!("reading {id}"))?;
            print!("{}", body.plain_text);
        }
        Commands::Write { id, file } => {
            let text = match file {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut text = String::new();
                    tokio::io::stdin().read_to_string(&mut text).await?;
                    text
                }
            };
            project
                .write_document(&id, DocumentContent::plain(text), true)
                .await
                .with_context(|| format!("writing {id}"))?;
        }
        Commands::Backup => {
            let path = project.backup().await.context("backing up index")?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn print_tree(items: &[FlatItem]) {
    let mut in_trash = false;
    for item in items {
        if item.in_trash && !in_trash {
            println!("-- trash --");
            in_trash = true;
        }
        println!(
            "{}{} [{}] {}",
            "  ".repeat(item.depth),
            item.title,
            item.item_type,
            item.id
        );
    }
}

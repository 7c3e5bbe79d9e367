//! Command line access to a nested set table: check it, fix it, rebuild it
//! from a JSON forest or print it.
//!
//! Settings come from `nestset.toml` (or `--config`) and `NESTSET_*`
//! environment variables; see [`nestset::config::Settings`].

use std::fs;

use clap::{Parser, Subcommand};
use rusqlite::Connection;
use rusqlite::types::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nestset::config::Settings;
use nestset::node::{Node, NodeId, Scope};
use nestset::operations::Tree;
use nestset::persist::{BoundsStore, Persistor};
use nestset::rebuild::parse_forest;
use nestset::{NestsetError, Result};

#[derive(Parser, Debug)]
#[command(name = "nestset")]
#[command(about = "Maintain nested set trees stored in SQLite")]
struct Args {
    /// Settings file (TOML), defaults to ./nestset.toml when present
    #[arg(long)]
    config: Option<String>,

    /// Database file, overrides the settings
    #[arg(long)]
    database: Option<String>,

    /// Scope value, once per scope column in column order
    #[arg(long = "scope")]
    scope: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count integrity errors
    Check {
        /// Print the counts as JSON
        #[arg(long)]
        json: bool,
    },
    /// Recompute bounds from parent pointers
    Fix {
        /// Only fix the descendants of this node
        #[arg(long)]
        root: Option<NodeId>,
    },
    /// Replace the tree structure with a JSON forest
    Rebuild {
        /// File holding the forest, e.g. [{"label": "a", "children": [{}]}]
        file: String,
        /// Remove stored nodes missing from the forest
        #[arg(long)]
        delete: bool,
        /// Only rebuild the descendants of this node
        #[arg(long)]
        root: Option<NodeId>,
    },
    /// Print the tree, one node per line
    Show,
}

// integers are taken as integers, anything else as text
fn scope_value(raw: &str) -> Value {
    match raw.parse::<i64>() {
        Ok(i) => Value::Integer(i),
        Err(_) if raw == "null" => Value::Null,
        Err(_) => Value::Text(raw.to_string()),
    }
}

fn root_node(persistor: &Persistor, scope: &Scope, id: NodeId) -> Result<Node> {
    let record = persistor
        .get(scope, id)?
        .ok_or_else(|| NestsetError::NodeMissing(format!("#{id} is not stored in scope {scope}")))?;
    Ok(Node::from_record(record, scope.clone()))
}

fn run(args: Args) -> Result<()> {
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(database) = args.database {
        settings.database = database;
    }
    let connection = if settings.database == ":memory:" {
        Connection::open_in_memory()?
    } else {
        Connection::open(&settings.database)?
    };
    let persistor = Persistor::new(&connection, settings.table.clone())?;
    let scope = Scope::new(args.scope.iter().map(|s| scope_value(s)).collect());
    let tree = Tree::new(&persistor);

    match args.command {
        Command::Check { json } => {
            let errors = tree.count_errors(&scope)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&errors)?);
            } else {
                println!("{errors}");
                println!("total: {}, broken: {}", errors.total(), errors.is_broken());
            }
        }
        Command::Fix { root } => {
            let changed = persistor.atomically(|p| {
                let tree = Tree::new(p);
                match root {
                    Some(id) => tree.fix_subtree(&mut root_node(p, &scope, id)?),
                    None => tree.fix_tree(&scope),
                }
            })?;
            info!(changed, "fix complete");
            println!("{changed} rows changed");
        }
        Command::Rebuild { file, delete, root } => {
            let text = fs::read_to_string(&file)
                .map_err(|e| NestsetError::Parse(format!("cannot read {file}: {e}")))?;
            let forest = parse_forest(&text)?;
            let changed = persistor.atomically(|p| {
                let tree = Tree::new(p);
                match root {
                    Some(id) => tree.rebuild_subtree(&mut root_node(p, &scope, id)?, &forest, delete),
                    None => tree.rebuild_tree(&scope, &forest, delete),
                }
            })?;
            info!(changed, nodes = forest.len(), "rebuild complete");
            println!("{changed} rows changed");
        }
        Command::Show => {
            for (record, depth) in tree.with_depth(&scope)? {
                println!("{}{}", "  ".repeat(depth.max(0) as usize), record);
            }
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    if let Err(e) = run(Args::parse()) {
        error!(error = %e, "nestset failed");
        eprintln!("{e}");
        std::process::exit(1);
    }
}

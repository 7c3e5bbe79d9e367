//! Settings for the tree table and the command line tool.
//!
//! Settings are read with the `config` crate from an optional TOML file and
//! then from `NESTSET_` environment variables, e.g.
//! `NESTSET_TABLE__NAME=category` or `NESTSET_DATABASE=tree.db`.

use config::{Config, Environment, File};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::error::{NestsetError, Result};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Column layout of the table holding the tree.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub name: String,
    pub id: String,
    pub parent_id: String,
    pub left: String,
    pub right: String,
    pub deleted_at: String,
    pub label: String,
    /// Columns partitioning the table into independent trees.
    pub scope_columns: Vec<String>,
    /// Tombstone rather than remove nodes dropped by a rebuild.
    pub soft_delete: bool,
}
impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: "node".into(),
            id: "id".into(),
            parent_id: "parent_id".into(),
            left: "lft".into(),
            right: "rgt".into(),
            deleted_at: "deleted_at".into(),
            label: "label".into(),
            scope_columns: Vec::new(),
            soft_delete: false,
        }
    }
}
impl TableConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
    pub fn scoped_by(mut self, columns: &[&str]) -> Self {
        self.scope_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }
    pub fn with_soft_delete(mut self, soft_delete: bool) -> Self {
        self.soft_delete = soft_delete;
        self
    }
    /// Every name ends up spliced into SQL text, so only plain identifiers pass.
    pub fn validate(&self) -> Result<()> {
        let fixed = [
            &self.name,
            &self.id,
            &self.parent_id,
            &self.left,
            &self.right,
            &self.deleted_at,
            &self.label,
        ];
        for name in fixed.into_iter().chain(self.scope_columns.iter()) {
            if !IDENTIFIER.is_match(name) {
                return Err(NestsetError::Config(format!(
                    "'{name}' is not a valid identifier"
                )));
            }
        }
        let mut columns: Vec<&String> = fixed[1..].to_vec();
        columns.extend(self.scope_columns.iter());
        columns.sort();
        if columns.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(NestsetError::Config(
                "column names must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path of the SQLite database file, `:memory:` for a throwaway one.
    pub database: String,
    pub table: TableConfig,
}
impl Default for Settings {
    fn default() -> Self {
        Self {
            database: "nestset.db".into(),
            table: TableConfig::default(),
        }
    }
}
impl Settings {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        } else {
            builder = builder.add_source(File::with_name("nestset").required(false));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("NESTSET")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        settings.table.validate()?;
        Ok(settings)
    }
}

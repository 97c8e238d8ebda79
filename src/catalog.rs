//! Schema Catalog
//!
//! Read-only description of the warehouse tables, loaded from the
//! schema-metadata document written by the ETL job.

use crate::error::{Result, TeleSqlError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub references: Option<ForeignKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub row_count_estimate: Option<u64>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn foreign_keys(&self) -> Vec<(&str, &ForeignKeyRef)> {
        self.columns
            .iter()
            .filter_map(|c| c.references.as_ref().map(|r| (c.name.as_str(), r)))
            .collect()
    }
}

// On-disk format of the schema metadata document.

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    dialect: Option<String>,
    tables: Vec<TableDocument>,
}

#[derive(Debug, Deserialize)]
struct TableDocument {
    table_name: String,
    #[serde(default)]
    primary_key: Option<PrimaryKeyDocument>,
    columns: Vec<ColumnDocument>,
    #[serde(default)]
    foreign_keys: Vec<ForeignKeyDocument>,
    #[serde(default)]
    row_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PrimaryKeyDocument {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKeyDocument {
    fn columns(&self) -> Vec<&str> {
        match self {
            PrimaryKeyDocument::Single(c) => vec![c.as_str()],
            PrimaryKeyDocument::Composite(cs) => cs.iter().map(|c| c.as_str()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ColumnDocument {
    name: String,
    data_type: String,
    #[serde(default = "default_nullable")]
    nullable: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ForeignKeyDocument {
    column: String,
    ref_table: String,
    ref_column: String,
}

/// Immutable table/column catalog. Keys are lower-cased table names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub database: Option<String>,
    pub dialect: Option<String>,
    tables: BTreeMap<String, TableDescriptor>,
}

impl SchemaCatalog {
    /// Build a catalog from table descriptors, rejecting duplicate names.
    pub fn new(tables: Vec<TableDescriptor>) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for table in tables {
            let mut seen = HashSet::new();
            for column in &table.columns {
                if !seen.insert(column.name.to_lowercase()) {
                    return Err(TeleSqlError::Catalog(format!(
                        "Duplicate column '{}' in table '{}'",
                        column.name, table.name
                    )));
                }
            }
            let key = table.name.to_lowercase();
            if by_name.contains_key(&key) {
                return Err(TeleSqlError::Catalog(format!("Duplicate table '{}'", table.name)));
            }
            by_name.insert(key, table);
        }
        Ok(Self {
            database: None,
            dialect: None,
            tables: by_name,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let document: CatalogDocument = serde_json::from_str(json)?;
        Self::from_document(document)
    }

    /// Load the schema metadata document from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TeleSqlError::Catalog(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_json_str(&content)?;
        info!(
            "Loaded schema catalog from {} ({} tables)",
            path.display(),
            catalog.len()
        );
        Ok(catalog)
    }

    fn from_document(document: CatalogDocument) -> Result<Self> {
        if document.tables.is_empty() {
            return Err(TeleSqlError::Catalog("Schema metadata lists no tables".to_string()));
        }

        let mut tables = Vec::with_capacity(document.tables.len());
        for table in document.tables {
            let pk: Vec<String> = table
                .primary_key
                .as_ref()
                .map(|pk| pk.columns().iter().map(|c| c.to_lowercase()).collect())
                .unwrap_or_default();

            let mut columns: Vec<ColumnDescriptor> = table
                .columns
                .into_iter()
                .map(|c| ColumnDescriptor {
                    is_primary_key: pk.contains(&c.name.to_lowercase()),
                    name: c.name,
                    data_type: c.data_type,
                    nullable: c.nullable,
                    is_foreign_key: false,
                    references: None,
                })
                .collect();

            for key in &pk {
                if !columns.iter().any(|c| c.name.to_lowercase() == *key) {
                    return Err(TeleSqlError::Catalog(format!(
                        "Primary key '{}' is not a column of '{}'",
                        key, table.table_name
                    )));
                }
            }

            for fk in table.foreign_keys {
                let column = columns
                    .iter_mut()
                    .find(|c| c.name.eq_ignore_ascii_case(&fk.column))
                    .ok_or_else(|| {
                        TeleSqlError::Catalog(format!(
                            "Foreign key column '{}' is not a column of '{}'",
                            fk.column, table.table_name
                        ))
                    })?;
                column.is_foreign_key = true;
                column.references = Some(ForeignKeyRef {
                    table: fk.ref_table,
                    column: fk.ref_column,
                });
            }

            tables.push(TableDescriptor {
                name: table.table_name,
                columns,
                row_count_estimate: table.row_count,
            });
        }

        let mut catalog = Self::new(tables)?;
        catalog.database = document.database;
        catalog.dialect = document.dialect;
        Ok(catalog)
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_lowercase())
    }

    /// Tables in name order
    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Shared reference to the active catalog.
///
/// Requests take a snapshot at start; a refresh swaps in a new catalog
/// without touching the one in-flight requests hold.
#[derive(Debug)]
pub struct CatalogHandle {
    current: RwLock<Arc<SchemaCatalog>>,
}

impl CatalogHandle {
    pub fn new(catalog: SchemaCatalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog)),
        }
    }

    pub fn snapshot(&self) -> Arc<SchemaCatalog> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, catalog: SchemaCatalog) {
        let next = Arc::new(catalog);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Reload from disk. The active catalog stays in place if loading fails.
    pub fn refresh_from(&self, path: impl AsRef<Path>) -> Result<()> {
        let catalog = SchemaCatalog::load(path)?;
        self.replace(catalog);
        Ok(())
    }
}

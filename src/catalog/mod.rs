use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;

use crate::record::TableId;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Table {0} not found")]
    TableNotFound(String),

    #[error("Table {0} already exists")]
    TableExists(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

const CATALOG_FILE: &str = "catalog.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub id: TableId,
    pub num_columns: usize,
    /// Column holding the primary key
    pub key_column: usize,
}

/// The set of tables in a database, persisted as `catalog.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub tables: BTreeMap<String, TableMetadata>,
    /// Table ids are never reused, so stale log records of a dropped table
    /// cannot reach a new one
    pub next_table_id: TableId,
}

impl Catalog {
    /// Load the catalog from `db_path`, or start an empty one
    pub fn load(db_path: &Path) -> CatalogResult<Self> {
        let catalog_path = db_path.join(CATALOG_FILE);
        match fs::read_to_string(&catalog_path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, db_path: &Path) -> CatalogResult<()> {
        let catalog_path = db_path.join(CATALOG_FILE);
        let tmp_path = db_path.join(format!("{CATALOG_FILE}.tmp"));
        let content = serde_json::to_string_pretty(&self)?;
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &catalog_path)?;
        Ok(())
    }

    /// Register a new table and assign it an id
    pub fn add_table(
        &mut self,
        name: &str,
        num_columns: usize,
        key_column: usize,
    ) -> CatalogResult<TableMetadata> {
        if self.tables.contains_key(name) {
            return Err(CatalogError::TableExists(name.to_string()));
        }

        let metadata = TableMetadata {
            name: name.to_string(),
            id: self.next_table_id,
            num_columns,
            key_column,
        };
        self.next_table_id += 1;
        self.tables.insert(name.to_string(), metadata.clone());
        Ok(metadata)
    }

    pub fn remove_table(&mut self, name: &str) -> CatalogResult<TableMetadata> {
        self.tables
            .remove(name)
            .ok_or_else(|| CatalogError::TableNotFound(name.to_string()))
    }

    pub fn get_table(&self, name: &str) -> CatalogResult<&TableMetadata> {
        self.tables
            .get(name)
            .ok_or_else(|| CatalogError::TableNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_reload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::load(temp_dir.path()).unwrap();
        assert!(catalog.tables.is_empty());

        let grades = catalog.add_table("grades", 5, 0).unwrap();
        let other = catalog.add_table("other", 2, 1).unwrap();
        assert_eq!((grades.id, other.id), (0, 1));
        catalog.save(temp_dir.path()).unwrap();

        let reloaded = Catalog::load(temp_dir.path()).unwrap();
        assert_eq!(reloaded, catalog);
        assert_eq!(reloaded.get_table("other").unwrap().key_column, 1);
    }

    #[test]
    fn test_duplicate_and_missing_tables() {
        let mut catalog = Catalog::default();
        catalog.add_table("t", 3, 0).unwrap();
        assert!(matches!(
            catalog.add_table("t", 3, 0),
            Err(CatalogError::TableExists(_))
        ));
        assert!(matches!(
            catalog.get_table("nope"),
            Err(CatalogError::TableNotFound(_))
        ));

        // ids keep growing after a drop
        catalog.remove_table("t").unwrap();
        assert_eq!(catalog.add_table("t", 3, 0).unwrap().id, 1);
    }
}

//! Id-addressed catalog of relations.
//!
//! Contract consumed by the execution core:
//! - read-only during a query (`get_relation` / `get_attribute` / `get_type`);
//! - temporary output relations are registered before execution starts and
//!   dropped at query teardown, never mid-query.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parking_lot::RwLock;
use quarry_common::{AttributeId, QuarryError, RelationId, Result};
use serde::{Deserialize, Serialize};

/// One relation known to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    /// Stable relation id.
    pub id: RelationId,
    /// Human-readable relation name (unique).
    pub name: String,
    /// Column schema.
    pub schema: Schema,
    /// Number of horizontal partitions the relation is sharded into.
    pub num_partitions: usize,
    /// Whether this is a query-scoped temporary relation.
    #[serde(default)]
    pub temporary: bool,
}

impl Relation {
    /// Shared handle to the column schema.
    pub fn schema_ref(&self) -> SchemaRef {
        Arc::new(self.schema.clone())
    }

    /// Field of one attribute by dense column index.
    pub fn attribute(&self, attr_id: AttributeId) -> Result<&Field> {
        if attr_id >= self.schema.fields().len() {
            return Err(QuarryError::Plan(format!(
                "relation '{}' has no attribute {attr_id}",
                self.name
            )));
        }
        Ok(self.schema.field(attr_id))
    }
}

/// Serialized catalog snapshot layout.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogSnapshot {
    relations: Vec<Relation>,
}

/// Id-addressed relation catalog.
///
/// Interior mutability only covers registration and teardown of relations;
/// lookups during execution take the read path.
#[derive(Debug, Default)]
pub struct Catalog {
    relations: RwLock<HashMap<RelationId, Arc<Relation>>>,
    next_id: AtomicU64,
}

impl Catalog {
    /// Constructs an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a permanent relation and assigns its id.
    pub fn add_relation(
        &self,
        name: impl Into<String>,
        schema: Schema,
        num_partitions: usize,
    ) -> Result<RelationId> {
        self.add_relation_inner(name.into(), schema, num_partitions, false)
    }

    /// Registers a query-scoped temporary relation (operator output).
    pub fn add_temporary_relation(
        &self,
        name: impl Into<String>,
        schema: Schema,
        num_partitions: usize,
    ) -> Result<RelationId> {
        self.add_relation_inner(name.into(), schema, num_partitions, true)
    }

    fn add_relation_inner(
        &self,
        name: String,
        schema: Schema,
        num_partitions: usize,
        temporary: bool,
    ) -> Result<RelationId> {
        if num_partitions == 0 {
            return Err(QuarryError::InvalidConfig(format!(
                "relation '{name}' must have at least one partition"
            )));
        }
        let mut relations = self.relations.write();
        if relations.values().any(|r| r.name == name) {
            return Err(QuarryError::InvalidConfig(format!(
                "relation '{name}' already exists"
            )));
        }
        let id = RelationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        relations.insert(
            id,
            Arc::new(Relation {
                id,
                name,
                schema,
                num_partitions,
                temporary,
            }),
        );
        Ok(id)
    }

    /// Looks up a relation by id.
    pub fn get_relation(&self, id: RelationId) -> Result<Arc<Relation>> {
        self.relations
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| QuarryError::Plan(format!("unknown relation: {id}")))
    }

    /// Looks up one attribute field of a relation.
    pub fn get_attribute(&self, rel_id: RelationId, attr_id: AttributeId) -> Result<Field> {
        let relation = self.get_relation(rel_id)?;
        Ok(relation.attribute(attr_id)?.clone())
    }

    /// Looks up the data type of one attribute.
    pub fn get_type(&self, rel_id: RelationId, attr_id: AttributeId) -> Result<DataType> {
        Ok(self.get_attribute(rel_id, attr_id)?.data_type().clone())
    }

    /// Removes a relation (used for temporary-relation teardown).
    pub fn drop_relation(&self, id: RelationId) -> Result<()> {
        self.relations
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| QuarryError::Plan(format!("unknown relation: {id}")))
    }

    /// All relations, ordered by id.
    pub fn relations(&self) -> Vec<Arc<Relation>> {
        let mut out = self.relations.read().values().cloned().collect::<Vec<_>>();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Loads a catalog snapshot from a JSON file.
    pub fn load_from_json(path: &str) -> Result<Self> {
        let payload = fs::read_to_string(path)?;
        let snapshot: CatalogSnapshot = serde_json::from_str(&payload)
            .map_err(|e| QuarryError::InvalidConfig(format!("catalog json decode failed: {e}")))?;
        let catalog = Catalog::new();
        let mut max_id = 0;
        {
            let mut relations = catalog.relations.write();
            for relation in snapshot.relations {
                max_id = max_id.max(relation.id.0 + 1);
                relations.insert(relation.id, Arc::new(relation));
            }
        }
        catalog.next_id.store(max_id, Ordering::Relaxed);
        Ok(catalog)
    }

    /// Saves a catalog snapshot to a JSON file (atomic replace).
    pub fn save_to_json(&self, path: &str) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let snapshot = CatalogSnapshot {
            relations: self.relations().iter().map(|r| (**r).clone()).collect(),
        };
        let payload = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| QuarryError::InvalidConfig(format!("catalog json encode failed: {e}")))?;
        let tmp = format!("{path}.tmp");
        fs::write(&tmp, payload.as_bytes())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{DataType, Field};

    fn two_column_schema() -> Schema {
        Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("x", DataType::Int64, false),
        ])
    }

    #[test]
    fn registers_and_resolves_relations() {
        let catalog = Catalog::new();
        let id = catalog.add_relation("r", two_column_schema(), 4).unwrap();
        let relation = catalog.get_relation(id).unwrap();
        assert_eq!(relation.name, "r");
        assert_eq!(relation.num_partitions, 4);
        assert_eq!(catalog.get_type(id, 1).unwrap(), DataType::Int64);
    }

    #[test]
    fn rejects_unknown_attribute() {
        let catalog = Catalog::new();
        let id = catalog.add_relation("r", two_column_schema(), 1).unwrap();
        assert!(catalog.get_attribute(id, 9).is_err());
    }

    #[test]
    fn rejects_duplicate_names_and_unknown_ids() {
        let catalog = Catalog::new();
        catalog.add_relation("r", two_column_schema(), 1).unwrap();
        assert!(catalog.add_relation("r", two_column_schema(), 1).is_err());
        assert!(catalog.get_relation(RelationId(99)).is_err());
    }

    #[test]
    fn temp_relations_can_be_dropped() {
        let catalog = Catalog::new();
        let id = catalog
            .add_temporary_relation("q1_out", two_column_schema(), 2)
            .unwrap();
        catalog.drop_relation(id).unwrap();
        assert!(catalog.get_relation(id).is_err());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let catalog = Catalog::new();
        catalog.add_relation("r", two_column_schema(), 4).unwrap();
        let dir = std::env::temp_dir().join("quarry_catalog_test");
        let path = dir.join("catalog.json");
        let path = path.to_str().unwrap();
        catalog.save_to_json(path).unwrap();
        let restored = Catalog::load_from_json(path).unwrap();
        assert_eq!(restored.relations().len(), 1);
        assert_eq!(restored.relations()[0].name, "r");
    }
}

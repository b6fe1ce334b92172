//! Knowledge graph data model and in-memory store.
//!
//! Entities are keyed by their unique name and iterate in insertion order;
//! relations are an ordered sequence of plain values. The store is not
//! thread-safe on its own: writers are serialized by the manager.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Entity in the knowledge graph
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Entity {
    /// Unique name of the entity (serves as ID)
    pub name: String,

    /// Type of entity (person, organization, concept, etc.)
    #[serde(rename = "entityType")]
    pub entity_type: String,

    /// Array of observations (facts) about the entity
    pub observations: Vec<String>,
}

/// Relation between two entities
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Relation {
    /// Source entity name
    pub from: String,

    /// Target entity name
    pub to: String,

    /// Type of relation (works_at, knows, related_to, etc.)
    #[serde(rename = "relationType")]
    pub relation_type: String,
}

/// Input for creating an entity
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EntityInput {
    pub name: String,
    #[serde(rename = "entityType")]
    pub entity_type: String,
    pub observations: Vec<String>,
}

/// Input for adding observations to an entity
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservationAddition {
    #[serde(rename = "entityName")]
    pub entity_name: String,
    pub contents: Vec<String>,
}

/// Input for deleting observations from an entity
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservationDeletion {
    #[serde(rename = "entityName")]
    pub entity_name: String,
    pub observations: Vec<String>,
}

/// Complete knowledge graph. Doubles as the on-disk JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct KnowledgeGraph {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl KnowledgeGraph {
    /// Look up an entity by name.
    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.iter().any(|e| e.name == name)
    }

    /// Insert an entity, or overwrite the existing one in place so its
    /// position in iteration order is kept.
    pub fn put(&mut self, entity: Entity) {
        match self.entities.iter_mut().find(|e| e.name == entity.name) {
            Some(slot) => *slot = entity,
            None => self.entities.push(entity),
        }
    }

    /// Remove an entity and every relation where it appears as `from` or
    /// `to`. Unknown names are a no-op.
    pub fn remove_entity(&mut self, name: &str) {
        self.entities.retain(|e| e.name != name);
        self.relations.retain(|r| r.from != name && r.to != name);
    }

    /// Append a relation. Exact duplicates are allowed here; uniqueness is
    /// not part of the relation contract.
    pub fn add_relation(&mut self, relation: Relation) {
        self.relations.push(relation);
    }

    /// Remove every relation matching the predicate, preserving the relative
    /// order of the rest.
    pub fn remove_relations<F>(&mut self, predicate: F)
    where
        F: Fn(&Relation) -> bool,
    {
        self.relations.retain(|r| !predicate(r));
    }

    /// Deep copy of the graph. Mutating the copy never touches the live
    /// store.
    pub fn snapshot(&self) -> KnowledgeGraph {
        self.clone()
    }
}

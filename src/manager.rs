//! Knowledge graph manager: validation, mutation, search.
//!
//! Mutating operations are admitted one at a time, strict FIFO, through a
//! fair async mutex, and each applies its in-memory changes inside a single
//! critical section on the live graph. Reads are not serialized against
//! writers; they observe the live graph at call time. Every successful
//! mutation persists the full graph through the injected storage port, with
//! the serializer still held so saves cannot interleave.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::GraphError;
use crate::graph::{
    Entity, EntityInput, KnowledgeGraph, ObservationAddition, ObservationDeletion, Relation,
};
use crate::storage::GraphStorage;

/// Entity name that upserts on re-creation instead of failing as a
/// duplicate.
const DEFAULT_USER: &str = "default_user";

pub struct KnowledgeGraphManager {
    graph: RwLock<KnowledgeGraph>,
    write_lock: Mutex<()>,
    storage: Arc<dyn GraphStorage>,
}

impl KnowledgeGraphManager {
    pub fn new(storage: Arc<dyn GraphStorage>) -> Self {
        Self {
            graph: RwLock::new(KnowledgeGraph::default()),
            write_lock: Mutex::new(()),
            storage,
        }
    }

    /// Replace the live graph with the persisted one.
    pub async fn load_from_storage(&self) -> Result<(), GraphError> {
        let loaded = self.storage.load().await?;
        let mut graph = self.graph.write().expect("graph lock poisoned");
        *graph = loaded;
        Ok(())
    }

    /// Create entities in input order. An empty (after trimming) name or a
    /// duplicate fails the call, but inputs already scanned stay committed
    /// in memory; `default_user` upserts instead of failing. Persists only
    /// on success. Returns the touched entities in input order.
    pub async fn create_entities(
        &self,
        inputs: Vec<EntityInput>,
    ) -> Result<Vec<Entity>, GraphError> {
        let _serial = self.write_lock.lock().await;
        let (touched, snapshot) = {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            let mut touched = Vec::with_capacity(inputs.len());
            for input in inputs {
                if input.name.trim().is_empty() {
                    return Err(GraphError::EmptyName);
                }
                if let Some(existing) = graph.get(&input.name) {
                    if input.name == DEFAULT_USER {
                        touched.push(existing.clone());
                        continue;
                    }
                    return Err(GraphError::DuplicateEntity(input.name));
                }
                let entity = Entity {
                    name: input.name,
                    entity_type: input.entity_type,
                    observations: input.observations,
                };
                graph.put(entity.clone());
                touched.push(entity);
            }
            (touched, graph.snapshot())
        };
        self.storage.save(&snapshot).await?;
        debug!(count = touched.len(), "entities created");
        Ok(touched)
    }

    /// Look up entities by name. Every missing name is reported, in
    /// argument order.
    pub fn open_nodes(&self, names: &[String]) -> Result<Vec<Entity>, GraphError> {
        let graph = self.graph.read().expect("graph lock poisoned");
        let mut found = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match graph.get(name) {
                Some(entity) => found.push(entity.clone()),
                None => missing.push(name.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(GraphError::EntitiesNotFound(missing));
        }
        Ok(found)
    }

    /// Delete entities and cascade-remove their relations. Unknown names
    /// are no-ops; the call always succeeds.
    pub async fn delete_entities(&self, names: &[String]) -> Result<(), GraphError> {
        let _serial = self.write_lock.lock().await;
        let snapshot = {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            for name in names {
                graph.remove_entity(name);
            }
            graph.snapshot()
        };
        self.storage.save(&snapshot).await?;
        debug!(count = names.len(), "entities deleted");
        Ok(())
    }

    /// Append relations in input order. If any endpoint is missing the call
    /// fails listing every missing name and commits nothing. Duplicate
    /// triples are appended, not deduplicated.
    pub async fn create_relations(
        &self,
        inputs: Vec<Relation>,
    ) -> Result<Vec<Relation>, GraphError> {
        let _serial = self.write_lock.lock().await;
        let snapshot = {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            let missing = missing_names(
                &graph,
                inputs.iter().flat_map(|r| [r.from.as_str(), r.to.as_str()]),
            );
            if !missing.is_empty() {
                return Err(GraphError::EntitiesNotFound(missing));
            }
            for relation in &inputs {
                graph.add_relation(relation.clone());
            }
            graph.snapshot()
        };
        self.storage.save(&snapshot).await?;
        debug!(count = inputs.len(), "relations created");
        Ok(inputs)
    }

    /// Remove every relation exactly matching each input triple. Unmatched
    /// inputs are no-ops; the call always succeeds.
    pub async fn delete_relations(&self, inputs: &[Relation]) -> Result<(), GraphError> {
        let _serial = self.write_lock.lock().await;
        let snapshot = {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            for input in inputs {
                graph.remove_relations(|r| {
                    r.from == input.from
                        && r.to == input.to
                        && r.relation_type == input.relation_type
                });
            }
            graph.snapshot()
        };
        self.storage.save(&snapshot).await?;
        Ok(())
    }

    /// Append observation contents to existing entities. All target names
    /// are validated before anything is appended.
    pub async fn add_observations(
        &self,
        additions: Vec<ObservationAddition>,
    ) -> Result<(), GraphError> {
        let _serial = self.write_lock.lock().await;
        let snapshot = {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            let missing = missing_names(
                &graph,
                additions.iter().map(|a| a.entity_name.as_str()),
            );
            if !missing.is_empty() {
                return Err(GraphError::EntitiesNotFound(missing));
            }
            for addition in additions {
                if let Some(entity) = graph.get_mut(&addition.entity_name) {
                    entity.observations.extend(addition.contents);
                }
            }
            graph.snapshot()
        };
        self.storage.save(&snapshot).await?;
        Ok(())
    }

    /// Remove observation strings from existing entities. Every occurrence
    /// of a listed value is removed; values not present are no-ops. All
    /// target names are validated before anything is removed.
    pub async fn delete_observations(
        &self,
        deletions: &[ObservationDeletion],
    ) -> Result<(), GraphError> {
        let _serial = self.write_lock.lock().await;
        let snapshot = {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            let missing = missing_names(
                &graph,
                deletions.iter().map(|d| d.entity_name.as_str()),
            );
            if !missing.is_empty() {
                return Err(GraphError::EntitiesNotFound(missing));
            }
            for deletion in deletions {
                if let Some(entity) = graph.get_mut(&deletion.entity_name) {
                    entity
                        .observations
                        .retain(|obs| !deletion.observations.contains(obs));
                }
            }
            graph.snapshot()
        };
        self.storage.save(&snapshot).await?;
        Ok(())
    }

    /// Deep-copied snapshot of the whole graph.
    pub fn read_graph(&self) -> KnowledgeGraph {
        self.graph.read().expect("graph lock poisoned").snapshot()
    }

    /// Tokenized OR-search over names, types and observations.
    ///
    /// The query is split on whitespace and case-folded; an entity matches
    /// when any token is a substring of its name, its type, or any
    /// observation. An empty token set matches everything. Results keep the
    /// store's insertion order.
    pub fn search_nodes(&self, query: &str) -> Vec<Entity> {
        let lowered = query.to_lowercase();
        let tokens: Vec<&str> = lowered.split_whitespace().collect();

        let graph = self.graph.read().expect("graph lock poisoned");
        if tokens.is_empty() {
            return graph.entities.clone();
        }

        graph
            .entities
            .iter()
            .filter(|entity| {
                let name = entity.name.to_lowercase();
                let entity_type = entity.entity_type.to_lowercase();
                let observations: Vec<String> =
                    entity.observations.iter().map(|o| o.to_lowercase()).collect();
                tokens.iter().any(|&token| {
                    name.contains(token)
                        || entity_type.contains(token)
                        || observations.iter().any(|obs| obs.contains(token))
                })
            })
            .cloned()
            .collect()
    }
}

/// Names from `names` that are absent from the graph, deduplicated,
/// first-occurrence order.
fn missing_names<'a>(
    graph: &KnowledgeGraph,
    names: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();
    for name in names {
        if !graph.contains(name) && !missing.iter().any(|m| m == name) {
            missing.push(name.to_string());
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::Mutex as StdMutex;

    /// In-memory storage fake. Records every saved snapshot and can be
    /// primed to fail saves.
    #[derive(Default)]
    struct FakeStorage {
        saved: StdMutex<Vec<KnowledgeGraph>>,
        fail_save: bool,
    }

    impl FakeStorage {
        fn failing() -> Self {
            Self {
                saved: StdMutex::new(Vec::new()),
                fail_save: true,
            }
        }

        fn save_count(&self) -> usize {
            self.saved.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GraphStorage for FakeStorage {
        async fn load(&self) -> Result<KnowledgeGraph, StorageError> {
            Ok(KnowledgeGraph::default())
        }

        async fn save(&self, graph: &KnowledgeGraph) -> Result<(), StorageError> {
            if self.fail_save {
                return Err(StorageError::PermissionDenied {
                    path: "/locked/graph.json".into(),
                });
            }
            self.saved.lock().unwrap().push(graph.clone());
            Ok(())
        }
    }

    fn manager() -> (Arc<FakeStorage>, KnowledgeGraphManager) {
        let storage = Arc::new(FakeStorage::default());
        (storage.clone(), KnowledgeGraphManager::new(storage))
    }

    fn input(name: &str, entity_type: &str, observations: &[&str]) -> EntityInput {
        EntityInput {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            observations: observations.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn relation(from: &str, to: &str, kind: &str) -> Relation {
        Relation {
            from: from.to_string(),
            to: to.to_string(),
            relation_type: kind.to_string(),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// No relation may reference a missing entity.
    fn assert_no_dangling(graph: &KnowledgeGraph) {
        for rel in &graph.relations {
            assert!(graph.contains(&rel.from), "dangling from: {}", rel.from);
            assert!(graph.contains(&rel.to), "dangling to: {}", rel.to);
        }
    }

    #[tokio::test]
    async fn test_create_then_open_round_trips() {
        let (_, mgr) = manager();
        let created = mgr
            .create_entities(vec![input("alice", "person", &["likes coffee", "b"])])
            .await
            .unwrap();
        assert_eq!(created.len(), 1);

        let opened = mgr.open_nodes(&names(&["alice"])).unwrap();
        assert_eq!(opened, created);
        assert_eq!(opened[0].observations, vec!["likes coffee", "b"]);
    }

    #[tokio::test]
    async fn test_duplicate_entity_rejected_and_count_unchanged() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input("alice", "person", &[])])
            .await
            .unwrap();

        let err = mgr
            .create_entities(vec![input("alice", "robot", &[])])
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateEntity(ref n) if n == "alice"));
        assert_eq!(mgr.read_graph().entities.len(), 1);
        assert_eq!(mgr.read_graph().get("alice").unwrap().entity_type, "person");
    }

    #[tokio::test]
    async fn test_default_user_upserts_unchanged() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input("default_user", "person", &["original"])])
            .await
            .unwrap();

        let touched = mgr
            .create_entities(vec![input("default_user", "other", &["replacement"])])
            .await
            .unwrap();

        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].entity_type, "person");
        assert_eq!(touched[0].observations, vec!["original"]);
        assert_eq!(mgr.read_graph().entities.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_or_whitespace_name_rejected() {
        let (_, mgr) = manager();
        for bad in ["", "   ", "\t\n"] {
            let err = mgr
                .create_entities(vec![input(bad, "person", &[])])
                .await
                .unwrap_err();
            assert!(matches!(err, GraphError::EmptyName));
        }
        assert!(mgr.read_graph().entities.is_empty());
    }

    #[tokio::test]
    async fn test_batch_commits_inputs_before_failure_without_persisting() {
        let (storage, mgr) = manager();
        mgr.create_entities(vec![input("bob", "person", &[])])
            .await
            .unwrap();
        assert_eq!(storage.save_count(), 1);

        let err = mgr
            .create_entities(vec![
                input("alice", "person", &[]),
                input("bob", "person", &[]),
                input("carol", "person", &[]),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateEntity(ref n) if n == "bob"));

        // alice (scanned before the failure) is committed in memory, carol
        // is not, and the failed call saved nothing.
        let graph = mgr.read_graph();
        assert!(graph.contains("alice"));
        assert!(!graph.contains("carol"));
        assert_eq!(storage.save_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_entities_cascades_and_tolerates_unknown() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![
            input("alice", "person", &[]),
            input("bob", "person", &[]),
            input("carol", "person", &[]),
        ])
        .await
        .unwrap();
        mgr.create_relations(vec![
            relation("alice", "bob", "knows"),
            relation("bob", "alice", "knows"),
            relation("bob", "carol", "knows"),
        ])
        .await
        .unwrap();

        mgr.delete_entities(&names(&["alice", "ghost"])).await.unwrap();

        let graph = mgr.read_graph();
        assert!(!graph.contains("alice"));
        assert_eq!(graph.relations, vec![relation("bob", "carol", "knows")]);
        assert_no_dangling(&graph);
    }

    #[tokio::test]
    async fn test_create_relations_lists_missing_endpoints_once_and_adds_nothing() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input("alice", "person", &[])])
            .await
            .unwrap();

        let err = mgr
            .create_relations(vec![
                relation("alice", "ghost", "knows"),
                relation("ghost", "phantom", "haunts"),
            ])
            .await
            .unwrap_err();
        match err {
            GraphError::EntitiesNotFound(missing) => {
                assert_eq!(missing, names(&["ghost", "phantom"]));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(mgr.read_graph().relations.is_empty());
    }

    #[tokio::test]
    async fn test_create_relations_appends_duplicates() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input("a", "t", &[]), input("b", "t", &[])])
            .await
            .unwrap();

        mgr.create_relations(vec![relation("a", "b", "knows")]).await.unwrap();
        mgr.create_relations(vec![relation("a", "b", "knows")]).await.unwrap();

        assert_eq!(mgr.read_graph().relations.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_relations_removes_all_matching_triples() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input("a", "t", &[]), input("b", "t", &[])])
            .await
            .unwrap();
        mgr.create_relations(vec![
            relation("a", "b", "knows"),
            relation("a", "b", "knows"),
            relation("a", "b", "likes"),
        ])
        .await
        .unwrap();

        mgr.delete_relations(&[relation("a", "b", "knows")]).await.unwrap();

        assert_eq!(mgr.read_graph().relations, vec![relation("a", "b", "likes")]);

        // Deleting a triple with no match is a no-op, not an error.
        mgr.delete_relations(&[relation("b", "a", "knows")]).await.unwrap();
        assert_eq!(mgr.read_graph().relations.len(), 1);
    }

    #[tokio::test]
    async fn test_add_observations_appends_in_order_with_duplicates() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input("alice", "person", &["one"])])
            .await
            .unwrap();

        mgr.add_observations(vec![ObservationAddition {
            entity_name: "alice".to_string(),
            contents: vec!["two".to_string(), "one".to_string()],
        }])
        .await
        .unwrap();

        let opened = mgr.open_nodes(&names(&["alice"])).unwrap();
        assert_eq!(opened[0].observations, vec!["one", "two", "one"]);
    }

    #[tokio::test]
    async fn test_add_observations_validates_all_names_first() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input("alice", "person", &[])])
            .await
            .unwrap();

        let err = mgr
            .add_observations(vec![
                ObservationAddition {
                    entity_name: "alice".to_string(),
                    contents: vec!["should not land".to_string()],
                },
                ObservationAddition {
                    entity_name: "ghost".to_string(),
                    contents: vec!["x".to_string()],
                },
                ObservationAddition {
                    entity_name: "ghost".to_string(),
                    contents: vec!["y".to_string()],
                },
            ])
            .await
            .unwrap_err();
        match err {
            GraphError::EntitiesNotFound(missing) => assert_eq!(missing, names(&["ghost"])),
            other => panic!("unexpected error: {other:?}"),
        }
        // Nothing committed, including the valid first addition.
        assert!(mgr.open_nodes(&names(&["alice"])).unwrap()[0]
            .observations
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_observations_removes_every_occurrence_in_order() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input(
            "alice",
            "person",
            &["keep1", "drop", "keep2", "drop", "keep3"],
        )])
        .await
        .unwrap();

        mgr.delete_observations(&[ObservationDeletion {
            entity_name: "alice".to_string(),
            observations: vec!["drop".to_string(), "not present".to_string()],
        }])
        .await
        .unwrap();

        let opened = mgr.open_nodes(&names(&["alice"])).unwrap();
        assert_eq!(opened[0].observations, vec!["keep1", "keep2", "keep3"]);
    }

    #[tokio::test]
    async fn test_open_nodes_reports_missing_in_argument_order() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input("alice", "person", &[])])
            .await
            .unwrap();

        let err = mgr
            .open_nodes(&names(&["ghost", "alice", "phantom", "ghost"]))
            .unwrap_err();
        match err {
            GraphError::EntitiesNotFound(missing) => {
                // Argument order, duplicates kept.
                assert_eq!(missing, names(&["ghost", "phantom", "ghost"]));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_nodes_returns_entities_in_argument_order() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![
            input("alice", "person", &[]),
            input("bob", "person", &[]),
        ])
        .await
        .unwrap();

        let opened = mgr.open_nodes(&names(&["bob", "alice"])).unwrap();
        let opened_names: Vec<_> = opened.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(opened_names, vec!["bob", "alice"]);
    }

    #[tokio::test]
    async fn test_read_graph_snapshot_is_detached() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![input("alice", "person", &["original"])])
            .await
            .unwrap();

        let mut copy = mgr.read_graph();
        copy.get_mut("alice").unwrap().observations.push("tampered".to_string());
        copy.remove_entity("alice");

        assert_eq!(
            mgr.read_graph().get("alice").unwrap().observations,
            vec!["original"]
        );
    }

    #[tokio::test]
    async fn test_search_empty_query_returns_all_in_insertion_order() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![
            input("zeta", "person", &[]),
            input("alpha", "person", &[]),
        ])
        .await
        .unwrap();

        for query in ["", "   \t "] {
            let found = mgr.search_nodes(query);
            let found_names: Vec<_> = found.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(found_names, vec!["zeta", "alpha"]);
        }
    }

    #[tokio::test]
    async fn test_search_tokens_or_across_fields_case_insensitive() {
        let (_, mgr) = manager();
        mgr.create_entities(vec![
            input("Alice", "Person", &["drinks Espresso daily"]),
            input("acme", "Company", &["sells anvils"]),
            input("widget", "Product", &[]),
        ])
        .await
        .unwrap();

        // Token matches an observation of one entity and the type of another.
        let found = mgr.search_nodes("ESPRESSO company");
        let found_names: Vec<_> = found.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(found_names, vec!["Alice", "acme"]);

        // Substring of a name.
        let found = mgr.search_nodes("lic");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Alice");

        // No token matches anything.
        assert!(mgr.search_nodes("zzz qqq").is_empty());
    }

    #[tokio::test]
    async fn test_save_failure_surfaces_but_mutation_stays_applied() {
        let storage = Arc::new(FakeStorage::failing());
        let mgr = KnowledgeGraphManager::new(storage);

        let err = mgr
            .create_entities(vec![input("alice", "person", &[])])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::Storage(StorageError::PermissionDenied { .. })
        ));

        // In-memory state diverges from disk by design.
        assert!(mgr.read_graph().contains("alice"));

        // The serializer was released on the error path: the next write
        // goes through (and fails on save again) instead of deadlocking.
        let err = mgr.delete_entities(&names(&["alice"])).await.unwrap_err();
        assert!(matches!(err, GraphError::Storage(_)));
        assert!(!mgr.read_graph().contains("alice"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutations_preserve_invariants() {
        let (_, mgr) = manager();
        let mgr = Arc::new(mgr);

        mgr.create_entities(vec![input("hub", "node", &[])]).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let mgr = mgr.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("node-{i}");
                mgr.create_entities(vec![input(&name, "node", &[])])
                    .await
                    .unwrap();
                mgr.create_relations(vec![relation(&name, "hub", "links_to")])
                    .await
                    .unwrap();
                if i % 4 == 0 {
                    mgr.delete_entities(&[name]).await.unwrap();
                }
            }));
        }
        for result in join_all(tasks).await {
            result.unwrap();
        }

        let graph = mgr.read_graph();
        assert_no_dangling(&graph);

        let mut seen = std::collections::HashSet::new();
        for entity in &graph.entities {
            assert!(seen.insert(entity.name.clone()), "duplicate: {}", entity.name);
        }
        // 1 hub + 16 created - 4 deleted
        assert_eq!(graph.entities.len(), 13);
        assert_eq!(graph.relations.len(), 12);
    }

    #[tokio::test]
    async fn test_each_successful_mutation_persists_full_snapshot() {
        let (storage, mgr) = manager();
        mgr.create_entities(vec![input("alice", "person", &[])])
            .await
            .unwrap();
        mgr.create_entities(vec![input("bob", "person", &[])])
            .await
            .unwrap();
        mgr.delete_entities(&names(&["alice"])).await.unwrap();

        let saved = storage.saved.lock().unwrap();
        assert_eq!(saved.len(), 3);
        assert_eq!(saved[0].entities.len(), 1);
        assert_eq!(saved[1].entities.len(), 2);
        assert_eq!(saved[2].entities.len(), 1);
        assert!(saved[2].contains("bob"));
    }
}

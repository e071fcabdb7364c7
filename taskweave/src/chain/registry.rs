//! Store-backed chain definitions: validated at write time, addressed by id
//! in the KV space under `chain:<id>`.

use chain_spec_core::ChainDefinition;

use crate::store::{Store, StoreError};

use super::ChainError;

const KEY_PREFIX: &str = "chain:";

fn chain_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Persists a chain after validating it, so the store never holds a chain
/// the engine would reject.
pub async fn store_chain(store: &dyn Store, chain: &ChainDefinition) -> Result<(), ChainError> {
    chain_spec_core::validate_chain(chain)?;
    let value = serde_json::to_value(chain)
        .map_err(|e| ChainError::Internal(format!("encode chain: {e}")))?;
    store
        .kv_set(&chain_key(&chain.id), value)
        .await
        .map_err(|e| ChainError::Internal(e.to_string()))
}

/// Loads a chain by id. `NotFound` passes through for callers to map.
pub async fn load_chain(store: &dyn Store, id: &str) -> Result<ChainDefinition, StoreError> {
    let value = store.kv_get(&chain_key(id)).await?;
    serde_json::from_value(value).map_err(|e| StoreError::Internal(format!("decode chain: {e}")))
}

pub async fn delete_chain(store: &dyn Store, id: &str) -> Result<(), StoreError> {
    store.kv_delete(&chain_key(id)).await
}

/// All stored chains, sorted by id.
pub async fn list_chains(store: &dyn Store) -> Result<Vec<ChainDefinition>, StoreError> {
    let entries = store.kv_list(KEY_PREFIX).await?;
    let mut chains = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let chain: ChainDefinition = serde_json::from_value(value)
            .map_err(|e| StoreError::Internal(format!("decode chain {key}: {e}")))?;
        chains.push(chain);
    }
    chains.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chain_spec_core::{TaskDefinition, TaskHandler, TaskTransition};

    fn chain(id: &str) -> ChainDefinition {
        ChainDefinition {
            id: id.into(),
            description: String::new(),
            token_limit: 0,
            debug: false,
            tasks: vec![TaskDefinition {
                id: "t1".into(),
                description: String::new(),
                handler: TaskHandler::Noop,
                input_var: String::new(),
                system_instruction: String::new(),
                execute_config: None,
                hook: None,
                prompt_template: String::new(),
                output_template: String::new(),
                valid_conditions: Default::default(),
                retry_on_failure: 0,
                print: false,
                compose: None,
                transition: TaskTransition::default_to("end"),
            }],
        }
    }

    #[tokio::test]
    async fn store_and_load_round_trip() {
        let store = InMemoryStore::new();
        store_chain(&store, &chain("c1")).await.unwrap();
        let loaded = load_chain(&store, "c1").await.unwrap();
        assert_eq!(loaded.id, "c1");
        assert_eq!(loaded.tasks.len(), 1);
    }

    /// **Scenario**: an invalid chain never reaches the store.
    #[tokio::test]
    async fn invalid_chain_rejected_at_write() {
        let store = InMemoryStore::new();
        let mut bad = chain("c1");
        bad.tasks.clear();
        assert!(matches!(
            store_chain(&store, &bad).await,
            Err(ChainError::Validation(_))
        ));
        assert!(matches!(
            load_chain(&store, "c1").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_is_sorted_and_delete_removes() {
        let store = InMemoryStore::new();
        store_chain(&store, &chain("beta")).await.unwrap();
        store_chain(&store, &chain("alpha")).await.unwrap();
        let ids: Vec<String> = list_chains(&store).await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);

        delete_chain(&store, "alpha").await.unwrap();
        assert_eq!(list_chains(&store).await.unwrap().len(), 1);
    }
}

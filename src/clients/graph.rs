use std::collections::{HashMap, HashSet};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, aio::MultiplexedConnection};

use crate::clients::traits::AncestorGraph;

/// Parent/child trigger relations kept as Redis sets.
pub struct RedisAncestorGraph {
    connection: MultiplexedConnection,
}

impl RedisAncestorGraph {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    async fn parents(&self, trigger_id: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.connection.clone();
        let parents: Vec<String> = conn
            .smembers(format!("trigger-parents:{}", trigger_id))
            .await
            .map_err(|e| anyhow!("Failed to read parents of {}: {}", trigger_id, e))?;
        Ok(parents)
    }

    /// Loads every ancestor of the trigger with its direct parents.
    async fn load_ancestry(&self, trigger_id: &str) -> Result<HashMap<String, Vec<String>>, Error> {
        let mut ancestry = HashMap::new();
        let mut pending = vec![trigger_id.to_string()];

        while let Some(current) = pending.pop() {
            if ancestry.contains_key(&current) {
                continue;
            }
            let parents = self.parents(&current).await?;
            pending.extend(parents.iter().cloned());
            ancestry.insert(current, parents);
        }

        Ok(ancestry)
    }
}

/// Longest path to a root. Depths are cached per node so shared ancestors
/// are walked once.
fn depth_of(
    trigger_id: &str,
    ancestry: &HashMap<String, Vec<String>>,
    path: &mut HashSet<String>,
    depths: &mut HashMap<String, usize>,
) -> usize {
    if let Some(depth) = depths.get(trigger_id) {
        return *depth;
    }
    if !path.insert(trigger_id.to_string()) {
        return 0;
    }

    let mut depth = 0;
    for parent in ancestry.get(trigger_id).into_iter().flatten() {
        depth = depth.max(depth_of(parent, ancestry, path, depths) + 1);
    }

    path.remove(trigger_id);
    depths.insert(trigger_id.to_string(), depth);
    depth
}

fn max_depth_in(trigger_id: &str, ancestry: &HashMap<String, Vec<String>>) -> usize {
    depth_of(trigger_id, ancestry, &mut HashSet::new(), &mut HashMap::new())
}

fn chains_to(
    trigger_id: &str,
    ancestry: &HashMap<String, Vec<String>>,
    path: &mut Vec<String>,
    chains: &mut Vec<Vec<String>>,
) {
    let parents = ancestry.get(trigger_id).cloned().unwrap_or_default();

    if parents.is_empty() {
        if !path.is_empty() {
            let mut chain = path.clone();
            chain.reverse();
            chains.push(chain);
        }
        return;
    }

    for parent in parents {
        if path.contains(&parent) {
            continue;
        }
        path.push(parent.clone());
        chains_to(&parent, ancestry, path, chains);
        path.pop();
    }
}

#[async_trait]
impl AncestorGraph for RedisAncestorGraph {
    async fn max_depth(&self, trigger_id: &str) -> Result<usize> {
        let ancestry = self.load_ancestry(trigger_id).await?;
        Ok(max_depth_in(trigger_id, &ancestry))
    }

    async fn ancestor_chains(&self, trigger_id: &str) -> Result<Vec<Vec<String>>> {
        let ancestry = self.load_ancestry(trigger_id).await?;
        let mut chains = Vec::new();
        chains_to(trigger_id, &ancestry, &mut Vec::new(), &mut chains);
        Ok(chains)
    }

    async fn children(&self, trigger_id: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let children: Vec<String> = conn
            .smembers(format!("trigger-children:{}", trigger_id))
            .await
            .map_err(|e| anyhow!("Failed to read children of {}: {}", trigger_id, e))?;
        Ok(children)
    }

    async fn set_parents(&self, trigger_id: &str, parents: &[String]) -> Result<()> {
        let previous = self.parents(trigger_id).await?;
        let parents_key = format!("trigger-parents:{}", trigger_id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&parents_key).ignore();
        for parent in &previous {
            pipe.srem(format!("trigger-children:{}", parent), trigger_id)
                .ignore();
        }
        for parent in parents {
            pipe.sadd(&parents_key, parent).ignore();
            pipe.sadd(format!("trigger-children:{}", parent), trigger_id)
                .ignore();
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to set parents of {}: {}", trigger_id, e))?;
        Ok(())
    }
}

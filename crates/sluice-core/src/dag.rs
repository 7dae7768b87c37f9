//! Pure graph operations over the DAG structure frozen onto pipeline runs.
//!
//! A pipeline is captured as `task id -> { allowed_next }`. Predecessor
//! sets, reachability, and topological layering are computed lazily from
//! that snapshot; nothing here touches the database.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use sha2::{Digest, Sha256};
use sluice_db::models::{StructureNode, StructureSnapshot, TaskDef};

/// Build a structure snapshot from loaded task definitions.
pub fn build_snapshot(defs: &[TaskDef]) -> StructureSnapshot {
    defs.iter()
        .map(|def| {
            (
                def.id.clone(),
                StructureNode {
                    allowed_next: def.allowed_next.0.clone(),
                },
            )
        })
        .collect()
}

/// Every `allowed_next` target that does not exist in the snapshot.
pub fn missing_targets(snapshot: &StructureSnapshot) -> Vec<String> {
    let mut missing = BTreeSet::new();
    for node in snapshot.values() {
        for next in &node.allowed_next {
            if !snapshot.contains_key(next) {
                missing.insert(next.clone());
            }
        }
    }
    missing.into_iter().collect()
}

/// Direct predecessors of a task: every node whose `allowed_next` contains
/// it.
pub fn predecessors(snapshot: &StructureSnapshot, task_id: &str) -> Vec<String> {
    snapshot
        .iter()
        .filter(|(_, node)| node.allowed_next.iter().any(|n| n == task_id))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Whether `target` is reachable from any of `sources` by following
/// `allowed_next` edges. A source equal to the target counts as reachable.
pub fn reachable_from_any<'a, I>(snapshot: &StructureSnapshot, sources: I, target: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let mut queue: VecDeque<&str> = sources.into_iter().collect();
    let mut seen: BTreeSet<&str> = queue.iter().copied().collect();

    while let Some(current) = queue.pop_front() {
        if current == target {
            return true;
        }
        if let Some(node) = snapshot.get(current) {
            for next in &node.allowed_next {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
    false
}

/// Set of tasks reachable from the entries, entries included.
pub fn reachable_set(snapshot: &StructureSnapshot, entries: &[String]) -> BTreeSet<String> {
    let mut seen: BTreeSet<String> = entries
        .iter()
        .filter(|e| snapshot.contains_key(*e))
        .cloned()
        .collect();
    let mut queue: VecDeque<String> = seen.iter().cloned().collect();

    while let Some(current) = queue.pop_front() {
        if let Some(node) = snapshot.get(&current) {
            for next in &node.allowed_next {
                if snapshot.contains_key(next) && seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
    }
    seen
}

/// Topological layering from the entry tasks: layer 0 is the entries, each
/// subsequent layer holds tasks whose reachable predecessors all appear in
/// earlier layers. Used for dry-run execution plans.
pub fn layers(snapshot: &StructureSnapshot, entries: &[String]) -> Vec<Vec<String>> {
    let reachable = reachable_set(snapshot, entries);
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut result: Vec<Vec<String>> = Vec::new();

    let mut current: Vec<String> = entries
        .iter()
        .filter(|e| snapshot.contains_key(*e))
        .cloned()
        .collect();
    current.sort();
    current.dedup();

    while !current.is_empty() {
        placed.extend(current.iter().cloned());
        result.push(current);

        let mut next: Vec<String> = reachable
            .iter()
            .filter(|n| !placed.contains(*n))
            .filter(|n| {
                predecessors(snapshot, n)
                    .iter()
                    .all(|p| placed.contains(p) || !reachable.contains(p))
            })
            .cloned()
            .collect();

        if next.is_empty() && placed.len() < reachable.len() {
            // Cycle remnant: surface the leftovers in one final layer so the
            // plan still accounts for every reachable task.
            next = reachable.difference(&placed).cloned().collect();
        }
        current = next;
    }

    result
}

/// Deterministic hash of the pipeline structure, used as the pipeline
/// version. 16 hex chars over the canonical `(task, allowed_next)` list.
pub fn structure_hash(snapshot: &StructureSnapshot) -> String {
    let mut hasher = Sha256::new();
    for (id, node) in snapshot {
        hasher.update(id.as_bytes());
        hasher.update(b"->");
        for next in &node.allowed_next {
            hasher.update(next.as_bytes());
            hasher.update(b",");
        }
        hasher.update(b";");
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Convenience constructor for snapshots in tests and dry runs.
pub fn snapshot_from_edges(edges: &[(&str, &[&str])]) -> StructureSnapshot {
    edges
        .iter()
        .map(|(id, next)| {
            (
                (*id).to_owned(),
                StructureNode {
                    allowed_next: next.iter().map(|n| (*n).to_owned()).collect(),
                },
            )
        })
        .collect()
}

/// Tasks with no outgoing edges in the snapshot.
pub fn sink_tasks(snapshot: &StructureSnapshot) -> BTreeSet<String> {
    snapshot
        .iter()
        .filter(|(_, node)| node.allowed_next.is_empty())
        .map(|(id, _)| id.clone())
        .collect()
}

/// Helper for building snapshots incrementally.
pub fn node(allowed_next: &[&str]) -> StructureNode {
    StructureNode {
        allowed_next: allowed_next.iter().map(|n| (*n).to_owned()).collect(),
    }
}

/// Map from task id to its direct predecessors, for callers that need the
/// whole inverted graph at once.
pub fn predecessor_map(snapshot: &StructureSnapshot) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (id, node) in snapshot {
        for next in &node.allowed_next {
            map.entry(next.clone()).or_default().push(id.clone());
        }
    }
    map
}

//! Healing: reconstruction of a consistent runtime state from partial truth.
//!
//! After a catastrophic event (worker loss, restart, vanished intermediates)
//! only `dependencies`, `dependents`, and the residency map can be trusted.
//! [`heal`] rebuilds the frontier sets from those, [`heal_missing_data`] is
//! the targeted variant for a known set of lost keys, and [`validate_state`]
//! checks the invariants that must hold between events. Healing is
//! idempotent: healing a healed state changes nothing.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::errors::SchedulerError;
use crate::graph::{Key, WorkerAddr};

/// Output of a [`heal`] pass.
#[derive(Debug, Clone, PartialEq)]
pub struct HealResult {
    /// Keys no longer contributing to any requested output
    pub released: HashSet<Key>,
    /// Keys anywhere in the pipeline
    pub in_play: HashSet<Key>,
    /// Requested outputs already resident in memory
    pub finished_results: HashSet<Key>,
}

fn unrunnable(
    key: &Key,
    dependencies: &HashMap<Key, HashSet<Key>>,
    in_memory: &HashSet<Key>,
    waiting: &HashMap<Key, HashSet<Key>>,
    released: &HashSet<Key>,
) -> bool {
    released.contains(key)
        || in_memory.contains(key)
        || waiting.get(key).is_some_and(|w| !w.is_empty())
        || !dependencies
            .get(key)
            .map_or(true, |deps| deps.iter().all(|d| in_memory.contains(d)))
}

/// Make a possibly broken runtime state consistent again.
///
/// `waiting` and `waiting_data` are rebuilt from scratch by walking the
/// dependency graph down from the output keys (those with no dependents),
/// stopping at resident keys. Keys the walk never reaches are released.
/// Stacks and processing sets are purged of anything released, resident,
/// still waiting, or missing a resident dependency; survivors lose their
/// stale `waiting` entries because they are runnable or running.
pub fn heal(
    dependencies: &HashMap<Key, HashSet<Key>>,
    dependents: &HashMap<Key, HashSet<Key>>,
    in_memory: &HashSet<Key>,
    stacks: &mut HashMap<WorkerAddr, Vec<Key>>,
    processing: &mut HashMap<WorkerAddr, HashSet<Key>>,
    waiting: &mut HashMap<Key, HashSet<Key>>,
    waiting_data: &mut HashMap<Key, HashSet<Key>>,
) -> Result<HealResult, SchedulerError> {
    let outputs: HashSet<Key> = dependents
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(key, _)| key.clone())
        .collect();

    waiting.clear();
    waiting_data.clear();

    let mut released: HashSet<Key> = dependents.keys().cloned().collect();
    let mut visited: HashSet<Key> = HashSet::new();
    let mut stack: Vec<Key> = outputs.iter().cloned().collect();
    while let Some(key) = stack.pop() {
        if !visited.insert(key.clone()) {
            continue;
        }
        released.remove(&key);
        if in_memory.contains(&key) {
            continue;
        }
        let empty = HashSet::new();
        let deps = dependencies.get(&key).unwrap_or(&empty);
        stack.extend(deps.iter().filter(|d| !visited.contains(*d)).cloned());
        waiting.insert(
            key,
            deps.iter()
                .filter(|d| !in_memory.contains(*d))
                .cloned()
                .collect(),
        );
    }

    for (key, deps) in dependents {
        if released.contains(key) {
            continue;
        }
        waiting_data.insert(
            key.clone(),
            deps.iter()
                .filter(|d| !released.contains(*d) && !in_memory.contains(*d))
                .cloned()
                .collect(),
        );
    }

    for worker_stack in stacks.values_mut() {
        worker_stack.retain(|key| !unrunnable(key, dependencies, in_memory, waiting, &released));
    }
    for worker_processing in processing.values_mut() {
        worker_processing
            .retain(|key| !unrunnable(key, dependencies, in_memory, waiting, &released));
    }

    // survivors are runnable or running, not waiting
    for key in stacks.values().flatten().chain(processing.values().flatten()) {
        if let Some(pending) = waiting.remove(key) {
            debug_assert!(pending.is_empty());
        }
    }

    let finished_results: HashSet<Key> = outputs.intersection(in_memory).cloned().collect();

    let mut in_play: HashSet<Key> = in_memory.clone();
    in_play.extend(waiting.keys().cloned());
    for worker_stack in stacks.values() {
        in_play.extend(worker_stack.iter().cloned());
    }
    for worker_processing in processing.values() {
        in_play.extend(worker_processing.iter().cloned());
    }

    let result = HealResult {
        released,
        in_play,
        finished_results,
    };
    validate_state(
        dependencies,
        dependents,
        waiting,
        waiting_data,
        in_memory,
        stacks,
        processing,
        Some(&result.finished_results),
        &result.released,
        &result.in_play,
        false,
    )?;
    Ok(result)
}

/// Rewind runtime state so a set of lost keys gets recomputed.
///
/// Each missing key leaves `in_play`, then is threaded back through
/// `waiting`/`waiting_data` by walking down its dependency chain until an
/// in-play or resident ancestor is reached.
pub fn heal_missing_data(
    dependencies: &HashMap<Key, HashSet<Key>>,
    dependents: &HashMap<Key, HashSet<Key>>,
    in_memory: &HashSet<Key>,
    in_play: &mut HashSet<Key>,
    waiting: &mut HashMap<Key, HashSet<Key>>,
    waiting_data: &mut HashMap<Key, HashSet<Key>>,
    missing: &HashSet<Key>,
) {
    debug!(?missing, "healing missing data");
    for key in missing {
        in_play.remove(key);
    }

    fn ensure_key(
        key: &Key,
        dependencies: &HashMap<Key, HashSet<Key>>,
        dependents: &HashMap<Key, HashSet<Key>>,
        in_memory: &HashSet<Key>,
        in_play: &mut HashSet<Key>,
        waiting: &mut HashMap<Key, HashSet<Key>>,
        waiting_data: &mut HashMap<Key, HashSet<Key>>,
    ) {
        if in_play.contains(key) {
            return;
        }
        let empty = HashSet::new();
        let deps = dependencies.get(key).unwrap_or(&empty).clone();
        for dep in &deps {
            ensure_key(
                dep,
                dependencies,
                dependents,
                in_memory,
                in_play,
                waiting,
                waiting_data,
            );
            waiting_data.entry(dep.clone()).or_default().insert(key.clone());
        }
        waiting.insert(
            key.clone(),
            deps.iter()
                .filter(|d| !in_memory.contains(*d))
                .cloned()
                .collect(),
        );
        waiting_data.insert(
            key.clone(),
            dependents
                .get(key)
                .unwrap_or(&empty)
                .iter()
                .filter(|d| in_play.contains(*d) && !in_memory.contains(*d))
                .cloned()
                .collect(),
        );
        in_play.insert(key.clone());
    }

    for key in missing {
        ensure_key(
            key,
            dependencies,
            dependents,
            in_memory,
            in_play,
            waiting,
            waiting_data,
        );
    }
}

/// Check the invariants that must hold between events.
///
/// Walks every key reachable from the outputs and verifies membership
/// exclusivity (`allow_overlap` relaxes it to at-least-one for transient
/// states), the play/released partition, waiting correctness for resident
/// keys, and resident dependencies for stacked/processing keys.
#[allow(clippy::too_many_arguments)]
pub fn validate_state(
    dependencies: &HashMap<Key, HashSet<Key>>,
    dependents: &HashMap<Key, HashSet<Key>>,
    waiting: &HashMap<Key, HashSet<Key>>,
    waiting_data: &HashMap<Key, HashSet<Key>>,
    in_memory: &HashSet<Key>,
    stacks: &HashMap<WorkerAddr, Vec<Key>>,
    processing: &HashMap<WorkerAddr, HashSet<Key>>,
    finished_results: Option<&HashSet<Key>>,
    released: &HashSet<Key>,
    in_play: &HashSet<Key>,
    allow_overlap: bool,
) -> Result<(), SchedulerError> {
    let in_stacks: HashSet<&Key> = stacks.values().flatten().collect();
    let in_processing: HashSet<&Key> = processing.values().flatten().collect();
    let outputs: HashSet<&Key> = dependents
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(key, _)| key)
        .collect();

    let fail = |message: String| Err(SchedulerError::InconsistentState(message));

    let mut visited: HashSet<&Key> = HashSet::new();
    let mut stack: Vec<&Key> = outputs.iter().copied().collect();
    while let Some(key) = stack.pop() {
        if !visited.insert(key) {
            continue;
        }

        let memberships = [
            waiting.contains_key(key),
            in_stacks.contains(key),
            in_processing.contains(key),
            in_memory.contains(key),
            released.contains(key),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if allow_overlap {
            if memberships < 1 {
                return fail(format!("key '{key}' belongs to no state"));
            }
        } else if memberships != 1 {
            return fail(format!(
                "key '{key}' belongs to {memberships} states instead of exactly one"
            ));
        }

        if released.contains(key) == in_play.contains(key) {
            return fail(format!("key '{key}' breaks the play/released partition"));
        }

        if in_memory.contains(key) {
            if waiting.get(key).is_some_and(|w| !w.is_empty()) {
                return fail(format!("resident key '{key}' still waits on dependencies"));
            }
            for dependent in dependents.get(key).into_iter().flatten() {
                if waiting.get(dependent).is_some_and(|w| w.contains(key)) {
                    return fail(format!(
                        "dependent '{dependent}' waits on resident key '{key}'"
                    ));
                }
            }
        }

        if in_stacks.contains(key) || in_processing.contains(key) {
            for dep in dependencies.get(key).into_iter().flatten() {
                if !in_memory.contains(dep) {
                    return fail(format!(
                        "key '{key}' is queued or running but dependency '{dep}' is not resident"
                    ));
                }
            }
            if waiting.get(key).is_some_and(|w| !w.is_empty()) {
                return fail(format!("queued key '{key}' still waits on dependencies"));
            }
        }

        if let Some(finished) = finished_results {
            if finished.contains(key) && !in_memory.contains(key) {
                return fail(format!("finished result '{key}' is not resident"));
            }
            if outputs.contains(key) && in_memory.contains(key) && !finished.contains(key) {
                return fail(format!("resident output '{key}' missing from finished results"));
            }
        }

        stack.extend(
            dependencies
                .get(key)
                .into_iter()
                .flatten()
                .filter(|dep| !visited.contains(*dep)),
        );
    }

    for (key, consumers) in waiting_data {
        if let Some(deps) = dependents.get(key) {
            if !consumers.is_subset(deps) {
                return fail(format!(
                    "waiting_data for '{key}' names keys that are not dependents"
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyset(keys: &[&str]) -> HashSet<Key> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn addr(host: &str) -> WorkerAddr {
        WorkerAddr::new(host, 8000)
    }

    /// Linear chain x -> y -> z as (dependencies, dependents).
    fn chain() -> (HashMap<Key, HashSet<Key>>, HashMap<Key, HashSet<Key>>) {
        let dependencies = HashMap::from([
            ("x".to_string(), keyset(&[])),
            ("y".to_string(), keyset(&["x"])),
            ("z".to_string(), keyset(&["y"])),
        ]);
        let dependents = HashMap::from([
            ("x".to_string(), keyset(&["y"])),
            ("y".to_string(), keyset(&["z"])),
            ("z".to_string(), keyset(&[])),
        ]);
        (dependencies, dependents)
    }

    #[test]
    fn test_heal_rebuilds_waiting_from_scratch() {
        let (dependencies, dependents) = chain();
        let in_memory = keyset(&["x"]);
        let mut stacks = HashMap::from([(addr("alice"), vec![])]);
        let mut processing = HashMap::from([(addr("alice"), HashSet::new())]);
        // garbage in the frontier sets
        let mut waiting = HashMap::from([("z".to_string(), keyset(&["x", "bogus"]))]);
        let mut waiting_data = HashMap::from([("bogus".to_string(), keyset(&["z"]))]);

        let result = heal(
            &dependencies,
            &dependents,
            &in_memory,
            &mut stacks,
            &mut processing,
            &mut waiting,
            &mut waiting_data,
        )
        .unwrap();

        assert_eq!(waiting.get("y"), Some(&keyset(&[])));
        assert_eq!(waiting.get("z"), Some(&keyset(&["y"])));
        assert!(!waiting.contains_key("x"));
        assert!(result.released.is_empty());
        assert_eq!(result.in_play, keyset(&["x", "y", "z"]));
        assert!(result.finished_results.is_empty());
    }

    #[test]
    fn test_heal_releases_unreachable_keys() {
        // y is resident, so x (its only consumer gone) is never visited
        let dependencies = HashMap::from([
            ("x".to_string(), keyset(&[])),
            ("y".to_string(), keyset(&["x"])),
        ]);
        let dependents = HashMap::from([
            ("x".to_string(), keyset(&["y"])),
            ("y".to_string(), keyset(&[])),
        ]);
        let in_memory = keyset(&["y"]);
        let mut stacks = HashMap::from([(addr("alice"), vec![])]);
        let mut processing = HashMap::from([(addr("alice"), HashSet::new())]);
        let mut waiting = HashMap::new();
        let mut waiting_data = HashMap::new();

        let result = heal(
            &dependencies,
            &dependents,
            &in_memory,
            &mut stacks,
            &mut processing,
            &mut waiting,
            &mut waiting_data,
        )
        .unwrap();

        assert_eq!(result.released, keyset(&["x"]));
        assert_eq!(result.finished_results, keyset(&["y"]));
        assert_eq!(result.in_play, keyset(&["y"]));
    }

    #[test]
    fn test_heal_purges_dead_entries_from_stacks_and_processing() {
        let (dependencies, dependents) = chain();
        let in_memory = keyset(&[]);
        // z cannot run: y is not resident. y cannot run either: x is gone.
        let mut stacks = HashMap::from([(addr("alice"), vec!["z".to_string()])]);
        let mut processing =
            HashMap::from([(addr("alice"), keyset(&["y"]))]);
        let mut waiting = HashMap::new();
        let mut waiting_data = HashMap::new();

        let result = heal(
            &dependencies,
            &dependents,
            &in_memory,
            &mut stacks,
            &mut processing,
            &mut waiting,
            &mut waiting_data,
        )
        .unwrap();

        assert!(stacks[&addr("alice")].is_empty());
        assert!(processing[&addr("alice")].is_empty());
        // x is a leaf, runnable straight away
        assert_eq!(waiting.get("x"), Some(&keyset(&[])));
        assert_eq!(result.in_play, keyset(&["x", "y", "z"]));
    }

    #[test]
    fn test_heal_keeps_runnable_stack_entries() {
        let (dependencies, dependents) = chain();
        let in_memory = keyset(&["x"]);
        let mut stacks = HashMap::from([(addr("alice"), vec!["y".to_string()])]);
        let mut processing = HashMap::from([(addr("alice"), HashSet::new())]);
        let mut waiting = HashMap::new();
        let mut waiting_data = HashMap::new();

        heal(
            &dependencies,
            &dependents,
            &in_memory,
            &mut stacks,
            &mut processing,
            &mut waiting,
            &mut waiting_data,
        )
        .unwrap();

        assert_eq!(stacks[&addr("alice")], vec!["y".to_string()]);
        // a stacked key holds no waiting entry
        assert!(!waiting.contains_key("y"));
    }

    #[test]
    fn test_heal_is_idempotent() {
        let (dependencies, dependents) = chain();
        let in_memory = keyset(&["x"]);
        let mut stacks = HashMap::from([(addr("alice"), vec!["y".to_string()])]);
        let mut processing = HashMap::from([(addr("alice"), HashSet::new())]);
        let mut waiting = HashMap::from([("z".to_string(), keyset(&["stale"]))]);
        let mut waiting_data = HashMap::new();

        let first = heal(
            &dependencies,
            &dependents,
            &in_memory,
            &mut stacks,
            &mut processing,
            &mut waiting,
            &mut waiting_data,
        )
        .unwrap();
        let stacks_after = stacks.clone();
        let waiting_after = waiting.clone();
        let waiting_data_after = waiting_data.clone();

        let second = heal(
            &dependencies,
            &dependents,
            &in_memory,
            &mut stacks,
            &mut processing,
            &mut waiting,
            &mut waiting_data,
        )
        .unwrap();

        assert_eq!(first, second);
        assert_eq!(stacks, stacks_after);
        assert_eq!(waiting, waiting_after);
        assert_eq!(waiting_data, waiting_data_after);
    }

    #[test]
    fn test_heal_missing_data_rethreads_lost_keys() {
        let (dependencies, dependents) = chain();
        // z still wants y; y's data vanished, x was collected long ago
        let in_memory = keyset(&[]);
        let mut in_play = keyset(&["z"]);
        let mut waiting = HashMap::from([("z".to_string(), keyset(&["y"]))]);
        let mut waiting_data = HashMap::from([("y".to_string(), keyset(&["z"]))]);
        let missing = keyset(&["y"]);

        heal_missing_data(
            &dependencies,
            &dependents,
            &in_memory,
            &mut in_play,
            &mut waiting,
            &mut waiting_data,
            &missing,
        );

        // y waits on a recomputed x; x is a fresh leaf
        assert_eq!(waiting.get("y"), Some(&keyset(&["x"])));
        assert_eq!(waiting.get("x"), Some(&keyset(&[])));
        assert!(waiting_data.get("x").is_some_and(|w| w.contains("y")));
        assert!(in_play.contains("x") && in_play.contains("y"));
    }

    #[test]
    fn test_heal_missing_data_stops_at_resident_ancestors() {
        let (dependencies, dependents) = chain();
        let in_memory = keyset(&["x"]);
        let mut in_play = keyset(&["x", "z"]);
        let mut waiting = HashMap::from([("z".to_string(), keyset(&["y"]))]);
        let mut waiting_data = HashMap::from([
            ("x".to_string(), keyset(&[])),
            ("y".to_string(), keyset(&["z"])),
        ]);
        let missing = keyset(&["y"]);

        heal_missing_data(
            &dependencies,
            &dependents,
            &in_memory,
            &mut in_play,
            &mut waiting,
            &mut waiting_data,
            &missing,
        );

        // x is resident, so y is immediately runnable again
        assert_eq!(waiting.get("y"), Some(&keyset(&[])));
        assert!(!waiting.contains_key("x"));
        assert!(waiting_data.get("x").is_some_and(|w| w.contains("y")));
    }

    #[test]
    fn test_validate_state_rejects_overlap() {
        let (dependencies, dependents) = chain();
        let in_memory = keyset(&["x"]);
        // x is both resident and waiting
        let waiting = HashMap::from([
            ("x".to_string(), keyset(&[])),
            ("y".to_string(), keyset(&[])),
            ("z".to_string(), keyset(&["y"])),
        ]);
        let stacks = HashMap::new();
        let processing = HashMap::new();
        let in_play = keyset(&["x", "y", "z"]);

        let strict = validate_state(
            &dependencies,
            &dependents,
            &waiting,
            &HashMap::new(),
            &in_memory,
            &stacks,
            &processing,
            None,
            &HashSet::new(),
            &in_play,
            false,
        );
        assert!(strict.is_err());

        let relaxed = validate_state(
            &dependencies,
            &dependents,
            &waiting,
            &HashMap::new(),
            &in_memory,
            &stacks,
            &processing,
            None,
            &HashSet::new(),
            &in_play,
            true,
        );
        assert!(relaxed.is_ok());
    }

    #[test]
    fn test_validate_state_rejects_queued_key_without_resident_deps() {
        let (dependencies, dependents) = chain();
        let in_memory = keyset(&["x"]);
        let waiting = HashMap::from([("y".to_string(), keyset(&[]))]);
        // z queued while y is not resident
        let stacks = HashMap::from([(addr("alice"), vec!["z".to_string()])]);
        let processing = HashMap::new();
        let in_play = keyset(&["x", "y", "z"]);

        let result = validate_state(
            &dependencies,
            &dependents,
            &waiting,
            &HashMap::new(),
            &in_memory,
            &stacks,
            &processing,
            None,
            &HashSet::new(),
            &in_play,
            false,
        );
        assert!(result.is_err());
    }
}

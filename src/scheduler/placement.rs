//! Worker placement policy.
//!
//! `decide_worker` and `assign_many_tasks` are pure functions over the
//! scheduler's collections: communication-minimising first, load-balancing
//! second. Restrictions are matched on hostnames, so any worker on an
//! allowed host qualifies.

use std::collections::{HashMap, HashSet};

use crate::errors::SchedulerError;
use crate::graph::{Key, WorkerAddr};

/// Choose the worker that should run `key`.
///
/// Candidates are the workers already holding a dependency of `key` (all
/// workers when it has none), optionally filtered by the key's host
/// restrictions. Among the candidates, the one that minimises the bytes to
/// transfer wins; stack length breaks ties, then the address ordering.
///
/// Restriction handling: if filtering the candidates empties them, the full
/// worker set filtered by the restriction is tried; if that is empty too,
/// keys in `loose_restrictions` fall back to unrestricted placement and
/// everything else is a [`SchedulerError::NoValidWorker`].
pub fn decide_worker(
    dependencies: &HashMap<Key, HashSet<Key>>,
    stacks: &HashMap<WorkerAddr, Vec<Key>>,
    who_has: &HashMap<Key, HashSet<WorkerAddr>>,
    restrictions: &HashMap<Key, HashSet<String>>,
    loose_restrictions: &HashSet<Key>,
    nbytes: &HashMap<Key, u64>,
    key: &Key,
) -> Result<WorkerAddr, SchedulerError> {
    let no_deps = HashSet::new();
    let deps = dependencies.get(key).unwrap_or(&no_deps);

    let mut candidates: HashSet<&WorkerAddr> = deps
        .iter()
        .flat_map(|dep| who_has.get(dep).into_iter().flatten())
        .collect();
    if candidates.is_empty() {
        candidates = stacks.keys().collect();
    }

    if let Some(hosts) = restrictions.get(key) {
        let mut allowed: HashSet<&WorkerAddr> = candidates
            .iter()
            .copied()
            .filter(|w| hosts.contains(&w.host))
            .collect();
        if allowed.is_empty() {
            allowed = stacks.keys().filter(|w| hosts.contains(&w.host)).collect();
        }
        if allowed.is_empty() {
            if loose_restrictions.contains(key) {
                return decide_worker(
                    dependencies,
                    stacks,
                    who_has,
                    &HashMap::new(),
                    &HashSet::new(),
                    nbytes,
                    key,
                );
            }
            return Err(SchedulerError::NoValidWorker {
                key: key.clone(),
                restrictions: hosts.iter().cloned().collect(),
            });
        }
        candidates = allowed;
    }

    if candidates.is_empty() || stacks.is_empty() {
        return Err(SchedulerError::NoWorkers);
    }

    candidates
        .into_iter()
        .map(|worker| {
            let commbytes: u64 = deps
                .iter()
                .filter(|dep| {
                    !who_has
                        .get(*dep)
                        .map_or(false, |holders| holders.contains(worker))
                })
                .map(|dep| nbytes.get(dep).copied().unwrap_or(0))
                .sum();
            let queued = stacks.get(worker).map_or(0, Vec::len);
            (commbytes, queued, worker)
        })
        .min()
        .map(|(_, _, worker)| worker.clone())
        .ok_or(SchedulerError::NoWorkers)
}

/// Seed many freshly runnable keys onto worker stacks at once.
///
/// Keys split into leaves (no dependencies, no restrictions) and ready keys.
/// Leaves spread round-robin across the workers in `ceil(n / workers)`
/// chunks, starting at a rotating offset so successive seedings do not all
/// land on the same worker first; ready keys go through [`decide_worker`]
/// one by one. Mutates `waiting` and `stacks` in place and returns the
/// per-worker diff of newly stacked keys, which have yet to be dispatched.
#[allow(clippy::too_many_arguments)]
pub fn assign_many_tasks(
    dependencies: &HashMap<Key, HashSet<Key>>,
    waiting: &mut HashMap<Key, HashSet<Key>>,
    keyorder: &HashMap<Key, (u64, usize)>,
    who_has: &HashMap<Key, HashSet<WorkerAddr>>,
    stacks: &mut HashMap<WorkerAddr, Vec<Key>>,
    restrictions: &HashMap<Key, HashSet<String>>,
    loose_restrictions: &HashSet<Key>,
    nbytes: &HashMap<Key, u64>,
    round_robin: &mut usize,
    keys: Vec<Key>,
) -> Result<HashMap<WorkerAddr, Vec<Key>>, SchedulerError> {
    let mut leaves = Vec::new();
    let mut ready = Vec::new();
    for key in keys {
        let prior = waiting.remove(&key);
        debug_assert!(
            prior.map_or(true, |w| w.is_empty()),
            "assigned key still had pending dependencies"
        );
        let no_deps = dependencies.get(&key).map_or(true, HashSet::is_empty);
        if no_deps && !restrictions.contains_key(&key) {
            leaves.push(key);
        } else {
            ready.push(key);
        }
    }

    if stacks.is_empty() {
        return Err(SchedulerError::NoWorkers);
    }

    // older generations first, then intra-graph rank
    leaves.sort_by_key(|key| keyorder.get(key).copied());

    let mut workers: Vec<WorkerAddr> = stacks.keys().cloned().collect();
    workers.sort();
    let offset = *round_robin % workers.len();
    workers.rotate_left(offset);
    *round_robin += 1;

    let mut new_stacks: HashMap<WorkerAddr, Vec<Key>> = HashMap::new();

    if !leaves.is_empty() {
        let chunk = leaves.len().div_ceil(workers.len());
        for (i, worker) in workers.iter().enumerate() {
            let lo = i * chunk;
            if lo >= leaves.len() {
                break;
            }
            let hi = (lo + chunk).min(leaves.len());
            // reversed so the LIFO stack pops the highest-priority leaf first
            let batch: Vec<Key> = leaves[lo..hi].iter().rev().cloned().collect();
            new_stacks
                .entry(worker.clone())
                .or_default()
                .extend(batch.iter().cloned());
            stacks
                .get_mut(worker)
                .expect("worker listed in stacks")
                .extend(batch);
        }
    }

    for key in ready {
        let worker = decide_worker(
            dependencies,
            stacks,
            who_has,
            restrictions,
            loose_restrictions,
            nbytes,
            &key,
        )?;
        new_stacks
            .entry(worker.clone())
            .or_default()
            .push(key.clone());
        stacks
            .get_mut(&worker)
            .expect("decide_worker returns a live worker")
            .push(key);
    }

    Ok(new_stacks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str) -> WorkerAddr {
        WorkerAddr::new(host, 8000)
    }

    fn keyset(keys: &[&str]) -> HashSet<Key> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_prefers_worker_already_holding_the_dependency() {
        let dependencies = HashMap::from([("b".to_string(), keyset(&["a"]))]);
        let stacks = HashMap::from([
            (addr("alice"), vec!["z".to_string()]),
            (addr("bob"), vec![]),
        ]);
        let who_has = HashMap::from([("a".to_string(), HashSet::from([addr("alice")]))]);
        let nbytes = HashMap::from([("a".to_string(), 100)]);

        let worker = decide_worker(
            &dependencies,
            &stacks,
            &who_has,
            &HashMap::new(),
            &HashSet::new(),
            &nbytes,
            &"b".to_string(),
        )
        .unwrap();
        assert_eq!(worker, addr("alice"));
    }

    #[test]
    fn test_breaks_ties_by_shorter_stack() {
        let dependencies = HashMap::from([("b".to_string(), keyset(&["a"]))]);
        let stacks = HashMap::from([
            (addr("alice"), vec!["z".to_string()]),
            (addr("bob"), vec![]),
        ]);
        let who_has = HashMap::from([(
            "a".to_string(),
            HashSet::from([addr("alice"), addr("bob")]),
        )]);
        let nbytes = HashMap::from([("a".to_string(), 100)]);

        let worker = decide_worker(
            &dependencies,
            &stacks,
            &who_has,
            &HashMap::new(),
            &HashSet::new(),
            &nbytes,
            &"b".to_string(),
        )
        .unwrap();
        assert_eq!(worker, addr("bob"));
    }

    #[test]
    fn test_minimises_communicated_bytes_over_occupancy() {
        // c = f(a, b) with a (1 byte) on alice and b (1000 bytes) on bob:
        // running on bob only moves one byte
        let dependencies = HashMap::from([("c".to_string(), keyset(&["a", "b"]))]);
        let stacks = HashMap::from([(addr("alice"), vec![]), (addr("bob"), vec![])]);
        let who_has = HashMap::from([
            ("a".to_string(), HashSet::from([addr("alice")])),
            ("b".to_string(), HashSet::from([addr("bob")])),
        ]);
        let nbytes = HashMap::from([("a".to_string(), 1), ("b".to_string(), 1000)]);

        let worker = decide_worker(
            &dependencies,
            &stacks,
            &who_has,
            &HashMap::new(),
            &HashSet::new(),
            &nbytes,
            &"c".to_string(),
        )
        .unwrap();
        assert_eq!(worker, addr("bob"));
    }

    #[test]
    fn test_restrictions_filter_by_host() {
        let dependencies = HashMap::from([("b".to_string(), keyset(&["a"]))]);
        let stacks = HashMap::from([(addr("alice"), vec![]), (addr("charlie"), vec![])]);
        let who_has = HashMap::from([("a".to_string(), HashSet::from([addr("alice")]))]);
        let restrictions = HashMap::from([(
            "b".to_string(),
            HashSet::from(["charlie".to_string()]),
        )]);

        let worker = decide_worker(
            &dependencies,
            &stacks,
            &who_has,
            &restrictions,
            &HashSet::new(),
            &HashMap::new(),
            &"b".to_string(),
        )
        .unwrap();
        assert_eq!(worker, addr("charlie"));
    }

    #[test]
    fn test_unsatisfiable_restriction_errors_without_loose() {
        let stacks = HashMap::from([(addr("alice"), vec![])]);
        let restrictions =
            HashMap::from([("k".to_string(), HashSet::from(["charlie".to_string()]))]);

        let result = decide_worker(
            &HashMap::new(),
            &stacks,
            &HashMap::new(),
            &restrictions,
            &HashSet::new(),
            &HashMap::new(),
            &"k".to_string(),
        );
        assert!(matches!(
            result,
            Err(SchedulerError::NoValidWorker { .. })
        ));
    }

    #[test]
    fn test_loose_restriction_falls_back_to_any_worker() {
        let stacks = HashMap::from([(addr("alice"), vec![])]);
        let restrictions =
            HashMap::from([("k".to_string(), HashSet::from(["charlie".to_string()]))]);
        let loose = keyset(&["k"]);

        let worker = decide_worker(
            &HashMap::new(),
            &stacks,
            &HashMap::new(),
            &restrictions,
            &loose,
            &HashMap::new(),
            &"k".to_string(),
        )
        .unwrap();
        assert_eq!(worker, addr("alice"));
    }

    #[test]
    fn test_no_workers_is_an_error() {
        let result = decide_worker(
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            &HashSet::new(),
            &HashMap::new(),
            &"k".to_string(),
        );
        assert!(matches!(result, Err(SchedulerError::NoWorkers)));
    }

    #[test]
    fn test_assign_many_tasks_spreads_leaves_in_chunks() {
        let mut waiting: HashMap<Key, HashSet<Key>> = ["a", "b", "c", "d"]
            .iter()
            .map(|k| (k.to_string(), HashSet::new()))
            .collect();
        let keyorder: HashMap<Key, (u64, usize)> = ["a", "b", "c", "d"]
            .iter()
            .enumerate()
            .map(|(i, k)| (k.to_string(), (0, i)))
            .collect();
        let mut stacks = HashMap::from([(addr("alice"), vec![]), (addr("bob"), vec![])]);
        let mut round_robin = 0;

        let new_stacks = assign_many_tasks(
            &HashMap::new(),
            &mut waiting,
            &keyorder,
            &HashMap::new(),
            &mut stacks,
            &HashMap::new(),
            &HashSet::new(),
            &HashMap::new(),
            &mut round_robin,
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
        )
        .unwrap();

        assert!(waiting.is_empty());
        assert_eq!(round_robin, 1);
        // two workers, four leaves: two per worker, reversed inside the chunk
        assert_eq!(new_stacks[&addr("alice")], vec!["b".to_string(), "a".to_string()]);
        assert_eq!(new_stacks[&addr("bob")], vec!["d".to_string(), "c".to_string()]);
        assert_eq!(stacks[&addr("alice")], vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_assign_many_tasks_rotates_the_starting_worker() {
        let mut stacks = HashMap::from([(addr("alice"), vec![]), (addr("bob"), vec![])]);
        let mut round_robin = 1; // second call of the scheduler's lifetime
        let mut waiting = HashMap::from([("only".to_string(), HashSet::new())]);

        let new_stacks = assign_many_tasks(
            &HashMap::new(),
            &mut waiting,
            &HashMap::new(),
            &HashMap::new(),
            &mut stacks,
            &HashMap::new(),
            &HashSet::new(),
            &HashMap::new(),
            &mut round_robin,
            vec!["only".into()],
        )
        .unwrap();

        // offset 1 starts the rotation at bob
        assert_eq!(new_stacks.keys().collect::<Vec<_>>(), vec![&addr("bob")]);
        assert_eq!(round_robin, 2);
    }

    #[test]
    fn test_assign_many_tasks_routes_restricted_keys_through_decide_worker() {
        let mut stacks = HashMap::from([(addr("alice"), vec![]), (addr("bob"), vec![])]);
        let restrictions =
            HashMap::from([("k".to_string(), HashSet::from(["bob".to_string()]))]);
        let mut waiting = HashMap::from([("k".to_string(), HashSet::new())]);
        let mut round_robin = 0;

        let new_stacks = assign_many_tasks(
            &HashMap::new(),
            &mut waiting,
            &HashMap::new(),
            &HashMap::new(),
            &mut stacks,
            &restrictions,
            &HashSet::new(),
            &HashMap::new(),
            &mut round_robin,
            vec!["k".into()],
        )
        .unwrap();

        assert_eq!(new_stacks[&addr("bob")], vec!["k".to_string()]);
        assert!(!new_stacks.contains_key(&addr("alice")));
    }

    #[test]
    fn test_assign_many_tasks_with_no_workers_errors() {
        let mut stacks = HashMap::new();
        let mut waiting = HashMap::from([("k".to_string(), HashSet::new())]);
        let mut round_robin = 0;

        let result = assign_many_tasks(
            &HashMap::new(),
            &mut waiting,
            &HashMap::new(),
            &HashMap::new(),
            &mut stacks,
            &HashMap::new(),
            &HashSet::new(),
            &HashMap::new(),
            &mut round_robin,
            vec!["k".into()],
        );
        assert!(matches!(result, Err(SchedulerError::NoWorkers)));
    }
}

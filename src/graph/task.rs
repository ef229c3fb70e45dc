//! Task model: keys, worker addresses, and the task expression tree.
//!
//! A task is either a literal value, an alias for another key, or an
//! application node naming a function and its arguments. Arguments may
//! recursively be key references, literals, or nested application nodes.
//! The scheduler never evaluates tasks; it only inspects them for key
//! references to derive the dependency graph.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier of one task and its eventual output value.
pub type Key = String;

/// The function name aliases are rewritten to at graph admission. Task
/// interpreters must treat it as a primitive that returns its argument.
pub const IDENTITY: &str = "identity";

/// Execution endpoint addressed by host and port.
///
/// Restrictions are matched on `host` alone, so several workers on one
/// machine are interchangeable for placement purposes. The derived `Ord`
/// supplies the deterministic tie-break in worker selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerAddr {
    pub host: String,
    pub port: u16,
}

impl WorkerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for WorkerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One node of the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// A plain value, stored as data without execution
    Literal(Value),
    /// A bare reference to another key's output
    Alias(Key),
    /// An application node: a named function applied to arguments
    Apply { function: String, args: Vec<TaskArg> },
}

/// An argument of an application node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskArg {
    /// The output of another task
    KeyRef(Key),
    /// An inline value
    Literal(Value),
    /// A nested application evaluated in place
    Nested(Box<Task>),
}

impl Task {
    /// Shorthand for an application node.
    pub fn apply(function: impl Into<String>, args: Vec<TaskArg>) -> Self {
        Task::Apply {
            function: function.into(),
            args,
        }
    }

    /// The rewritten form of an alias: `identity` applied to the target key.
    pub fn identity_of(key: impl Into<Key>) -> Self {
        Task::apply(IDENTITY, vec![TaskArg::KeyRef(key.into())])
    }

    /// Whether this node requires execution on a worker. Literals (and any
    /// alias that survived admission) are shipped as raw data instead.
    pub fn is_application(&self) -> bool {
        matches!(self, Task::Apply { .. })
    }

    /// The value to ship when this node is treated as data.
    pub fn literal_value(&self) -> Value {
        match self {
            Task::Literal(v) => v.clone(),
            Task::Alias(k) => Value::String(k.clone()),
            Task::Apply { .. } => Value::Null,
        }
    }

    /// Collect every key reference in this task, recursing through nested
    /// application nodes.
    pub fn refs(&self) -> Vec<&Key> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Key>) {
        match self {
            Task::Literal(_) => {}
            Task::Alias(key) => out.push(key),
            Task::Apply { args, .. } => {
                for arg in args {
                    match arg {
                        TaskArg::KeyRef(key) => out.push(key),
                        TaskArg::Literal(_) => {}
                        TaskArg::Nested(task) => task.collect_refs(out),
                    }
                }
            }
        }
    }
}

/// Dependency set of a task: the key references that resolve to a known
/// task or to externally provided data. References to unknown keys carry
/// no scheduling meaning and are ignored.
pub fn task_dependencies(
    task: &Task,
    known: impl Fn(&Key) -> bool,
) -> HashSet<Key> {
    task.refs()
        .into_iter()
        .filter(|k| known(k))
        .cloned()
        .collect()
}

/// Replace aliases with calls to `identity` so every admitted node has
/// uniform application shape. Operates in place on the given keys only.
pub fn cover_aliases<'a>(
    dsk: &mut std::collections::HashMap<Key, Task>,
    new_keys: impl IntoIterator<Item = &'a Key>,
) {
    for key in new_keys {
        let target = match dsk.get(key) {
            Some(Task::Alias(t)) => t.clone(),
            _ => continue,
        };
        if dsk.contains_key(&target) {
            dsk.insert(key.clone(), Task::identity_of(target));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_refs_recurse_through_nested_applications() {
        let task = Task::apply(
            "add",
            vec![
                TaskArg::KeyRef("x".to_string()),
                TaskArg::Nested(Box::new(Task::apply(
                    "inc",
                    vec![TaskArg::KeyRef("y".to_string()), TaskArg::Literal(json!(3))],
                ))),
            ],
        );

        let refs: Vec<&Key> = task.refs();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&&"x".to_string()));
        assert!(refs.contains(&&"y".to_string()));
    }

    #[test]
    fn test_dependencies_ignore_unknown_refs() {
        let task = Task::apply(
            "f",
            vec![
                TaskArg::KeyRef("known".to_string()),
                TaskArg::KeyRef("unknown".to_string()),
            ],
        );
        let deps = task_dependencies(&task, |k| k == "known");
        assert_eq!(deps.len(), 1);
        assert!(deps.contains("known"));
    }

    #[test]
    fn test_cover_aliases_rewrites_to_identity() {
        let mut dsk = HashMap::new();
        dsk.insert("x".to_string(), Task::Literal(json!(1)));
        dsk.insert("y".to_string(), Task::Alias("x".to_string()));
        let new_keys = vec!["y".to_string()];

        cover_aliases(&mut dsk, new_keys.iter());

        assert_eq!(dsk["y"], Task::identity_of("x"));
        assert_eq!(dsk["y"].refs(), vec![&"x".to_string()]);
    }

    #[test]
    fn test_cover_aliases_leaves_dangling_targets_alone() {
        let mut dsk = HashMap::new();
        dsk.insert("y".to_string(), Task::Alias("absent".to_string()));
        let new_keys = vec!["y".to_string()];

        cover_aliases(&mut dsk, new_keys.iter());

        assert_eq!(dsk["y"], Task::Alias("absent".to_string()));
    }

    #[test]
    fn test_worker_addr_ordering_is_by_host_then_port() {
        let a = WorkerAddr::new("alice", 8000);
        let b = WorkerAddr::new("bob", 7000);
        let a2 = WorkerAddr::new("alice", 9000);
        assert!(a < b);
        assert!(a < a2);
        assert_eq!(a.to_string(), "alice:8000");
    }
}

//! Stable, dependency-aware topological sort.
//!
//! The ordering is produced with a priority-queue (min-heap over input
//! position) rather than a plain DFS/Kahn's algorithm, because the engine's
//! post-apply correctness depends on ties being broken by input order, not
//! by visitation order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::Error;

/// Topologically sort `items` according to `prerequisites_of`, which maps an
/// item to the set of items that must appear before it.
///
/// Returns the items in dependency order; when several items are ready to be
/// emitted, the one that appeared earliest in `items` is emitted first.
pub fn topological_sort<T, F, I>(items: &[T], prerequisites_of: F) -> Result<Vec<T>, Error>
where
    T: Clone + Eq + std::hash::Hash + std::fmt::Debug + Ord,
    F: Fn(&T) -> I,
    I: IntoIterator<Item = T>,
{
    let order: HashMap<T, usize> = items
        .iter()
        .enumerate()
        .map(|(ix, item)| (item.clone(), ix))
        .collect();

    let prereqs: HashMap<T, Vec<T>> = items
        .iter()
        .map(|item| (item.clone(), prerequisites_of(item).into_iter().collect()))
        .collect();

    for (item, deps) in &prereqs {
        for dep in deps {
            if !order.contains_key(dep) {
                return Err(Error::DanglingDependency {
                    migration: format!("{item:?}"),
                    depends_on: format!("{dep:?}"),
                });
            }
        }
    }

    let mut pqueue: BinaryHeap<Reverse<(usize, T)>> = items
        .iter()
        .map(|item| Reverse((order[item], item.clone())))
        .collect();

    let mut output: Vec<T> = Vec::with_capacity(items.len());
    let mut output_set: HashSet<T> = HashSet::with_capacity(items.len());
    let mut blocked_on: HashMap<T, HashSet<T>> = HashMap::new();
    let mut seen_since_last_change = 0usize;

    while let Some(Reverse((_, n))) = {
        if seen_since_last_change == pqueue.len() {
            return Err(cycle_error(&order, &pqueue, &blocked_on));
        }
        pqueue.pop()
    } {
        let my_prereqs = &prereqs[&n];
        let ready = my_prereqs.iter().all(|p| output_set.contains(p));

        let changed;
        if ready {
            changed = true;
            output_set.insert(n.clone());
            output.push(n.clone());
            if let Some(waiters) = blocked_on.remove(&n) {
                for waiter in waiters {
                    pqueue.push(Reverse((order[&waiter], waiter)));
                }
            }
        } else {
            let mut any_new = false;
            for p in my_prereqs {
                let waiters = blocked_on.entry(p.clone()).or_default();
                if waiters.insert(n.clone()) {
                    any_new = true;
                }
            }
            changed = any_new;
        }

        seen_since_last_change = if changed { 0 } else { seen_since_last_change + 1 };
    }

    if !blocked_on.is_empty() {
        return Err(cycle_error(&order, &pqueue, &blocked_on));
    }

    Ok(output)
}

fn cycle_error<T>(
    order: &HashMap<T, usize>,
    pqueue: &BinaryHeap<Reverse<(usize, T)>>,
    blocked_on: &HashMap<T, HashSet<T>>,
) -> Error
where
    T: Clone + Eq + std::hash::Hash + std::fmt::Debug,
{
    let mut unresolved: HashSet<T> = pqueue.iter().map(|Reverse((_, n))| n.clone()).collect();
    for waiters in blocked_on.values() {
        unresolved.extend(waiters.iter().cloned());
    }

    let mut named: Vec<T> = unresolved.into_iter().collect();
    named.sort_by_key(|n| order.get(n).copied().unwrap_or(usize::MAX));
    Error::Cycle(named.into_iter().map(|n| format!("{n:?}")).collect())
}

#[cfg(test)]
mod tests {
    use super::topological_sort;
    use std::collections::HashMap;

    fn sort_strs(items: &[&str], deps: &[(&str, &str)]) -> Result<Vec<String>, crate::Error> {
        let items: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        for (item, dep) in deps {
            graph
                .entry(item.to_string())
                .or_default()
                .push(dep.to_string());
        }
        topological_sort(&items, |item| graph.get(item).cloned().unwrap_or_default())
    }

    #[test]
    fn preserves_input_order_when_independent() {
        let result = sort_strs(&["a", "b", "c"], &[]).unwrap();
        assert_eq!(result, vec!["a", "b", "c"]);
    }

    #[test]
    fn stable_order_with_one_dependency() {
        // C depends on B; A has no dependencies and must stay first.
        let result = sort_strs(&["a", "b", "c"], &[("c", "b")]).unwrap();
        assert_eq!(result, vec!["a", "c", "b"]);
    }

    #[test]
    fn dependency_precedence_respected() {
        let result = sort_strs(&["b", "a"], &[("b", "a")]).unwrap();
        assert_eq!(result, vec!["a", "b"]);
    }

    #[test]
    fn detects_simple_cycle() {
        let err = sort_strs(&["a", "b"], &[("a", "b"), ("b", "a")]).unwrap_err();
        match err {
            crate::Error::Cycle(nodes) => {
                assert!(nodes.contains(&"\"a\"".to_string()));
                assert!(nodes.contains(&"\"b\"".to_string()));
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn dangling_dependency_is_a_distinct_error() {
        let err = sort_strs(&["a"], &[("a", "ghost")]).unwrap_err();
        assert!(matches!(err, crate::Error::DanglingDependency { .. }));
    }

    #[test]
    fn diamond_dependency_resolves() {
        // d depends on b and c; b and c both depend on a.
        let result = sort_strs(
            &["a", "b", "c", "d"],
            &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
        )
        .unwrap();
        let pos = |n: &str| result.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }
}

//! The reactive graph: arena, tracking, dirty propagation, batching.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::gauge;
use serde_json::Value;
use tracing::{debug, warn};

/// Generational handle to a node slot.
///
/// The generation guards against use of a handle whose slot was freed and
/// reused by a later node; stale handles become silent no-ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Handle to a registered subscriber callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Shared subscriber callback.
///
/// Stored behind an `Arc` so [`ReactiveGraph::flush_deferred`] can hand
/// callbacks out of the graph; a caller that guards the graph with a lock
/// invokes them after releasing it.
pub type SubscriberCallback = Arc<dyn Fn(&Value) + Send + Sync>;

type ComputeFn = Box<dyn FnMut(&mut ReactiveGraph) -> Value + Send>;
type FetchFn = Box<dyn FnMut() -> Value + Send>;

enum NodeKind {
    /// Explicit value cell; written via [`ReactiveGraph::write`].
    Source,
    /// Row-store-backed source; re-fetched when its tables are invalidated.
    Query { tables: Vec<String>, fetch: FetchFn },
    /// Derived node. The closure is taken out of the slot during
    /// evaluation so it can read other nodes through `&mut self`.
    Computed { compute: Option<ComputeFn> },
}

struct Node {
    kind: NodeKind,
    value: Option<Value>,
    dirty: bool,
    /// Nodes read during the last evaluation (computed nodes only).
    deps: HashSet<NodeId>,
    /// Nodes whose last evaluation read this one.
    dependents: HashSet<NodeId>,
    subscribers: HashMap<SubscriptionId, SubscriberCallback>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// The dependency-tracked recomputation engine. One instance per store.
#[derive(Default)]
pub struct ReactiveGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Evaluation stack: (node being evaluated, deps read so far).
    tracking: Vec<(NodeId, HashSet<NodeId>)>,
    /// Subscribed nodes awaiting a coalesced notification.
    pending: HashSet<NodeId>,
    next_subscription: u64,
}

impl ReactiveGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Node construction
    // ─────────────────────────────────────────────────────────────────────

    /// Create a source cell with an initial value.
    pub fn source(&mut self, initial: Value) -> NodeId {
        self.insert(Node {
            kind: NodeKind::Source,
            value: Some(initial),
            dirty: false,
            deps: HashSet::new(),
            dependents: HashSet::new(),
            subscribers: HashMap::new(),
        })
    }

    /// Create a row-store-backed query source.
    ///
    /// `fetch` re-reads the query's result; it runs on first read and
    /// whenever a commit touches one of `tables`.
    pub fn query(
        &mut self,
        tables: &[&str],
        fetch: impl FnMut() -> Value + Send + 'static,
    ) -> NodeId {
        self.insert(Node {
            kind: NodeKind::Query {
                tables: tables.iter().map(|&t| t.to_string()).collect(),
                fetch: Box::new(fetch),
            },
            value: None,
            dirty: true,
            deps: HashSet::new(),
            dependents: HashSet::new(),
            subscribers: HashMap::new(),
        })
    }

    /// Create a computed node.
    ///
    /// Every node `compute` reads (through the graph handle it is given)
    /// becomes a dependency; the set is rebuilt from scratch on each
    /// evaluation, so conditional reads track exactly.
    pub fn computed(
        &mut self,
        compute: impl FnMut(&mut ReactiveGraph) -> Value + Send + 'static,
    ) -> NodeId {
        self.insert(Node {
            kind: NodeKind::Computed {
                compute: Some(Box::new(compute)),
            },
            value: None,
            dirty: true,
            deps: HashSet::new(),
            dependents: HashSet::new(),
            subscribers: HashMap::new(),
        })
    }

    fn insert(&mut self, node: Node) -> NodeId {
        let id = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        };
        #[allow(clippy::cast_precision_loss)]
        gauge!("keel_reactive_nodes").set(self.node_count() as f64);
        id
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Number of live nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read / write
    // ─────────────────────────────────────────────────────────────────────

    /// Read a node's value, re-evaluating if dirty.
    ///
    /// Inside a computed node's function this also records the edge; a
    /// stale handle reads as `Value::Null`.
    pub fn read(&mut self, id: NodeId) -> Value {
        let Some(node) = self.node(id) else {
            warn!(?id, "read of stale node handle");
            return Value::Null;
        };

        let cached = if node.dirty { None } else { node.value.clone() };
        let value = match cached {
            Some(value) => value,
            None => self.evaluate(id),
        };

        if let Some((_, deps)) = self.tracking.last_mut() {
            let _ = deps.insert(id);
        }
        value
    }

    fn evaluate(&mut self, id: NodeId) -> Value {
        // Taking the compute closure out of the slot lets it re-enter the
        // graph through &mut self while the slot stays consistent.
        enum Plan {
            Ready(Value),
            Fetch,
            Compute(ComputeFn),
        }

        let plan = {
            let Some(node) = self.node_mut(id) else {
                return Value::Null;
            };
            match &mut node.kind {
                NodeKind::Source => Plan::Ready(node.value.clone().unwrap_or(Value::Null)),
                NodeKind::Query { .. } => Plan::Fetch,
                NodeKind::Computed { compute } => match compute.take() {
                    Some(f) => Plan::Compute(f),
                    // Re-entrant read of a node mid-evaluation: a cycle.
                    None => {
                        warn!(?id, "dependency cycle, yielding stale value");
                        Plan::Ready(node.value.clone().unwrap_or(Value::Null))
                    }
                },
            }
        };

        match plan {
            Plan::Ready(value) => value,
            Plan::Fetch => {
                let value = {
                    let Some(node) = self.node_mut(id) else {
                        return Value::Null;
                    };
                    match &mut node.kind {
                        NodeKind::Query { fetch, .. } => fetch(),
                        _ => return Value::Null,
                    }
                };
                if let Some(node) = self.node_mut(id) {
                    node.value = Some(value.clone());
                    node.dirty = false;
                }
                value
            }
            Plan::Compute(mut compute) => {
                self.tracking.push((id, HashSet::new()));
                let value = compute(self);
                let (_, new_deps) = self.tracking.pop().unwrap_or((id, HashSet::new()));

                let old_deps = self
                    .node(id)
                    .map(|node| node.deps.clone())
                    .unwrap_or_default();
                for dep in old_deps.difference(&new_deps) {
                    if let Some(dep_node) = self.node_mut(*dep) {
                        let _ = dep_node.dependents.remove(&id);
                    }
                }
                for dep in &new_deps {
                    if let Some(dep_node) = self.node_mut(*dep) {
                        let _ = dep_node.dependents.insert(id);
                    }
                }

                if let Some(node) = self.node_mut(id) {
                    node.deps = new_deps;
                    node.value = Some(value.clone());
                    node.dirty = false;
                    if let NodeKind::Computed { compute: slot } = &mut node.kind {
                        *slot = Some(compute);
                    }
                }
                value
            }
        }
    }

    /// Write a new value into a source cell.
    ///
    /// Marks every transitive dependent dirty and queues coalesced
    /// subscriber notifications; nothing recomputes until read or flush.
    pub fn write(&mut self, id: NodeId, value: Value) {
        let has_subscribers = {
            let Some(node) = self.node_mut(id) else {
                warn!(?id, "write to stale node handle");
                return;
            };
            if !matches!(node.kind, NodeKind::Source) {
                warn!(?id, "write to non-source node ignored");
                return;
            }
            node.value = Some(value);
            !node.subscribers.is_empty()
        };
        if has_subscribers {
            let _ = self.pending.insert(id);
        }
        self.mark_dependents_dirty(id);
    }

    /// Mark all query nodes whose table sets intersect `affected` dirty.
    ///
    /// Called by the leader after materializing a commit; follow with
    /// [`flush`](Self::flush) once per commit batch.
    pub fn invalidate_tables(&mut self, affected: &[&str]) {
        let hit: Vec<NodeId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let node = slot.node.as_ref()?;
                let NodeKind::Query { tables, .. } = &node.kind else {
                    return None;
                };
                tables
                    .iter()
                    .any(|t| affected.contains(&t.as_str()))
                    .then_some(NodeId {
                        index: index as u32,
                        generation: slot.generation,
                    })
            })
            .collect();

        for id in hit {
            let has_subscribers = {
                let Some(node) = self.node_mut(id) else {
                    continue;
                };
                node.dirty = true;
                !node.subscribers.is_empty()
            };
            if has_subscribers {
                let _ = self.pending.insert(id);
            }
            self.mark_dependents_dirty(id);
        }
    }

    fn mark_dependents_dirty(&mut self, id: NodeId) {
        let mut stack: Vec<NodeId> = self
            .node(id)
            .map(|node| node.dependents.iter().copied().collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            let (has_subscribers, children) = {
                let Some(node) = self.node_mut(current) else {
                    continue;
                };
                // Already-dirty nodes have already propagated.
                if node.dirty {
                    continue;
                }
                node.dirty = true;
                (
                    !node.subscribers.is_empty(),
                    node.dependents.iter().copied().collect::<Vec<_>>(),
                )
            };
            if has_subscribers {
                let _ = self.pending.insert(current);
            }
            stack.extend(children);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────

    /// Register an observer on a node.
    ///
    /// The callback fires on [`flush`](Self::flush), at most once per
    /// transition, with the node's freshly evaluated value.
    pub fn subscribe(
        &mut self,
        id: NodeId,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Option<SubscriptionId> {
        self.next_subscription += 1;
        let sub = SubscriptionId(self.next_subscription);
        let node = self.node_mut(id)?;
        let _ = node.subscribers.insert(sub, Arc::new(callback));
        Some(sub)
    }

    /// Remove an observer. Once a node has no observers and no dependents
    /// it becomes eligible for [`cleanup`](Self::cleanup).
    pub fn unsubscribe(&mut self, id: NodeId, sub: SubscriptionId) {
        if let Some(node) = self.node_mut(id) {
            let _ = node.subscribers.remove(&sub);
        }
        let _ = self.pending.remove(&id);
    }

    /// Deliver pending notifications, one per subscribed node.
    ///
    /// Multiple writes between flushes coalesce: each observer sees the
    /// final value of the transition, never intermediate states.
    pub fn flush(&mut self) {
        for (callback, value) in self.flush_deferred() {
            callback(&value);
        }
    }

    /// Evaluate pending notifications but hand them back undelivered.
    ///
    /// For callers that guard the graph with a lock: invoke the callbacks
    /// after releasing it, so a subscriber can re-enter the graph without
    /// deadlocking.
    pub fn flush_deferred(&mut self) -> Vec<(SubscriberCallback, Value)> {
        let pending: Vec<NodeId> = self.pending.drain().collect();
        let mut out = Vec::new();
        for id in pending {
            let value = self.read(id);
            let Some(node) = self.node(id) else {
                continue;
            };
            for callback in node.subscribers.values() {
                out.push((Arc::clone(callback), value.clone()));
            }
        }
        out
    }

    /// Drop derived nodes that nothing observes and nothing depends on.
    ///
    /// Source cells are left alone — their handles are owned by the store
    /// and stay writable for their whole lifetime. Runs to a fixpoint so
    /// chains of orphaned computed nodes collapse in one pass.
    pub fn cleanup(&mut self) {
        loop {
            let removable: Vec<NodeId> = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let node = slot.node.as_ref()?;
                    let derived = matches!(
                        node.kind,
                        NodeKind::Computed { .. } | NodeKind::Query { .. }
                    );
                    (derived && node.subscribers.is_empty() && node.dependents.is_empty())
                        .then_some(NodeId {
                            index: index as u32,
                            generation: slot.generation,
                        })
                })
                .collect();
            if removable.is_empty() {
                break;
            }
            for id in removable {
                self.remove(id);
            }
        }
        #[allow(clippy::cast_precision_loss)]
        gauge!("keel_reactive_nodes").set(self.node_count() as f64);
    }

    fn remove(&mut self, id: NodeId) {
        let Some(node) = self.node_mut(id) else {
            return;
        };
        let deps = std::mem::take(&mut node.deps);
        for dep in deps {
            if let Some(dep_node) = self.node_mut(dep) {
                let _ = dep_node.dependents.remove(&id);
            }
        }
        let slot = &mut self.slots[id.index as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        let _ = self.pending.remove(&id);
        debug!(?id, "reactive node removed");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn source_read_write() {
        let mut graph = ReactiveGraph::new();
        let cell = graph.source(json!(1));
        assert_eq!(graph.read(cell), json!(1));

        graph.write(cell, json!(2));
        assert_eq!(graph.read(cell), json!(2));
    }

    #[test]
    fn computed_tracks_dependencies_automatically() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(2));
        let b = graph.source(json!(3));
        let sum = graph.computed(move |g| {
            let a = g.read(a).as_i64().unwrap_or(0);
            let b = g.read(b).as_i64().unwrap_or(0);
            json!(a + b)
        });

        assert_eq!(graph.read(sum), json!(5));
        graph.write(a, json!(10));
        assert_eq!(graph.read(sum), json!(13));
    }

    #[test]
    fn computed_caches_between_writes() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(1));
        let evals = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&evals);
        let doubled = graph.computed(move |g| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            json!(g.read(a).as_i64().unwrap_or(0) * 2)
        });

        graph.write(a, json!(5));
        // N reads between writes evaluate exactly once.
        for _ in 0..10 {
            assert_eq!(graph.read(doubled), json!(10));
        }
        assert_eq!(evals.load(Ordering::SeqCst), 1);

        graph.write(a, json!(6));
        assert_eq!(graph.read(doubled), json!(12));
        assert_eq!(evals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn conditional_reads_retrack_each_evaluation() {
        let mut graph = ReactiveGraph::new();
        let flag = graph.source(json!(true));
        let left = graph.source(json!("L"));
        let right = graph.source(json!("R"));
        let evals = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&evals);
        let pick = graph.computed(move |g| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            if g.read(flag) == json!(true) {
                g.read(left)
            } else {
                g.read(right)
            }
        });

        assert_eq!(graph.read(pick), json!("L"));
        assert_eq!(evals.load(Ordering::SeqCst), 1);

        // While flag is true, `right` is not a dependency.
        graph.write(right, json!("R2"));
        assert_eq!(graph.read(pick), json!("L"));
        assert_eq!(evals.load(Ordering::SeqCst), 1);

        graph.write(flag, json!(false));
        assert_eq!(graph.read(pick), json!("R2"));
        assert_eq!(evals.load(Ordering::SeqCst), 2);

        // And now `left` is no longer a dependency.
        graph.write(left, json!("L2"));
        assert_eq!(graph.read(pick), json!("R2"));
        assert_eq!(evals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn transitive_dirtying() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(1));
        let b = graph.computed(move |g| json!(g.read(a).as_i64().unwrap_or(0) + 1));
        let c = graph.computed(move |g| json!(g.read(b).as_i64().unwrap_or(0) * 10));

        assert_eq!(graph.read(c), json!(20));
        graph.write(a, json!(5));
        assert_eq!(graph.read(c), json!(60));
    }

    #[test]
    fn notifications_are_coalesced() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(0));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = graph
            .subscribe(a, move |value| sink.lock().unwrap().push(value.clone()))
            .unwrap();

        // Three writes before the flush → exactly one notification, with
        // the final value only.
        graph.write(a, json!(1));
        graph.write(a, json!(2));
        graph.write(a, json!(3));
        graph.flush();

        let values = seen.lock().unwrap().clone();
        assert_eq!(values, vec![json!(3)]);

        // No pending work → no further notifications.
        graph.flush();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn flush_deferred_hands_back_callbacks() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(0));
        let seen = Arc::new(AtomicU32::new(0));
        let sink = Arc::clone(&seen);
        let _sub = graph
            .subscribe(a, move |_| {
                let _ = sink.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        graph.write(a, json!(1));
        let notifications = graph.flush_deferred();
        // Nothing delivered yet; the caller invokes outside its lock.
        assert_eq!(notifications.len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        for (callback, value) in &notifications {
            callback(value);
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Handing them out cleared the pending set.
        graph.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribed_computed_notified_through_chain() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(1));
        let b = graph.computed(move |g| json!(g.read(a).as_i64().unwrap_or(0) * 2));
        let _ = graph.read(b); // establish the edge

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = graph
            .subscribe(b, move |value| sink.lock().unwrap().push(value.clone()))
            .unwrap();

        graph.write(a, json!(4));
        graph.flush();
        assert_eq!(seen.lock().unwrap().clone(), vec![json!(8)]);
    }

    #[test]
    fn query_nodes_invalidate_by_table() {
        let mut graph = ReactiveGraph::new();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        let todos = graph.query(&["todos"], move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            json!({"rows": []})
        });
        let other = graph.query(&["settings"], || json!({"rows": []}));

        let _ = graph.read(todos);
        let _ = graph.read(other);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A commit touching `todos` refetches only the matching query.
        graph.invalidate_tables(&["todos"]);
        let _ = graph.read(todos);
        let _ = graph.read(other);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        graph.invalidate_tables(&["settings"]);
        let _ = graph.read(todos);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_then_cleanup_removes_orphans() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(1));
        let b = graph.computed(move |g| g.read(a));
        let sub = graph.subscribe(b, |_| {}).unwrap();
        let _ = graph.read(b);
        assert_eq!(graph.node_count(), 2);

        graph.unsubscribe(b, sub);
        graph.cleanup();

        // The computed node is gone; the source cell stays.
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.read(a), json!(1));
    }

    #[test]
    fn cleanup_collapses_orphan_chains() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(1));
        let b = graph.computed(move |g| g.read(a));
        let c = graph.computed(move |g| g.read(b));
        let _ = graph.read(c);
        assert_eq!(graph.node_count(), 3);

        // Nothing subscribes to either derived node.
        graph.cleanup();
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn stale_handle_is_inert() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(1));
        let b = graph.computed(move |g| g.read(a));
        let _ = graph.read(b);
        graph.cleanup(); // removes b

        assert_eq!(graph.read(b), Value::Null);
        graph.write(b, json!(9)); // no-op
        assert!(graph.subscribe(b, |_| {}).is_none());
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut graph = ReactiveGraph::new();
        let a = graph.source(json!(1));
        let b = graph.computed(move |g| g.read(a));
        let _ = graph.read(b);
        graph.cleanup();

        // The freed slot is reused with a new generation; the old handle
        // must not alias the new node.
        let c = graph.computed(move |g| g.read(a));
        assert_eq!(graph.read(c), json!(1));
        assert_eq!(graph.read(b), Value::Null);
    }
}

//! Wait-for cycle detection across lock holders.
//!
//! An edge `A -> B` means holder `A` has a queued request for a key currently
//! held by `B`. A cycle means none of its participants can make progress, so
//! one queued request is failed to break it.
//!
//! The graph is rebuilt from scratch on every pass from the backend's held
//! records and a queue snapshot; nothing is cached between passes.

use crate::locks::{LockKey, LockRecord};
use crate::queue::WaitQueueEntry;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// `waiter -> holder`, labelled with the queued request that creates it.
#[derive(Debug, Clone)]
struct Edge {
    to: String,
    entry: WaitQueueEntry,
}

/// Adjacency list keyed by holder id.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: BTreeMap<String, Vec<Edge>>,
}

/// One broken cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlockReport {
    /// Holder ids in cycle order.
    pub cycle: Vec<String>,
    /// Keys waited on along the cycle.
    pub keys: Vec<LockKey>,
    /// The queued request that was failed.
    pub victim: WaitQueueEntry,
}

impl WaitForGraph {
    pub fn build(held: &[LockRecord], waiting: &[WaitQueueEntry]) -> Self {
        let holders: HashMap<&LockKey, &str> = held
            .iter()
            .map(|record| (&record.key, record.holder_id.as_str()))
            .collect();

        let mut graph = Self::default();
        for entry in waiting {
            let Some(holder) = holders.get(&entry.key) else {
                continue;
            };
            if *holder == entry.holder_id {
                continue;
            }
            graph
                .edges
                .entry(entry.holder_id.clone())
                .or_default()
                .push(Edge {
                    to: holder.to_string(),
                    entry: entry.clone(),
                });
        }
        graph
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    /// Edges along one cycle, if any exists.
    fn find_cycle(&self) -> Option<Vec<Edge>> {
        let mut done: HashSet<&str> = HashSet::new();

        for start in self.edges.keys() {
            if done.contains(start.as_str()) {
                continue;
            }

            // Iterative DFS keeping the current path of edges.
            let mut path: Vec<&Edge> = Vec::new();
            let mut on_path: Vec<&str> = vec![start.as_str()];
            let mut cursors: Vec<usize> = vec![0];

            while let Some(node) = on_path.last().copied() {
                let depth = on_path.len() - 1;
                let outgoing = self.edges.get(node).map(Vec::as_slice).unwrap_or(&[]);

                if cursors[depth] >= outgoing.len() {
                    done.insert(node);
                    on_path.pop();
                    cursors.pop();
                    path.pop();
                    continue;
                }

                let edge = &outgoing[cursors[depth]];
                cursors[depth] += 1;

                if let Some(pos) = on_path.iter().position(|n| *n == edge.to) {
                    let mut cycle: Vec<Edge> = path[pos..].iter().map(|e| (*e).clone()).collect();
                    cycle.push(edge.clone());
                    return Some(cycle);
                }
                if done.contains(edge.to.as_str()) {
                    continue;
                }

                path.push(edge);
                on_path.push(edge.to.as_str());
                cursors.push(0);
            }
        }

        None
    }

    fn remove_entry(&mut self, victim: &WaitQueueEntry) {
        if let Some(edges) = self.edges.get_mut(&victim.holder_id) {
            edges.retain(|e| e.entry.key != victim.key);
            if edges.is_empty() {
                self.edges.remove(&victim.holder_id);
            }
        }
    }

    /// Pick a victim for every cycle, removing each before searching again.
    pub fn break_cycles(&mut self) -> Vec<DeadlockReport> {
        let mut reports = Vec::new();

        while let Some(cycle) = self.find_cycle() {
            // Lowest priority loses; among equals the most recent arrival.
            let victim = cycle
                .iter()
                .map(|edge| &edge.entry)
                .min_by_key(|entry| {
                    (
                        entry.priority,
                        std::cmp::Reverse(entry.enqueued_at),
                        std::cmp::Reverse(entry.seq),
                    )
                })
                .cloned();
            let Some(victim) = victim else {
                break;
            };

            let report = DeadlockReport {
                cycle: cycle.iter().map(|e| e.entry.holder_id.clone()).collect(),
                keys: cycle.iter().map(|e| e.entry.key.clone()).collect(),
                victim,
            };
            debug!(cycle = ?report.cycle, victim = %report.victim.holder_id, "wait-for cycle found");
            self.remove_entry(&report.victim);
            reports.push(report);
        }

        reports
    }
}

/// Periodic scanner over a held-lock snapshot and the wait queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadlockDetector;

impl DeadlockDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn scan(&self, held: &[LockRecord], waiting: &[WaitQueueEntry]) -> Vec<DeadlockReport> {
        if waiting.is_empty() {
            return Vec::new();
        }
        WaitForGraph::build(held, waiting).break_cycles()
    }
}

use std::collections::{HashMap, HashSet};
use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::graph::NodeIndex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strata_domain::Diagnostics;

use crate::graph::DepGraph;

/// The result of one walk: every diagnostic produced, sorted for determinism,
/// plus bookkeeping for tests and logs.
#[derive(Debug, Default)]
pub struct WalkReport {
    pub diagnostics: Diagnostics,
    /// Number of nodes whose executor actually ran.
    pub executed: usize,
    /// Canonical names of nodes skipped because an upstream node failed.
    pub skipped: Vec<String>,
    /// Whether cancellation stopped the walk before completion.
    pub cancelled: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum NodeResult {
    Ok,
    Failed,
    Skipped,
}

/// Execute every node of an acyclic graph, honoring edges, with bounded
/// parallelism.
///
/// - A node runs once all predecessors completed without fatal error.
/// - Nodes downstream of a failure are skipped, not failed: their work is
///   meaningless without the input, and failing them would storm the
///   diagnostics.
/// - Nodes in `disabled` complete instantly without running the executor but
///   still release their successors. Targeting uses this.
/// - Cancellation stops scheduling; already-running nodes finish and keep
///   their diagnostics.
///
/// Diagnostic determinism comes from sorting at the end, not from
/// serializing execution.
pub async fn walk<N, F, Fut>(
    graph: &DepGraph<N>,
    concurrency: usize,
    cancel: &CancellationToken,
    disabled: &HashSet<NodeIndex>,
    exec: F,
) -> WalkReport
where
    N: std::fmt::Display,
    F: Fn(NodeIndex, &N) -> Fut,
    Fut: Future<Output = Diagnostics>,
{
    let concurrency = concurrency.max(1);
    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.predecessors(idx).len()))
        .collect();
    let mut results: HashMap<NodeIndex, NodeResult> = HashMap::new();
    let mut report = WalkReport::default();

    // Nodes whose dependencies are satisfied, in index order for a stable
    // schedule.
    let mut ready: Vec<NodeIndex> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(idx, _)| *idx)
        .collect();
    ready.sort();

    let mut in_flight = FuturesUnordered::new();
    let mut pending = graph.node_count();

    while pending > 0 {
        // Resolve as many ready nodes as possible without executing: skips
        // and disabled nodes release successors immediately.
        let mut made_progress = true;
        while made_progress {
            made_progress = false;
            let mut requeue = Vec::new();
            for idx in std::mem::take(&mut ready) {
                let upstream_bad = graph.predecessors(idx).iter().any(|p| {
                    matches!(
                        results.get(p),
                        Some(NodeResult::Failed) | Some(NodeResult::Skipped)
                    )
                });
                let result = if upstream_bad {
                    debug!(node = %graph.node(idx), "skipping: upstream failed");
                    report.skipped.push(graph.node(idx).to_string());
                    Some(NodeResult::Skipped)
                } else if cancel.is_cancelled() {
                    report.cancelled = true;
                    report.skipped.push(graph.node(idx).to_string());
                    Some(NodeResult::Skipped)
                } else if disabled.contains(&idx) {
                    Some(NodeResult::Ok)
                } else {
                    None
                };

                match result {
                    Some(result) => {
                        results.insert(idx, result);
                        pending -= 1;
                        made_progress = true;
                        for succ in graph.successors(idx) {
                            let d = indegree.get_mut(&succ).expect("known node");
                            *d -= 1;
                            if *d == 0 {
                                requeue.push(succ);
                            }
                        }
                    }
                    None => requeue.push(idx),
                }
            }
            requeue.sort();
            ready = requeue;
        }

        // Launch executable ready nodes up to the concurrency bound.
        while in_flight.len() < concurrency {
            let Some(idx) = ready.first().copied() else { break };
            ready.remove(0);
            debug!(node = %graph.node(idx), "executing");
            let fut = exec(idx, graph.node(idx));
            in_flight.push(async move { (idx, fut.await) });
        }

        if in_flight.is_empty() {
            if pending > 0 && ready.is_empty() {
                // Only reachable when every remaining node awaits a skipped
                // or cancelled predecessor; the resolve loop above will have
                // handled it. Guard against scheduling bugs anyway.
                warn!(pending, "walker stalled with no runnable nodes");
                break;
            }
            continue;
        }

        let Some((idx, diags)) = in_flight.next().await else {
            break;
        };
        let fatal = diags.has_errors();
        if fatal {
            warn!(node = %graph.node(idx), errors = diags.error_count(), "node failed");
        }
        report.diagnostics.append(diags);
        report.executed += 1;
        results.insert(idx, if fatal { NodeResult::Failed } else { NodeResult::Ok });
        pending -= 1;
        let mut newly_ready = Vec::new();
        for succ in graph.successors(idx) {
            let d = indegree.get_mut(&succ).expect("known node");
            *d -= 1;
            if *d == 0 {
                newly_ready.push(succ);
            }
        }
        newly_ready.sort();
        ready.extend(newly_ready);
    }

    // Drain anything still in flight (cancellation path).
    while let Some((idx, diags)) = in_flight.next().await {
        let fatal = diags.has_errors();
        report.diagnostics.append(diags);
        report.executed += 1;
        results.insert(idx, if fatal { NodeResult::Failed } else { NodeResult::Ok });
    }

    report.diagnostics.sort();
    report.skipped.sort();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use strata_domain::Diagnostic;

    fn linear_graph(names: &[&str]) -> DepGraph<String> {
        let mut g = DepGraph::new();
        let mut prev = None;
        for name in names {
            let idx = g.add_node(name.to_string());
            if let Some(p) = prev {
                g.add_edge(p, idx).unwrap();
            }
            prev = Some(idx);
        }
        g
    }

    #[tokio::test]
    async fn edges_order_execution() {
        let g = linear_graph(&["a", "b", "c"]);
        let order = Mutex::new(Vec::new());
        let cancel = CancellationToken::new();

        let report = walk(&g, 4, &cancel, &HashSet::new(), |_, name| {
            let order = &order;
            let name = name.clone();
            async move {
                order.lock().unwrap().push(name);
                Diagnostics::new()
            }
        })
        .await;

        assert_eq!(report.executed, 3);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failure_skips_downstream_but_not_independents() {
        let mut g: DepGraph<String> = DepGraph::new();
        let a = g.add_node("a".into());
        let b = g.add_node("b".into());
        let _lone = g.add_node("lone".into());
        g.add_edge(a, b).unwrap();
        let cancel = CancellationToken::new();

        let report = walk(&g, 4, &cancel, &HashSet::new(), |_, name| {
            let name = name.clone();
            async move {
                let mut diags = Diagnostics::new();
                if name == "a" {
                    diags.push(Diagnostic::error("boom", ""));
                }
                diags
            }
        })
        .await;

        // a ran and failed, lone ran, b was skipped (not failed).
        assert_eq!(report.executed, 2);
        assert_eq!(report.skipped, vec!["b".to_string()]);
        assert_eq!(report.diagnostics.error_count(), 1);
    }

    #[tokio::test]
    async fn disabled_nodes_release_successors_without_running() {
        let g = linear_graph(&["a", "b", "c"]);
        let ran = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let disabled: HashSet<_> = g
            .node_indices()
            .filter(|idx| g.node(*idx).as_str() == "b")
            .collect();

        let report = walk(&g, 4, &cancel, &disabled, |_, _| {
            ran.fetch_add(1, Ordering::SeqCst);
            async { Diagnostics::new() }
        })
        .await;

        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(report.executed, 2);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_scheduling() {
        let g = linear_graph(&["a", "b", "c"]);
        let cancel = CancellationToken::new();

        let report = walk(&g, 1, &cancel, &HashSet::new(), |_, name| {
            let cancel = cancel.clone();
            let name = name.clone();
            async move {
                if name == "a" {
                    cancel.cancel();
                }
                Diagnostics::new()
            }
        })
        .await;

        assert!(report.cancelled);
        assert_eq!(report.executed, 1);
        assert_eq!(report.skipped.len(), 2);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let mut g: DepGraph<String> = DepGraph::new();
        for i in 0..8 {
            g.add_node(format!("n{}", i));
        }
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let cancel = CancellationToken::new();

        walk(&g, 2, &cancel, &HashSet::new(), |_, _| {
            let current = &current;
            let peak = &peak;
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                current.fetch_sub(1, Ordering::SeqCst);
                Diagnostics::new()
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}

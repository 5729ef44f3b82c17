//! Evaluation order of one iteration.
//!
//! Strongly connected components of the dependency graph are found with
//! Kosaraju's algorithm (iterative, so deep models cannot overflow the
//! stack) and emitted so that every group comes after everything it needs.

use std::collections::HashMap;

use tracing::debug;

use super::depgraph::{DepGraph, DepNode};
use super::RATE_TOLERANCE;
use crate::error::Result;
use crate::model::{BlockId, PortId};

/// A unit of work in a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    /// A primitive block outside of any loop.
    Block(BlockId),
    /// A port of the root.
    Port(PortId),
    /// Blocks that depend on each other within the same iteration.
    Cycle(Vec<BlockId>),
}

/// When the schedule is recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecomputePolicy {
    /// Every iteration.
    Always,
    /// At the listed iterations (and whenever nothing is cached).
    At(Vec<usize>),
}

impl Default for RecomputePolicy {
    fn default() -> Self {
        RecomputePolicy::At(vec![0, 1])
    }
}

impl RecomputePolicy {
    /// Whether the dependency graph and schedule are rebuilt at `iteration`.
    ///
    /// The first two iterations always rebuild: delays change their
    /// dependencies after iteration 0.
    pub fn recompute_at(&self, iteration: usize) -> bool {
        match self {
            RecomputePolicy::Always => true,
            RecomputePolicy::At(iterations) => iteration < 2 || iterations.contains(&iteration),
        }
    }
}

/// Produces and caches schedules.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    policy: RecomputePolicy,
    cached: Option<Vec<Group>>,
}

impl Scheduler {
    pub fn new(policy: RecomputePolicy) -> Self {
        Self { policy, cached: None }
    }

    pub fn policy(&self) -> &RecomputePolicy {
        &self.policy
    }

    /// Drop the cached schedule.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// The schedule for `iteration`, reusing the cached one unless the
    /// policy asks for a rebuild.
    pub fn obtain(&mut self, graph: &DepGraph, iteration: usize) -> Result<Vec<Group>> {
        match &self.cached {
            Some(groups) if !self.policy.recompute_at(iteration) => Ok(groups.clone()),
            _ => {
                let groups = Self::schedule(graph)?;
                debug!(iteration, groups = groups.len(), "schedule recomputed");
                self.cached = Some(groups.clone());
                Ok(groups)
            }
        }
    }

    /// Topologically sorted strong components of `graph`.
    pub fn schedule(graph: &DepGraph) -> Result<Vec<Group>> {
        let members = graph.members();
        let index: HashMap<DepNode, usize> = members.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut dependents = Vec::with_capacity(members.len());
        let mut influencers = Vec::with_capacity(members.len());
        for node in members {
            dependents.push(graph.dependents(*node)?.iter().map(|n| index[n]).collect::<Vec<_>>());
            influencers.push(graph.influencers(*node)?.iter().map(|n| index[n]).collect::<Vec<_>>());
        }

        // Pass 1: finishing order along data flow.
        let mut visited = vec![false; members.len()];
        let mut finished = Vec::with_capacity(members.len());
        for start in 0..members.len() {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut stack = vec![(start, 0usize)];
            while let Some((node, next)) = stack.last_mut() {
                let node = *node;
                if let Some(&child) = dependents[node].get(*next) {
                    *next += 1;
                    if !visited[child] {
                        visited[child] = true;
                        stack.push((child, 0));
                    }
                } else {
                    finished.push(node);
                    stack.pop();
                }
            }
        }

        // Pass 2: collect components against the data flow, latest finisher
        // first. Components come out sources first.
        let mut assigned = vec![false; members.len()];
        let mut groups = Vec::new();
        for &start in finished.iter().rev() {
            if assigned[start] {
                continue;
            }
            assigned[start] = true;
            let mut component = vec![start];
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                for &child in &influencers[node] {
                    if !assigned[child] {
                        assigned[child] = true;
                        component.push(child);
                        stack.push(child);
                    }
                }
            }
            component.sort_unstable();
            groups.push(Self::group(members, &influencers, component));
        }
        Ok(groups)
    }

    fn group(members: &[DepNode], influencers: &[Vec<usize>], component: Vec<usize>) -> Group {
        if let [single] = component[..] {
            let self_loop = influencers[single].contains(&single);
            return match members[single] {
                DepNode::Block(id) if self_loop => Group::Cycle(vec![id]),
                DepNode::Block(id) => Group::Block(id),
                DepNode::Port(id) => Group::Port(id),
            };
        }
        Group::Cycle(
            component
                .into_iter()
                .filter_map(|i| match members[i] {
                    DepNode::Block(id) => Some(id),
                    DepNode::Port(_) => None,
                })
                .collect(),
        )
    }
}

/// Whether a block with execution `rate` computes at `iteration`, `time`.
///
/// Un-rated blocks and iteration 0 always compute; otherwise `time` must
/// be a multiple of `rate` up to a relative tolerance.
pub fn must_compute(rate: Option<f64>, iteration: usize, time: f64) -> bool {
    let Some(rate) = rate else { return true };
    if iteration == 0 {
        return true;
    }
    let nearest = (time / rate).round() * rate;
    (time - nearest).abs() <= RATE_TOLERANCE * time.abs().max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn b(i: usize) -> DepNode {
        DepNode::Block(BlockId(i))
    }

    fn graph(n: usize, edges: &[(usize, usize)]) -> DepGraph {
        let mut g = DepGraph::new();
        for i in 0..n {
            g.add_member(b(i)).unwrap();
        }
        for &(dependent, influencer) in edges {
            g.set_dependency(b(dependent), b(influencer)).unwrap();
        }
        g
    }

    fn position(groups: &[Group], id: usize) -> usize {
        groups
            .iter()
            .position(|g| match g {
                Group::Block(b) => b.0 == id,
                Group::Cycle(blocks) => blocks.iter().any(|b| b.0 == id),
                Group::Port(_) => false,
            })
            .unwrap()
    }

    #[test]
    fn test_chain_is_ordered() {
        // 0 <- 1 <- 2, inserted in reverse.
        let g = graph(3, &[(0, 1), (1, 2)]);
        let groups = Scheduler::schedule(&g).unwrap();
        assert_eq!(
            groups,
            vec![
                Group::Block(BlockId(2)),
                Group::Block(BlockId(1)),
                Group::Block(BlockId(0))
            ]
        );
    }

    #[test]
    fn test_cycles_are_grouped() {
        // 0 -> {1, 2, 3} ring -> 4, plus a self loop on 5.
        let g = graph(
            6,
            &[(1, 0), (1, 3), (2, 1), (3, 2), (4, 3), (5, 5)],
        );
        let groups = Scheduler::schedule(&g).unwrap();
        assert!(groups.contains(&Group::Cycle(vec![BlockId(1), BlockId(2), BlockId(3)])));
        assert!(groups.contains(&Group::Cycle(vec![BlockId(5)])));
        assert!(position(&groups, 0) < position(&groups, 1));
        assert!(position(&groups, 1) < position(&groups, 4));
        assert_eq!(groups.len(), 4);
    }

    #[test]
    fn test_policy_caching() {
        let mut scheduler = Scheduler::default();
        let g = graph(2, &[(1, 0)]);
        assert_eq!(scheduler.obtain(&g, 0).unwrap().len(), 2);

        // Past iteration 1 the cached schedule is reused.
        let changed = graph(1, &[]);
        assert_eq!(scheduler.obtain(&changed, 5).unwrap().len(), 2);
        assert_eq!(scheduler.obtain(&changed, 1).unwrap().len(), 1);

        let mut always = Scheduler::new(RecomputePolicy::Always);
        always.obtain(&g, 0).unwrap();
        assert_eq!(always.obtain(&changed, 7).unwrap().len(), 1);

        let mut listed = Scheduler::new(RecomputePolicy::At(vec![0, 1, 4]));
        listed.obtain(&g, 0).unwrap();
        assert_eq!(listed.obtain(&changed, 4).unwrap().len(), 1);
    }

    #[test]
    fn test_rate_gating() {
        assert!(must_compute(None, 3, 0.7));
        assert!(must_compute(Some(0.5), 0, 0.3));
        assert!(must_compute(Some(0.5), 3, 1.5));
        assert!(must_compute(Some(0.1), 3, 0.30000000000000004));
        assert!(!must_compute(Some(0.5), 3, 1.2));
        assert!(must_compute(Some(2.0), 5, 1000.0 + 1e-4));
        assert!(!must_compute(Some(2.0), 5, 1000.01));
    }

    proptest! {
        #[test]
        fn prop_influencers_come_first(
            n in 1usize..25,
            raw in prop::collection::vec((0usize..25, 0usize..25), 0..60),
        ) {
            // Edges from higher to lower index keep the graph acyclic.
            let edges: Vec<(usize, usize)> = raw
                .into_iter()
                .map(|(a, b)| (a % n, b % n))
                .filter(|(a, b)| a != b)
                .map(|(a, b)| (a.max(b), a.min(b)))
                .collect();
            let g = graph(n, &edges);
            let groups = Scheduler::schedule(&g).unwrap();
            prop_assert_eq!(groups.len(), n);
            prop_assert!(groups.iter().all(|g| matches!(g, Group::Block(_))));
            for (dependent, influencer) in edges {
                prop_assert!(position(&groups, influencer) < position(&groups, dependent));
            }
        }
    }
}

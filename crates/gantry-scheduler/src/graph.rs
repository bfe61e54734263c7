//! Dependency graph over workflow-local job ids.

use gantry_core::job::RunJob;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{BTreeSet, HashMap};

/// Graph of `needs` edges of one run. Edges point from a needed job to the
/// job needing it. Rows sharing a job id collapse into one node.
#[derive(Debug, Default)]
pub struct NeedsGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl NeedsGraph {
    pub fn from_jobs(jobs: &[RunJob]) -> Self {
        let mut dag = Self::default();
        for job in jobs {
            dag.node(&job.job_id);
        }
        for job in jobs {
            let to = dag.index[&job.job_id];
            for need in &job.needs {
                // needs on jobs that are not part of the run add no edge
                if let Some(&from) = dag.index.get(need)
                    && !dag.graph.contains_edge(from, to)
                {
                    dag.graph.add_edge(from, to, ());
                }
            }
        }
        dag
    }

    fn node(&mut self, job_id: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(job_id) {
            return idx;
        }
        let idx = self.graph.add_node(job_id.to_string());
        self.index.insert(job_id.to_string(), idx);
        idx
    }

    /// Job ids of one `needs` cycle, sorted, if the graph has any.
    pub fn cycle(&self) -> Option<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&idx| self.graph.contains_edge(idx, idx))
            })
            .map(|component| {
                let mut names: Vec<String> =
                    component.iter().map(|&idx| self.graph[idx].clone()).collect();
                names.sort();
                names
            })
            .collect();
        cycles.sort();
        cycles.into_iter().next()
    }

    /// Every job id that needs `job_id`, directly or transitively.
    pub fn dependents(&self, job_id: &str) -> BTreeSet<String> {
        let Some(&start) = self.index.get(job_id) else {
            return BTreeSet::new();
        };
        let mut found = BTreeSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start {
                found.insert(self.graph[idx].clone());
            }
        }
        found
    }
}

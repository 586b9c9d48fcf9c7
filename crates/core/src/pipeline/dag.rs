use crate::error::PipelineError;
use crate::pipeline::definition::TaskSpec;
use crate::types::{RunNote, TaskId, TaskRun, TaskState};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Edge payload: how the downstream task treats an unsuccessful upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EdgeMeta {
    continue_on_failure: bool,
}

/// Immutable DAG of a pipeline's tasks
#[derive(Debug, Clone)]
pub struct PipelineDag {
    graph: DiGraph<TaskId, EdgeMeta>,
    indices: HashMap<TaskId, NodeIndex>,
    order: Vec<TaskId>,
    ranks: HashMap<TaskId, usize>,
}

/// Outcome of evaluating pending tasks against their upstream states
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Pending tasks whose upstream edges are all satisfied, in dispatch order
    pub ready: Vec<TaskId>,
    /// Pending tasks that can no longer run, with the reason
    pub blocked: Vec<(TaskId, RunNote)>,
}

enum EdgeStatus {
    Satisfied,
    Waiting,
    Blocked(RunNote),
}

impl PipelineDag {
    /// Build a DAG from task specifications, rejecting cycles
    pub fn build(tasks: &[TaskSpec]) -> Result<Self, PipelineError> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        // Add all tasks as nodes
        for task in tasks {
            let node = graph.add_node(task.id.clone());
            indices.insert(task.id.clone(), node);
        }

        // Add dependency edges (upstream -> task)
        for task in tasks {
            let task_idx = indices[&task.id];
            for upstream in &task.upstream {
                if upstream.task == task.id {
                    return Err(PipelineError::SelfDependency(task.id.clone()));
                }
                let up_idx = *indices.get(&upstream.task).ok_or_else(|| {
                    PipelineError::UnknownUpstream {
                        task: task.id.clone(),
                        upstream: upstream.task.clone(),
                    }
                })?;
                if graph.find_edge(up_idx, task_idx).is_none() {
                    graph.add_edge(
                        up_idx,
                        task_idx,
                        EdgeMeta {
                            continue_on_failure: upstream.continue_on_failure,
                        },
                    );
                }
            }
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(PipelineError::Cycle {
                task: graph[cycle.node_id()].clone(),
            });
        }

        let order = kahn_order(&graph);
        let ranks = order
            .iter()
            .enumerate()
            .map(|(rank, id)| (id.clone(), rank))
            .collect();

        Ok(Self {
            graph,
            indices,
            order,
            ranks,
        })
    }

    /// Tasks in deterministic topological order (dependencies first)
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Position of a task in the topological order
    pub fn rank(&self, task_id: &TaskId) -> Option<usize> {
        self.ranks.get(task_id).copied()
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.indices.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct upstream tasks
    pub fn dependencies(&self, task_id: &TaskId) -> Vec<TaskId> {
        self.neighbors(task_id, Direction::Incoming)
    }

    /// Direct downstream tasks
    pub fn dependents(&self, task_id: &TaskId) -> Vec<TaskId> {
        self.neighbors(task_id, Direction::Outgoing)
    }

    /// All direct and transitive downstream tasks, in topological order
    pub fn descendants(&self, task_id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.indices.get(task_id) else {
            return Vec::new();
        };
        let mut found = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                found.insert(self.graph[node].clone());
            }
        }
        self.order
            .iter()
            .filter(|id| found.contains(*id))
            .cloned()
            .collect()
    }

    /// Tasks with no dependencies (can start immediately)
    pub fn entry_tasks(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.dependencies(id).is_empty())
            .cloned()
            .collect()
    }

    /// Tasks whose every upstream id is in `completed` and that are not yet
    /// dispatched, in ascending (rank, id) order
    pub fn ready_set(
        &self,
        completed: &HashSet<TaskId>,
        dispatched: &HashSet<TaskId>,
    ) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id) && !dispatched.contains(*id))
            .filter(|id| self.dependencies(id).iter().all(|dep| completed.contains(dep)))
            .cloned()
            .collect()
    }

    /// Evaluate pending task runs against their upstream states.
    ///
    /// Blocked tasks propagate to their own dependents within the same pass,
    /// so one call covers the whole transitive downstream of a failure.
    pub fn resolve(&self, runs: &HashMap<TaskId, TaskRun>) -> Resolution {
        let mut resolution = Resolution::default();
        let mut blocked_now: HashMap<&TaskId, RunNote> = HashMap::new();

        for id in &self.order {
            let Some(run) = runs.get(id) else {
                continue;
            };
            if run.state != TaskState::Pending {
                continue;
            }

            let node = self.indices[id];
            let mut waiting = false;
            let mut blocked: Option<RunNote> = None;

            for edge in self.graph.edges_directed(node, Direction::Incoming) {
                let up_id = &self.graph[edge.source()];
                let continue_on_failure = edge.weight().continue_on_failure;
                let status = match blocked_now.get(up_id) {
                    Some(_) if continue_on_failure => EdgeStatus::Satisfied,
                    Some(note) => EdgeStatus::Blocked(note.clone()),
                    None => edge_status(up_id, runs.get(up_id), continue_on_failure),
                };

                match status {
                    EdgeStatus::Satisfied => {}
                    EdgeStatus::Waiting => waiting = true,
                    EdgeStatus::Blocked(note) => {
                        // A failure outranks a short circuit as the reported cause
                        let replace = match (&blocked, &note) {
                            (None, _) => true,
                            (
                                Some(RunNote::UpstreamShortCircuit { .. }),
                                RunNote::UpstreamFailed { .. },
                            ) => true,
                            _ => false,
                        };
                        if replace {
                            blocked = Some(note);
                        }
                    }
                }
            }

            if let Some(note) = blocked {
                blocked_now.insert(id, note.clone());
                resolution.blocked.push((id.clone(), note));
            } else if !waiting {
                resolution.ready.push(id.clone());
            }
        }

        resolution
    }

    /// Sort key used to break ties between simultaneously ready tasks
    pub fn dispatch_key<'a>(&self, task_id: &'a TaskId) -> (usize, &'a TaskId) {
        (self.rank(task_id).unwrap_or(usize::MAX), task_id)
    }

    fn neighbors(&self, task_id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&node) = self.indices.get(task_id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort_by(|a, b| self.dispatch_key(a).cmp(&self.dispatch_key(b)));
        ids
    }
}

fn edge_status(up_id: &TaskId, upstream: Option<&TaskRun>, continue_on_failure: bool) -> EdgeStatus {
    let Some(run) = upstream else {
        return EdgeStatus::Waiting;
    };
    if run.is_satisfied() {
        return EdgeStatus::Satisfied;
    }
    if !run.state.is_terminal() {
        return EdgeStatus::Waiting;
    }
    if continue_on_failure {
        return EdgeStatus::Satisfied;
    }

    let note = match (run.state, &run.note) {
        (TaskState::Success, _) => RunNote::UpstreamShortCircuit {
            origin: up_id.clone(),
        },
        (TaskState::Skipped, Some(note @ RunNote::UpstreamFailed { .. }))
        | (TaskState::Skipped, Some(note @ RunNote::UpstreamShortCircuit { .. })) => note.clone(),
        _ => RunNote::UpstreamFailed {
            root: up_id.clone(),
        },
    };
    EdgeStatus::Blocked(note)
}

/// Kahn's algorithm, always taking the smallest ready id next
fn kahn_order(graph: &DiGraph<TaskId, EdgeMeta>) -> Vec<TaskId> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: BTreeMap<TaskId, NodeIndex> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(n, _)| (graph[*n].clone(), *n))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some((id, node)) = ready.pop_first() {
        order.push(id);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(graph[next].clone(), next);
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::definition::TaskAction;
    use crate::types::{IdempotencyKey, PipelineVersion, RunId, Transition};

    fn task(id: &str) -> TaskSpec {
        TaskSpec::new(
            id,
            TaskAction::Transform {
                sql: "SELECT COUNT(*) FROM t".to_string(),
            },
        )
    }

    fn runs_for(dag: &PipelineDag) -> HashMap<TaskId, TaskRun> {
        let run_id = RunId::new();
        dag.topological_order()
            .iter()
            .map(|id| {
                let key = IdempotencyKey::derive(&PipelineVersion::new("1"), id, "p");
                (id.clone(), TaskRun::pending(run_id, id.clone(), key, true))
            })
            .collect()
    }

    fn set(runs: &mut HashMap<TaskId, TaskRun>, id: &str, path: &[TaskState]) {
        let run = runs.get_mut(&TaskId::new(id)).unwrap();
        for state in path {
            run.apply(&Transition::to(*state, 1)).unwrap();
        }
    }

    fn ids(list: &[TaskId]) -> Vec<&str> {
        list.iter().map(|id| id.as_str()).collect()
    }

    #[test]
    fn test_linear_dag() {
        let dag = PipelineDag::build(&[
            task("step3").after("step2"),
            task("step1"),
            task("step2").after("step1"),
        ])
        .unwrap();

        assert_eq!(ids(dag.topological_order()), vec!["step1", "step2", "step3"]);
        assert_eq!(dag.rank(&TaskId::new("step3")), Some(2));
        assert_eq!(ids(&dag.entry_tasks()), vec!["step1"]);
    }

    #[test]
    fn test_order_is_a_valid_topological_order() {
        let tasks = vec![
            task("e").after("c").after("d"),
            task("d").after("a"),
            task("c").after("a").after("b"),
            task("b"),
            task("a"),
            task("f").after("e").after("b"),
        ];
        let dag = PipelineDag::build(&tasks).unwrap();
        let order = dag.topological_order();

        for spec in &tasks {
            let pos = dag.rank(&spec.id).unwrap();
            for up in &spec.upstream {
                assert!(dag.rank(&up.task).unwrap() < pos, "{} before {}", up.task, spec.id);
            }
        }
        // Ties broken by id
        assert_eq!(ids(order), vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn test_cyclic_dag_rejected() {
        let result = PipelineDag::build(&[
            task("a").after("c"),
            task("b").after("a"),
            task("c").after("b"),
        ]);
        match result {
            Err(PipelineError::Cycle { task }) => {
                assert!(["a", "b", "c"].contains(&task.as_str()))
            }
            other => panic!("expected cycle error, got {:?}", other.map(|d| d.len())),
        }
    }

    #[test]
    fn test_self_dependency_rejected() {
        let result = PipelineDag::build(&[task("a").after("a")]);
        assert!(matches!(result, Err(PipelineError::SelfDependency(_))));
    }

    #[test]
    fn test_ready_set() {
        let dag = PipelineDag::build(&[
            task("a"),
            task("b").after("a"),
            task("c").after("a"),
            task("d").after("b").after("c"),
        ])
        .unwrap();

        let mut completed = HashSet::new();
        let mut dispatched = HashSet::new();
        assert_eq!(ids(&dag.ready_set(&completed, &dispatched)), vec!["a"]);

        completed.insert(TaskId::new("a"));
        assert_eq!(ids(&dag.ready_set(&completed, &dispatched)), vec!["b", "c"]);

        dispatched.insert(TaskId::new("b"));
        assert_eq!(ids(&dag.ready_set(&completed, &dispatched)), vec!["c"]);

        completed.insert(TaskId::new("b"));
        completed.insert(TaskId::new("c"));
        assert_eq!(ids(&dag.ready_set(&completed, &dispatched)), vec!["d"]);
    }

    #[test]
    fn test_descendants() {
        let dag = PipelineDag::build(&[
            task("a"),
            task("b").after("a"),
            task("c").after("b"),
            task("x"),
        ])
        .unwrap();
        assert_eq!(ids(&dag.descendants(&TaskId::new("a"))), vec!["b", "c"]);
        assert!(dag.descendants(&TaskId::new("x")).is_empty());
        assert_eq!(ids(&dag.dependents(&TaskId::new("a"))), vec!["b"]);
    }

    #[test]
    fn test_resolve_skips_transitive_downstream_of_failure() {
        let dag = PipelineDag::build(&[
            task("a"),
            task("b").after("a"),
            task("c").after("a"),
            task("d").after("b"),
        ])
        .unwrap();
        let mut runs = runs_for(&dag);

        let initial = dag.resolve(&runs);
        assert_eq!(ids(&initial.ready), vec!["a"]);

        set(&mut runs, "a", &[TaskState::Queued, TaskState::Running, TaskState::Success]);
        set(&mut runs, "b", &[TaskState::Queued, TaskState::Running, TaskState::Failed]);

        let resolution = dag.resolve(&runs);
        assert_eq!(ids(&resolution.ready), vec!["c"]);
        assert_eq!(
            resolution.blocked,
            vec![(
                TaskId::new("d"),
                RunNote::UpstreamFailed {
                    root: TaskId::new("b")
                }
            )]
        );
    }

    #[test]
    fn test_resolve_continue_on_failure_edge() {
        let dag = PipelineDag::build(&[
            task("a"),
            task("b").after_any("a"),
            task("c").after("b"),
        ])
        .unwrap();
        let mut runs = runs_for(&dag);
        set(&mut runs, "a", &[TaskState::Queued, TaskState::Running, TaskState::Failed]);

        let resolution = dag.resolve(&runs);
        assert_eq!(ids(&resolution.ready), vec!["b"]);
        assert!(resolution.blocked.is_empty());
    }

    #[test]
    fn test_resolve_short_circuit_propagates_origin() {
        let dag = PipelineDag::build(&[task("a"), task("b").after("a"), task("c").after("b")]).unwrap();
        let mut runs = runs_for(&dag);
        {
            let run = runs.get_mut(&TaskId::new("a")).unwrap();
            run.apply(&Transition::to(TaskState::Queued, 1)).unwrap();
            run.apply(&Transition::to(TaskState::Running, 1)).unwrap();
            run.apply(
                &Transition::to(TaskState::Success, 1).with_note(RunNote::ShortCircuit {
                    reason: "missing".to_string(),
                }),
            )
            .unwrap();
        }

        let resolution = dag.resolve(&runs);
        let origin = RunNote::UpstreamShortCircuit {
            origin: TaskId::new("a"),
        };
        assert_eq!(
            resolution.blocked,
            vec![(TaskId::new("b"), origin.clone()), (TaskId::new("c"), origin)]
        );
    }
}

//! Execution tree navigation.
//!
//! Records of one run form a tree via `parent_id`. The navigator loads flat
//! projected lists from the store and walks them in memory; the only write
//! it performs is the bulk DISCONTINUING update used by abort.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use nodeflow_types::error::EngineError;
use nodeflow_types::execution::{
    ExecutionMode, NodeExecution, RetryableStageInfo, Status, StepCategory,
};
use nodeflow_types::query::{Criterion, NodeField, NodeFilter, Projection};

use crate::execution::state_machine::StatusStateMachine;
use crate::execution::store::NodeExecutionStore;
use crate::repository::node_execution::NodeExecutionRepository;

// ---------------------------------------------------------------------------
// Adjacency
// ---------------------------------------------------------------------------

/// Parent-to-children index over a flat list of records.
#[derive(Debug, Clone, Default)]
pub struct Adjacency {
    nodes: HashMap<Uuid, NodeExecution>,
    children: HashMap<Uuid, Vec<Uuid>>,
}

impl Adjacency {
    pub fn get(&self, id: Uuid) -> Option<&NodeExecution> {
        self.nodes.get(&id)
    }

    pub fn children_of(&self, id: Uuid) -> &[Uuid] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Records whose parent is absent from the list.
    pub fn roots(&self) -> Vec<Uuid> {
        let mut roots: Vec<&NodeExecution> = self
            .nodes
            .values()
            .filter(|n| n.parent_id.is_none_or(|p| !self.nodes.contains_key(&p)))
            .collect();
        roots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        roots.into_iter().map(|n| n.id).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Index records by parent in one pass. Child lists are ordered by creation
/// time, so traversal order does not depend on input order.
pub fn build_adjacency(records: Vec<NodeExecution>) -> Adjacency {
    let mut adjacency = Adjacency::default();
    for node in records {
        if let Some(parent) = node.parent_id {
            adjacency.children.entry(parent).or_default().push(node.id);
        }
        adjacency.nodes.insert(node.id, node);
    }
    let nodes = &adjacency.nodes;
    for ids in adjacency.children.values_mut() {
        ids.sort_by(|a, b| {
            let (na, nb) = (&nodes[a], &nodes[b]);
            na.created_at.cmp(&nb.created_at).then(a.cmp(b))
        });
        ids.dedup();
    }
    adjacency
}

/// Depth-first walk from `root_id`.
///
/// With `cross_group_boundary = false` a STRATEGY node below the root is
/// returned but its fan-out iterations are not descended into.
pub fn extract_subtree(
    adjacency: &Adjacency,
    root_id: Uuid,
    include_root: bool,
    cross_group_boundary: bool,
) -> Vec<NodeExecution> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![root_id];

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let node = adjacency.get(id);
        if id != root_id || include_root {
            if let Some(node) = node {
                out.push(node.clone());
            }
        }
        let opaque = !cross_group_boundary
            && id != root_id
            && node.is_some_and(|n| n.step_category == StepCategory::Strategy);
        if opaque {
            continue;
        }
        for child in adjacency.children_of(id).iter().rev() {
            stack.push(*child);
        }
    }
    out
}

/// Depth-annotated pre-order listing of every tree in `adjacency`.
pub fn flatten(adjacency: &Adjacency) -> Vec<(usize, NodeExecution)> {
    let mut out = Vec::with_capacity(adjacency.len());
    let mut visited = HashSet::new();
    for root in adjacency.roots() {
        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = adjacency.get(id) {
                out.push((depth, node.clone()));
            }
            for child in adjacency.children_of(id).iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Navigator
// ---------------------------------------------------------------------------

pub struct TreeNavigator<R: NodeExecutionRepository> {
    state_machine: Arc<StatusStateMachine<R>>,
}

impl<R: NodeExecutionRepository> TreeNavigator<R> {
    pub fn new(state_machine: Arc<StatusStateMachine<R>>) -> Self {
        Self { state_machine }
    }

    fn store(&self) -> &NodeExecutionStore<R> {
        self.state_machine.store()
    }

    /// Every record of the run, old retries included, for rendering.
    pub async fn execution_tree(&self, plan_execution_id: Uuid) -> Result<Adjacency, EngineError> {
        let records = self
            .store()
            .find(
                &NodeFilter::plan(plan_execution_id),
                &Projection::tree().with(NodeField::StartTs).with(NodeField::EndTs),
            )
            .await?;
        Ok(build_adjacency(records))
    }

    /// Current descendants of `parent_id` whose status is in `statuses`
    /// (any status when empty).
    ///
    /// The walk runs over every current record of the run so that a matching
    /// node below a non-matching intermediate is still found.
    pub async fn find_all_children_with_status_in(
        &self,
        plan_execution_id: Uuid,
        parent_id: Uuid,
        statuses: &[Status],
        include_parent: bool,
        cross_group_boundary: bool,
    ) -> Result<Vec<NodeExecution>, EngineError> {
        let records = self
            .store()
            .find(&NodeFilter::plan(plan_execution_id).current(), &Projection::tree())
            .await?;
        let adjacency = build_adjacency(records);
        Ok(
            extract_subtree(&adjacency, parent_id, include_parent, cross_group_boundary)
                .into_iter()
                .filter(|n| statuses.is_empty() || statuses.contains(&n.status))
                .collect(),
        )
    }

    /// Breadth-first expansion over current children, level by level.
    pub async fn fetch_children_recursively(
        &self,
        plan_execution_id: Uuid,
        parent_ids: &[Uuid],
    ) -> Result<Vec<NodeExecution>, EngineError> {
        let mut found = Vec::new();
        let mut seen: HashSet<Uuid> = parent_ids.iter().copied().collect();
        let mut frontier: VecDeque<Uuid> = parent_ids.iter().copied().collect();
        let batch = self.store().max_batch_size();

        while !frontier.is_empty() {
            let level: Vec<Uuid> = frontier.drain(..).collect();
            for chunk in level.chunks(batch) {
                let filter = NodeFilter::plan(plan_execution_id)
                    .current()
                    .and(Criterion::ParentIdIn(chunk.to_vec()));
                for child in self.store().find(&filter, &Projection::tree()).await? {
                    if seen.insert(child.id) {
                        frontier.push_back(child.id);
                        found.push(child);
                    }
                }
            }
        }
        debug!(plan_execution_id = %plan_execution_id, count = found.len(), "fetched descendants");
        Ok(found)
    }

    /// One bulk write: current leaf-mode records in `active_statuses`, plus any
    /// QUEUED or INPUT_WAITING record, move to DISCONTINUING.
    pub async fn mark_leaves_and_queued_discontinuing(
        &self,
        plan_execution_id: Uuid,
        active_statuses: &[Status],
    ) -> Result<u64, EngineError> {
        let filter = NodeFilter::plan(plan_execution_id)
            .or(NodeFilter::new()
                .and(Criterion::ModeIn(ExecutionMode::leaf_modes()))
                .status_in(active_statuses.iter().copied())
                .current())
            .or(NodeFilter::new().status_in([Status::Queued, Status::InputWaiting]));
        let changed = self
            .state_machine
            .bulk_transition(filter, Status::Discontinuing)
            .await?;
        info!(plan_execution_id = %plan_execution_id, changed, "marked leaves discontinuing");
        Ok(changed)
    }

    /// Stages (and stage-level strategies) of the run in pipeline order.
    pub async fn stage_summary(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<RetryableStageInfo>, EngineError> {
        let filter = NodeFilter::plan(plan_execution_id)
            .current()
            .and(Criterion::CategoryIn(vec![StepCategory::Stage, StepCategory::Strategy]))
            .and(Criterion::StatusNotIn(vec![Status::Skipped]));
        let candidates = self
            .store()
            .find(&filter, &Projection::stage_summary())
            .await?;
        let items = stage_level(candidates);
        let by_id: HashMap<Uuid, &NodeExecution> = items.iter().map(|n| (n.id, n)).collect();

        // Parent next-id fallback for nodes that do not carry their own link.
        let parent_ids: Vec<Uuid> = items
            .iter()
            .filter(|n| n.next_id.is_none())
            .filter_map(|n| n.parent_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let parent_next: HashMap<Uuid, Uuid> = self
            .store()
            .find_by_ids(&parent_ids, &Projection::of(&[NodeField::NextId]))
            .await?
            .into_iter()
            .filter_map(|p| p.next_id.map(|next| (p.id, next)))
            .collect();

        let next_of = |node: &NodeExecution| -> Option<Uuid> {
            node.next_id
                .or_else(|| node.parent_id.and_then(|p| parent_next.get(&p).copied()))
                .filter(|next| by_id.contains_key(next))
        };

        let pointed: HashSet<Uuid> = items.iter().filter_map(|n| next_of(n)).collect();
        let mut ordered = Vec::with_capacity(items.len());
        let mut visited = HashSet::new();
        let heads = items.iter().filter(|n| !pointed.contains(&n.id));
        // Anything unreachable from a head (a cycle, say) is appended in
        // creation order.
        for start in heads.chain(items.iter()) {
            let mut cursor = Some(start.id);
            while let Some(id) = cursor {
                if !visited.insert(id) {
                    break;
                }
                let node = by_id[&id];
                ordered.push(stage_info(node));
                cursor = next_of(node);
            }
        }
        Ok(ordered)
    }

    /// `stage_fqn` of each current STAGE record whose identifier is listed.
    pub async fn stage_fqns_for_identifiers(
        &self,
        plan_execution_id: Uuid,
        identifiers: &[String],
    ) -> Result<Vec<String>, EngineError> {
        let mut fqns = Vec::new();
        for chunk in identifiers.chunks(self.store().max_batch_size()) {
            let filter = NodeFilter::plan(plan_execution_id)
                .current()
                .and(Criterion::CategoryIn(vec![StepCategory::Stage]))
                .and(Criterion::IdentifierIn(chunk.to_vec()));
            let records = self
                .store()
                .find(&filter, &Projection::of(&[NodeField::StageFqn]))
                .await?;
            fqns.extend(records.into_iter().filter_map(|n| n.stage_fqn));
        }
        fqns.sort();
        fqns.dedup();
        Ok(fqns)
    }

    /// One record per graph node under the given stage FQNs: the one that
    /// started last. Old retries are considered.
    pub async fn latest_executions_for_stage_fqns(
        &self,
        plan_execution_id: Uuid,
        stage_fqns: &[String],
    ) -> Result<Vec<NodeExecution>, EngineError> {
        let projection = Projection::tree()
            .with(NodeField::StageFqn)
            .with(NodeField::StartTs)
            .with(NodeField::CreatedAt);
        let mut latest: HashMap<String, NodeExecution> = HashMap::new();
        for chunk in stage_fqns.chunks(self.store().max_batch_size()) {
            let filter = NodeFilter::plan(plan_execution_id)
                .and(Criterion::StageFqnIn(chunk.to_vec()));
            for node in self.store().find(&filter, &projection).await? {
                match latest.get(&node.node_id) {
                    Some(existing)
                        if (existing.start_ts, existing.created_at)
                            >= (node.start_ts, node.created_at) => {}
                    _ => {
                        latest.insert(node.node_id.clone(), node);
                    }
                }
            }
        }
        let mut out: Vec<NodeExecution> = latest.into_values().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

/// Keep stages and stage-level strategies; drop stages that are fan-out
/// iterations of a strategy and strategies that only wrap steps.
fn stage_level(candidates: Vec<NodeExecution>) -> Vec<NodeExecution> {
    let strategy_ids: HashSet<Uuid> = candidates
        .iter()
        .filter(|n| n.step_category == StepCategory::Strategy)
        .map(|n| n.id)
        .collect();
    let stage_parents: HashSet<Uuid> = candidates
        .iter()
        .filter(|n| n.step_category == StepCategory::Stage)
        .filter_map(|n| n.parent_id)
        .collect();

    candidates
        .into_iter()
        .filter(|n| match n.step_category {
            StepCategory::Stage => n.parent_id.is_none_or(|p| !strategy_ids.contains(&p)),
            StepCategory::Strategy => stage_parents.contains(&n.id),
            _ => false,
        })
        .collect()
}

fn stage_info(node: &NodeExecution) -> RetryableStageInfo {
    RetryableStageInfo {
        node_execution_id: node.id,
        identifier: node.identifier.clone(),
        name: node.name.clone(),
        stage_fqn: node.stage_fqn.clone(),
        status: node.status,
        parent_id: node.parent_id,
        next_id: node.next_id,
        created_at: node.created_at,
        is_strategy: node.step_category == StepCategory::Strategy,
    }
}

//! Stage graph validation and dependency leveling.
//!
//! Uses `petgraph` to model stage dependencies as a directed graph.
//! Topological sort detects cycles, and depth-based grouping produces
//! levels: every stage in a level can run concurrently because all of its
//! dependencies live in earlier levels.

use std::collections::HashMap;

use orchestra_types::workflow::{RESERVED_STAGE_ID, StageDefinition};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a stage list is not a valid workflow graph.
///
/// Every variant except `Empty` names the offending stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("workflow must have at least one stage")]
    Empty,

    #[error("duplicate stage id '{0}'")]
    DuplicateStage(String),

    #[error("stage id '{0}' is reserved")]
    ReservedStageId(String),

    #[error("stage '{0}' depends on itself")]
    SelfDependency(String),

    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("cycle detected involving stage '{0}'")]
    CycleDetected(String),
}

impl GraphError {
    /// The stage the error is about, if any.
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::DuplicateStage(id)
            | Self::ReservedStageId(id)
            | Self::SelfDependency(id)
            | Self::CycleDetected(id) => Some(id),
            Self::UnknownDependency { stage, .. } => Some(stage),
        }
    }
}

// ---------------------------------------------------------------------------
// Leveling
// ---------------------------------------------------------------------------

/// Validate `stages` and group them into dependency levels.
///
/// 1. Reject empty input, duplicate or reserved IDs, self-references and
///    unknown dependencies.
/// 2. Build a `DiGraph` with an edge from each dependency to its dependent.
/// 3. Run `petgraph::algo::toposort` to reject cycles.
/// 4. A stage's level is one more than its deepest dependency (0 for roots),
///    so no stage sits in a skippable level.
///
/// Within a level, stages keep their input order.
pub fn build_levels<'a>(
    stages: &'a [StageDefinition],
) -> Result<Vec<Vec<&'a StageDefinition>>, GraphError> {
    if stages.is_empty() {
        return Err(GraphError::Empty);
    }

    let mut id_to_idx: HashMap<&str, usize> = HashMap::with_capacity(stages.len());
    for (i, stage) in stages.iter().enumerate() {
        if stage.id == RESERVED_STAGE_ID {
            return Err(GraphError::ReservedStageId(stage.id.clone()));
        }
        if id_to_idx.insert(stage.id.as_str(), i).is_some() {
            return Err(GraphError::DuplicateStage(stage.id.clone()));
        }
    }

    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..stages.len()).map(|i| graph.add_node(i)).collect();

    for (to, stage) in stages.iter().enumerate() {
        for dep in &stage.dependencies {
            if dep == &stage.id {
                return Err(GraphError::SelfDependency(stage.id.clone()));
            }
            let from = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                GraphError::UnknownDependency {
                    stage: stage.id.clone(),
                    dependency: dep.clone(),
                }
            })?;
            graph.add_edge(nodes[*from], nodes[to], ());
        }
    }

    let sorted = toposort(&graph, None)
        .map_err(|cycle| GraphError::CycleDetected(stages[graph[cycle.node_id()]].id.clone()))?;

    let mut depths = vec![0usize; stages.len()];
    for node in sorted {
        let idx = graph[node];
        depths[idx] = stages[idx]
            .dependencies
            .iter()
            .map(|dep| depths[id_to_idx[dep.as_str()]] + 1)
            .max()
            .unwrap_or(0);
    }

    let max_depth = depths.iter().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<&StageDefinition>> = vec![Vec::new(); max_depth + 1];
    for (idx, stage) in stages.iter().enumerate() {
        levels[depths[idx]].push(stage);
    }

    Ok(levels)
}

/// Stages flattened level by level.
pub fn topological_order(stages: &[StageDefinition]) -> Result<Vec<&StageDefinition>, GraphError> {
    Ok(build_levels(stages)?.into_iter().flatten().collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Conditional stage graph.
//!
//! The set of stages a run executes depends on the shape of the resolved
//! design and on two run options. The graph is planned once, up front, and
//! every later decision (directory creation, scheduling, dry-run reporting)
//! reads the planned nodes instead of re-deriving activation predicates.

use atac_types::DesignShape;
use serde::Serialize;
use std::fmt;
use strum_macros::{Display, EnumIter, EnumString};

/// Identity of a pipeline stage. The declaration order is the execution
/// order: every stage appears after all of its upstream stages.
#[derive(
    EnumString, Display, EnumIter, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize,
)]
pub enum StageId {
    /// Align and coordinate-sort one technical library.
    #[strum(to_string = "align_library")]
    AlignLibrary,
    /// Merge a replicate's libraries, mark duplicates and filter.
    #[strum(to_string = "merge_replicate")]
    MergeReplicate,
    /// Merge a condition's replicates and strip flagged duplicates.
    #[strum(to_string = "merge_condition")]
    MergeCondition,
    /// Call peaks on each replicate-level alignment.
    #[strum(to_string = "call_peaks_replicate")]
    CallPeaksReplicate,
    /// Call peaks on each condition-level alignment.
    #[strum(to_string = "call_peaks_condition")]
    CallPeaksCondition,
    /// Build the consensus peak set across all replicate peak sets.
    #[strum(to_string = "consensus_replicate")]
    ConsensusReplicate,
    /// Build the consensus peak set across all condition peak sets.
    #[strum(to_string = "consensus_condition")]
    ConsensusCondition,
    /// Count reads in consensus intervals and test replicate-level contrasts.
    #[strum(to_string = "differential_replicate")]
    DifferentialReplicate,
    /// Count reads in consensus intervals and test condition-level contrasts.
    #[strum(to_string = "differential_condition")]
    DifferentialCondition,
}

/// The aggregation level a stage operates at.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize)]
pub enum AggregationLevel {
    /// One technical library (one design row).
    Library,
    /// All libraries of one biological replicate.
    Replicate,
    /// All replicates of one condition.
    Condition,
}

impl fmt::Display for AggregationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregationLevel::Library => "library",
            AggregationLevel::Replicate => "replicate",
            AggregationLevel::Condition => "condition",
        })
    }
}

/// How a stage fans over the keys of its level.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum FanMode {
    /// One independent branch per key; branches may fail individually.
    PerKey,
    /// One invocation consuming every key of the level at once.
    AllKeys,
}

/// One planned stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageNode {
    /// Stage identity.
    pub id: StageId,
    /// Aggregation level of the stage's keys.
    pub level: AggregationLevel,
    /// Fan behaviour over those keys.
    pub fan: FanMode,
    /// Stages whose outputs this stage consumes.
    pub upstream: &'static [StageId],
    /// Whether this run executes the stage.
    pub active: bool,
}

/// Run options that shape the graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Peak calling (and everything downstream of it) is requested.
    pub peak_calling: bool,
    /// Suppress the condition-level aggregation branch entirely.
    pub skip_merge_replicates: bool,
}

/// The planned graph for one run. Nodes are stored in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct StageGraph {
    nodes: Vec<StageNode>,
}

impl StageGraph {
    /// Plan the graph for a design of the given shape.
    ///
    /// Activation rules: the library and replicate aggregations always run.
    /// The condition branch requires real replicates and is suppressed by
    /// `skip_merge_replicates`. Peak calling follows its aggregation. A
    /// consensus needs more than one peak set at its level, and a
    /// differential comparison needs both multiple conditions and
    /// replication underneath them.
    pub fn plan(shape: DesignShape, opts: &PlanOptions) -> StageGraph {
        let DesignShape {
            replicates_exist,
            multiple_conditions,
        } = shape;
        let peaks = opts.peak_calling;
        let condition_branch = !opts.skip_merge_replicates && replicates_exist;
        let consensus_replicate = peaks && (multiple_conditions || replicates_exist);
        let consensus_condition = peaks && condition_branch && multiple_conditions;
        let contrasts = multiple_conditions && replicates_exist;

        use AggregationLevel::{Condition, Library, Replicate};
        use FanMode::{AllKeys, PerKey};
        use StageId::*;
        let nodes = vec![
            StageNode {
                id: AlignLibrary,
                level: Library,
                fan: PerKey,
                upstream: &[],
                active: true,
            },
            StageNode {
                id: MergeReplicate,
                level: Replicate,
                fan: PerKey,
                upstream: &[AlignLibrary],
                active: true,
            },
            StageNode {
                id: MergeCondition,
                level: Condition,
                fan: PerKey,
                upstream: &[MergeReplicate],
                active: condition_branch,
            },
            StageNode {
                id: CallPeaksReplicate,
                level: Replicate,
                fan: PerKey,
                upstream: &[MergeReplicate],
                active: peaks,
            },
            StageNode {
                id: CallPeaksCondition,
                level: Condition,
                fan: PerKey,
                upstream: &[MergeCondition],
                active: peaks && condition_branch,
            },
            StageNode {
                id: ConsensusReplicate,
                level: Replicate,
                fan: AllKeys,
                upstream: &[CallPeaksReplicate],
                active: consensus_replicate,
            },
            StageNode {
                id: ConsensusCondition,
                level: Condition,
                fan: AllKeys,
                upstream: &[CallPeaksCondition],
                active: consensus_condition,
            },
            StageNode {
                id: DifferentialReplicate,
                level: Replicate,
                fan: AllKeys,
                upstream: &[ConsensusReplicate, MergeReplicate],
                active: consensus_replicate && contrasts,
            },
            StageNode {
                id: DifferentialCondition,
                level: Condition,
                fan: AllKeys,
                upstream: &[ConsensusCondition, MergeCondition],
                active: consensus_condition && contrasts,
            },
        ];
        StageGraph { nodes }
    }

    /// All nodes in execution order, inactive ones included.
    pub fn nodes(&self) -> &[StageNode] {
        &self.nodes
    }

    /// The node for `id`.
    pub fn node(&self, id: StageId) -> &StageNode {
        let node = &self.nodes[id as usize];
        assert_eq!(node.id, id);
        node
    }

    /// Does this run execute `id`?
    pub fn is_active(&self, id: StageId) -> bool {
        self.node(id).active
    }

    /// Active nodes in execution order.
    pub fn active_nodes(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes.iter().filter(|n| n.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    fn shape(replicates_exist: bool, multiple_conditions: bool) -> DesignShape {
        DesignShape {
            replicates_exist,
            multiple_conditions,
        }
    }

    fn active_ids(graph: &StageGraph) -> Vec<StageId> {
        graph.active_nodes().map(|n| n.id).collect()
    }

    #[test]
    fn test_full_design_activates_everything() {
        let graph = StageGraph::plan(
            shape(true, true),
            &PlanOptions {
                peak_calling: true,
                skip_merge_replicates: false,
            },
        );
        assert_eq!(active_ids(&graph), StageId::iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_single_condition_with_replicates() {
        let graph = StageGraph::plan(
            shape(true, false),
            &PlanOptions {
                peak_calling: true,
                skip_merge_replicates: false,
            },
        );
        use StageId::*;
        assert_eq!(
            active_ids(&graph),
            vec![
                AlignLibrary,
                MergeReplicate,
                MergeCondition,
                CallPeaksReplicate,
                CallPeaksCondition,
                ConsensusReplicate,
            ]
        );
    }

    #[test]
    fn test_skip_merge_replicates_prunes_condition_branch() {
        let graph = StageGraph::plan(
            shape(true, true),
            &PlanOptions {
                peak_calling: true,
                skip_merge_replicates: true,
            },
        );
        use StageId::*;
        assert_eq!(
            active_ids(&graph),
            vec![
                AlignLibrary,
                MergeReplicate,
                CallPeaksReplicate,
                ConsensusReplicate,
                DifferentialReplicate,
            ]
        );
    }

    #[test]
    fn test_no_peak_calling_leaves_only_aggregation() {
        let graph = StageGraph::plan(
            shape(true, true),
            &PlanOptions {
                peak_calling: false,
                skip_merge_replicates: false,
            },
        );
        use StageId::*;
        assert_eq!(
            active_ids(&graph),
            vec![AlignLibrary, MergeReplicate, MergeCondition]
        );
    }

    #[test]
    fn test_single_library_design_gets_no_consensus() {
        let graph = StageGraph::plan(
            shape(false, false),
            &PlanOptions {
                peak_calling: true,
                skip_merge_replicates: false,
            },
        );
        use StageId::*;
        assert_eq!(
            active_ids(&graph),
            vec![AlignLibrary, MergeReplicate, CallPeaksReplicate]
        );
    }

    #[test]
    fn test_multiple_conditions_without_replicates() {
        // Two conditions, one replicate each: consensus across replicates is
        // meaningful, but nothing condition-level or differential is.
        let graph = StageGraph::plan(
            shape(false, true),
            &PlanOptions {
                peak_calling: true,
                skip_merge_replicates: false,
            },
        );
        use StageId::*;
        assert_eq!(
            active_ids(&graph),
            vec![
                AlignLibrary,
                MergeReplicate,
                CallPeaksReplicate,
                ConsensusReplicate,
            ]
        );
    }

    #[test]
    fn test_active_stages_have_active_upstreams() {
        for replicates in [false, true] {
            for conditions in [false, true] {
                for peaks in [false, true] {
                    for skip in [false, true] {
                        let graph = StageGraph::plan(
                            shape(replicates, conditions),
                            &PlanOptions {
                                peak_calling: peaks,
                                skip_merge_replicates: skip,
                            },
                        );
                        for node in graph.active_nodes() {
                            for &up in node.upstream {
                                assert!(
                                    graph.is_active(up),
                                    "{} active but upstream {} is not",
                                    node.id,
                                    up
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_nodes_are_in_execution_order() {
        let graph = StageGraph::plan(shape(true, true), &PlanOptions::default());
        for (idx, node) in graph.nodes().iter().enumerate() {
            for &up in node.upstream {
                assert!((up as usize) < idx);
            }
        }
    }

    #[test]
    fn test_stage_id_round_trips_through_strings() {
        for id in StageId::iter() {
            assert_eq!(StageId::from_str(&id.to_string()).unwrap(), id);
        }
        assert_eq!(
            StageId::from_str("call_peaks_replicate").unwrap(),
            StageId::CallPeaksReplicate
        );
    }
}

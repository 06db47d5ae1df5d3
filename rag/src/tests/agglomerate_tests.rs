use common::Buffer3;

use crate::agglomerate::{AgglomerationEngine, AgglomerationStats, ConvergeReason, EngineState};
use crate::build::BuildMode;
use crate::config::{AgglomerationConfig, FalseEdgePolicy, SurvivorRule};
use crate::error::RagError;
use crate::events::{CollectingSink, RagEvent};
use crate::features::{FeatureKind, FeatureManager};
use crate::region_graph::{NodeId, RegionGraph};
use crate::tests::{constant, enclosed, gradient, moments_config, patchwork, quadrants, uniform};

fn pair(probability: f64) -> anyhow::Result<(RegionGraph, FeatureManager)> {
    let labels = Buffer3::new(2, 1, 1, vec![1, 2]);
    let probs = Buffer3::new_filled(2, 1, 1, probability);
    let fmgr = FeatureManager::mean_boundary(1)?;
    let graph = RegionGraph::build(&labels, &[probs], &fmgr, BuildMode::Sequential)?;
    Ok((graph, fmgr))
}

fn classified(
    labels: &Buffer3<u32>,
    probability: f64,
) -> anyhow::Result<(RegionGraph, FeatureManager)> {
    let fmgr = FeatureManager::new(1, moments_config().features, Some(constant(probability)))?;
    let graph = RegionGraph::build(labels, &[gradient(labels)], &fmgr, BuildMode::Sequential)?;
    Ok((graph, fmgr))
}

fn run(
    graph: &mut RegionGraph,
    fmgr: &FeatureManager,
    config: AgglomerationConfig,
) -> anyhow::Result<(AgglomerationStats, Vec<RagEvent>)> {
    let sink = CollectingSink::new();
    let mut engine = AgglomerationEngine::new(graph, fmgr, &sink, config)?;
    let stats = engine.run()?;
    Ok((stats, sink.take()))
}

#[test]
fn threshold_is_strictly_less_than() -> anyhow::Result<()> {
    let score = 0.4;
    let eps = 1e-9;

    let (mut graph, fmgr) = pair(score)?;
    run(&mut graph, &fmgr, AgglomerationConfig::with_threshold(score))?;
    assert_eq!(graph.number_of_nodes(), 2);

    let (mut graph, fmgr) = pair(score)?;
    run(&mut graph, &fmgr, AgglomerationConfig::with_threshold(score - eps))?;
    assert_eq!(graph.number_of_nodes(), 2);

    let (mut graph, fmgr) = pair(score)?;
    let (stats, _) = run(&mut graph, &fmgr, AgglomerationConfig::with_threshold(score + eps))?;
    assert_eq!(graph.number_of_nodes(), 1);
    assert_eq!(stats.merges, 1);
    assert_eq!(stats.reason, Some(ConvergeReason::QueueExhausted));
    Ok(())
}

#[test]
fn non_finite_threshold_merges_nothing() -> anyhow::Result<()> {
    let (mut graph, fmgr) = pair(0.9)?;
    let sink = CollectingSink::new();
    for threshold in [f64::NAN, f64::INFINITY] {
        let config = AgglomerationConfig::with_threshold(threshold);
        let result = AgglomerationEngine::new(&mut graph, &fmgr, &sink, config);
        assert!(matches!(result, Err(RagError::InvalidThreshold(_))));
    }

    assert_eq!(graph.number_of_nodes(), 2);
    assert!(sink.events().is_empty());
    Ok(())
}

#[test]
fn engine_rejects_foreign_feature_layout() -> anyhow::Result<()> {
    let (mut graph, _) = classified(&quadrants(), 0.2)?;
    let sink = CollectingSink::new();
    let config = AgglomerationConfig::default();

    let two_channels = FeatureManager::new(2, moments_config().features, Some(constant(0.2)))?;
    let other_kinds = FeatureManager::new(
        1,
        vec![FeatureKind::Histogram {
            nbins: 4,
            compute_percentiles: false,
        }],
        Some(constant(0.2)),
    )?;
    for fmgr in [&two_channels, &other_kinds] {
        assert!(matches!(
            AgglomerationEngine::new(&mut graph, fmgr, &sink, config),
            Err(RagError::FeatureLayoutMismatch)
        ));
    }

    assert_eq!(graph.number_of_nodes(), 4);
    Ok(())
}

#[test]
fn uniform_low_scores_collapse_quadrants() -> anyhow::Result<()> {
    let (mut graph, fmgr) = classified(&quadrants(), 0.3)?;
    let (stats, events) = run(&mut graph, &fmgr, AgglomerationConfig::with_threshold(0.5))?;

    assert_eq!(graph.number_of_nodes(), 1);
    assert_eq!(graph.live_edges().count(), 0);
    assert_eq!(stats.merges, 3);
    assert_eq!(graph.node(NodeId(1)).unwrap().size(), 16);
    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(graph.locate(x, y, 0)?, Some(NodeId(1)));
        }
    }

    let merged = events
        .iter()
        .filter(|event| matches!(event, RagEvent::Merged { .. }))
        .count();
    assert_eq!(merged, 3);
    assert!(matches!(
        events.first(),
        Some(RagEvent::Merged {
            survivor: NodeId(1),
            absorbed: NodeId(2),
            ..
        })
    ));
    assert!(matches!(events.last(), Some(RagEvent::Converged { merges: 3, .. })));
    graph.validate()?;
    Ok(())
}

#[test]
fn high_scores_stop_at_threshold() -> anyhow::Result<()> {
    let (mut graph, fmgr) = classified(&quadrants(), 0.7)?;
    let (stats, _) = run(&mut graph, &fmgr, AgglomerationConfig::with_threshold(0.5))?;

    assert_eq!(graph.number_of_nodes(), 4);
    assert_eq!(stats.merges, 0);
    assert_eq!(stats.reason, Some(ConvergeReason::ThresholdReached));
    for edge in graph.live_edges() {
        assert_eq!(edge.weight(), Some(0.7));
    }
    Ok(())
}

#[test]
fn constrained_pairs_never_end_up_together() -> anyhow::Result<()> {
    let labels = patchwork(10, 8, 6);
    let fmgr = FeatureManager::mean_boundary(1)?;
    let mut graph = RegionGraph::build(&labels, &[gradient(&labels)], &fmgr, BuildMode::Parallel)?;

    let ids: Vec<NodeId> = graph.active_nodes().map(|node| node.id()).collect();
    let constrained = [(ids[0], ids[1]), (ids[2], ids[ids.len() - 1])];
    for (a, b) in constrained {
        graph.add_constraint(a, b)?;
    }

    let (stats, _) = run(&mut graph, &fmgr, AgglomerationConfig::with_threshold(1.5))?;
    assert!(stats.merges > 0);
    for (a, b) in constrained {
        assert_ne!(graph.resolve(a), graph.resolve(b));
    }

    let non_background = labels.iter().filter(|&&label| label != 0).count() as u64;
    assert_eq!(graph.total_size(), non_background);
    graph.validate()?;
    Ok(())
}

#[test]
fn preserved_edges_are_never_merged() -> anyhow::Result<()> {
    let (mut graph, fmgr) = classified(&quadrants(), 0.1)?;
    graph.set_preserve(NodeId(1), NodeId(2), true)?;
    graph.set_preserve(NodeId(1), NodeId(3), true)?;

    run(&mut graph, &fmgr, AgglomerationConfig::with_threshold(0.5))?;

    // 2, 3 and 4 collapse; the combined edge to 1 stays preserved
    assert_eq!(graph.number_of_nodes(), 2);
    let edges: Vec<_> = graph.live_edges().collect();
    assert_eq!(edges.len(), 1);
    assert!(edges[0].is_preserve());
    assert_eq!(edges[0].node1(), NodeId(1));
    Ok(())
}

#[test]
fn false_edges_follow_the_policy() -> anyhow::Result<()> {
    let labels = Buffer3::new(3, 1, 1, vec![1, 2, 3]);
    let fmgr = FeatureManager::mean_boundary(1)?;
    let build = || RegionGraph::build(&labels, &[uniform(&labels, 0.9)], &fmgr, BuildMode::Sequential);

    let mut graph = build()?;
    graph.set_false_edge(NodeId(1), NodeId(2), true)?;
    run(&mut graph, &fmgr, AgglomerationConfig::with_threshold(0.5))?;
    assert_eq!(graph.number_of_nodes(), 3);

    let mut graph = build()?;
    graph.set_false_edge(NodeId(1), NodeId(2), true)?;
    let config = AgglomerationConfig {
        false_edge_policy: FalseEdgePolicy::MergeFirst,
        ..AgglomerationConfig::with_threshold(0.5)
    };
    let (stats, _) = run(&mut graph, &fmgr, config)?;
    assert_eq!(stats.merges, 1);
    assert_eq!(graph.number_of_nodes(), 2);
    assert_eq!(graph.resolve(NodeId(2)), Some(NodeId(1)));
    assert_eq!(graph.resolve(NodeId(3)), Some(NodeId(3)));
    Ok(())
}

#[test]
fn budget_and_survivor_rule() -> anyhow::Result<()> {
    let (mut graph, fmgr) = classified(&quadrants(), 0.2)?;
    let config = AgglomerationConfig {
        max_merges: Some(1),
        survivor: SurvivorRule::LowerId,
        ..AgglomerationConfig::with_threshold(0.5)
    };

    let sink = CollectingSink::new();
    let mut engine = AgglomerationEngine::new(&mut graph, &fmgr, &sink, config)?;
    assert_eq!(engine.state(), EngineState::Ready);
    let stats = engine.run()?;
    assert_eq!(stats.merges, 1);
    assert_eq!(
        engine.state(),
        EngineState::Converged(ConvergeReason::BudgetExhausted)
    );
    assert_eq!(engine.run()?, stats);
    assert_eq!(engine.graph().number_of_nodes(), 3);
    assert_eq!(engine.graph().resolve(NodeId(2)), Some(NodeId(1)));
    Ok(())
}

#[test]
fn larger_region_survives() -> anyhow::Result<()> {
    let labels = Buffer3::new(3, 1, 1, vec![4, 9, 9]);
    let fmgr = FeatureManager::mean_boundary(1)?;
    let mut graph = RegionGraph::build(&labels, &[uniform(&labels, 0.1)], &fmgr, BuildMode::Sequential)?;

    run(&mut graph, &fmgr, AgglomerationConfig::default())?;
    assert_eq!(graph.locate(0, 0, 0)?, Some(NodeId(9)));
    assert_eq!(graph.node(NodeId(9)).unwrap().size(), 3);
    assert!(!graph.node(NodeId(4)).unwrap().is_active());
    Ok(())
}

#[test]
fn inclusions_are_absorbed_by_their_only_neighbor() -> anyhow::Result<()> {
    let labels = enclosed();
    let fmgr = FeatureManager::mean_boundary(1)?;
    let probs = uniform(&labels, 0.9);

    let mut graph = RegionGraph::build(&labels, &[probs.clone()], &fmgr, BuildMode::Sequential)?;
    let sink = CollectingSink::new();
    let mut engine = AgglomerationEngine::new(&mut graph, &fmgr, &sink, AgglomerationConfig::default())?;
    assert_eq!(engine.remove_inclusions()?, 1);
    assert_eq!(engine.stats().inclusions_removed, 1);
    assert_eq!(graph.number_of_nodes(), 1);
    assert_eq!(graph.node(NodeId(1)).unwrap().size(), 25);
    assert_eq!(graph.locate(2, 2, 0)?, Some(NodeId(1)));
    assert_eq!(
        sink.events(),
        vec![RagEvent::InclusionRemoved {
            survivor: NodeId(1),
            absorbed: NodeId(2)
        }]
    );

    let mut graph = RegionGraph::build(&labels, &[probs.clone()], &fmgr, BuildMode::Sequential)?;
    graph.set_preserve(NodeId(1), NodeId(2), true)?;
    let mut engine = AgglomerationEngine::new(&mut graph, &fmgr, &sink, AgglomerationConfig::default())?;
    assert_eq!(engine.remove_inclusions()?, 0);

    let mut graph = RegionGraph::build(&labels, &[probs], &fmgr, BuildMode::Sequential)?;
    graph.add_constraint(NodeId(1), NodeId(2))?;
    let mut engine = AgglomerationEngine::new(&mut graph, &fmgr, &sink, AgglomerationConfig::default())?;
    assert_eq!(engine.remove_inclusions()?, 0);
    assert_eq!(graph.number_of_nodes(), 2);
    Ok(())
}

#[test]
fn nested_inclusions_cascade() -> anyhow::Result<()> {
    // 3 inside 2 inside 1
    let mut labels = Buffer3::new_filled(7, 7, 1, 1u32);
    for y in 2..5 {
        for x in 2..5 {
            *labels.get_mut(x, y, 0) = 2;
        }
    }
    *labels.get_mut(3, 3, 0) = 3;

    let fmgr = FeatureManager::mean_boundary(1)?;
    let mut graph = RegionGraph::build(&labels, &[uniform(&labels, 0.9)], &fmgr, BuildMode::Sequential)?;
    let sink = CollectingSink::new();
    let mut engine = AgglomerationEngine::new(&mut graph, &fmgr, &sink, AgglomerationConfig::default())?;

    assert_eq!(engine.remove_inclusions()?, 2);
    assert_eq!(graph.number_of_nodes(), 1);
    assert_eq!(graph.total_size(), 49);
    graph.validate()?;
    Ok(())
}

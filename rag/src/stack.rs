use std::path::Path;
use std::sync::Arc;

use common::Buffer3;

use crate::agglomerate::{AgglomerationEngine, AgglomerationStats};
use crate::build::BuildMode;
use crate::config::{AgglomerationConfig, FeatureConfig};
use crate::error::{RagError, RagResult};
use crate::events::{EventSink, RagEvent, TracingSink};
use crate::exclusion::{AnnotationFile, ExclusionSet};
use crate::export::{self, GraphSummary};
use crate::features::{Classifier, FeatureManager};
use crate::region_graph::RegionGraph;

pub struct StackOptions {
    pub features: FeatureConfig,
    pub classifier: Option<Arc<dyn Classifier>>,
    /// Everything but the threshold, which each `agglomerate` call supplies.
    pub agglomeration: AgglomerationConfig,
    pub build_mode: BuildMode,
    pub annotations: Option<AnnotationFile>,
    pub sink: Arc<dyn EventSink>,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            classifier: None,
            agglomeration: AgglomerationConfig::default(),
            build_mode: BuildMode::default(),
            annotations: None,
            sink: Arc::new(TracingSink),
        }
    }
}

impl StackOptions {
    pub fn with_classifier(
        mut self,
        features: FeatureConfig,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        self.features = features;
        self.classifier = Some(classifier);
        self
    }

    pub fn with_agglomeration(mut self, config: AgglomerationConfig) -> Self {
        self.agglomeration = config;
        self
    }

    pub fn with_build_mode(mut self, mode: BuildMode) -> Self {
        self.build_mode = mode;
        self
    }

    pub fn with_annotations(mut self, annotations: AnnotationFile) -> Self {
        self.annotations = Some(annotations);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// A watershed volume, its region graph and everything needed to agglomerate it.
pub struct Stack {
    graph: RegionGraph,
    fmgr: FeatureManager,
    config: AgglomerationConfig,
    exclusions: Option<ExclusionSet>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("dims", &self.graph.dims())
            .field("nodes", &self.graph.number_of_nodes())
            .field("fmgr", &self.fmgr)
            .field("config", &self.config)
            .finish()
    }
}

impl Stack {
    /// Validates the feature setup, then builds the graph.
    ///
    /// Nothing is built when the configuration is rejected.
    pub fn new(
        watershed: &Buffer3<u32>,
        channels: &[Buffer3<f64>],
        options: StackOptions,
    ) -> RagResult<Self> {
        let StackOptions {
            features,
            classifier,
            agglomeration,
            build_mode,
            annotations,
            sink,
        } = options;

        let fmgr = FeatureManager::new(channels.len(), features.features, classifier)?;
        let graph = RegionGraph::build(watershed, channels, &fmgr, build_mode)?;
        sink.record(&RagEvent::GraphBuilt {
            nodes: graph.number_of_nodes(),
            edges: graph.live_edges().count(),
            voxels: graph.voxel_count(),
        });

        let mut stack = Self {
            graph,
            fmgr,
            config: agglomeration,
            exclusions: None,
            sink,
        };
        if let Some(annotations) = annotations {
            stack.set_exclusions(&annotations)?;
        }

        Ok(stack)
    }

    pub fn graph(&self) -> &RegionGraph {
        &self.graph
    }

    /// For flagging edges (`set_preserve`, `set_false_edge`) before agglomerating.
    pub fn graph_mut(&mut self) -> &mut RegionGraph {
        &mut self.graph
    }

    pub fn feature_manager(&self) -> &FeatureManager {
        &self.fmgr
    }

    pub fn exclusions(&self) -> Option<&ExclusionSet> {
        self.exclusions.as_ref()
    }

    pub fn number_of_nodes(&self) -> usize {
        self.graph.number_of_nodes()
    }

    pub fn agglomerate(&mut self, threshold: f64) -> RagResult<AgglomerationStats> {
        let config = AgglomerationConfig {
            threshold,
            ..self.config
        };
        let mut engine =
            AgglomerationEngine::new(&mut self.graph, &self.fmgr, self.sink.as_ref(), config)?;
        engine.run()
    }

    pub fn remove_inclusions(&mut self) -> RagResult<usize> {
        let mut engine = AgglomerationEngine::new(
            &mut self.graph,
            &self.fmgr,
            self.sink.as_ref(),
            self.config,
        )?;
        engine.remove_inclusions()
    }

    pub fn segmentation(&self) -> Buffer3<u32> {
        export::labels(&self.graph)
    }

    /// Replaces the annotation points and adds their constraints.
    ///
    /// Constraints registered earlier stay on the graph.
    pub fn set_exclusions(&mut self, annotations: &AnnotationFile) -> RagResult<usize> {
        let mut set = ExclusionSet::new();
        let added = set.register_file(&mut self.graph, annotations, self.sink.as_ref())?;
        self.exclusions = Some(set);
        Ok(added)
    }

    pub fn load_exclusions(&mut self, path: impl AsRef<Path>) -> RagResult<usize> {
        let annotations = AnnotationFile::from_file(path)?;
        self.set_exclusions(&annotations)
    }

    pub fn summary(&mut self) -> GraphSummary {
        export::summarize(
            &mut self.graph,
            &self.fmgr,
            self.exclusions.as_ref(),
            self.sink.as_ref(),
        )
    }

    pub fn write_summary_json(&mut self, path: impl AsRef<Path>) -> RagResult<()> {
        self.summary().write_json(path)
    }

    /// Training a classifier from ground truth is not supported.
    pub fn learn_agglomerate(&mut self, _ground_truth: &Buffer3<u32>) -> RagResult<()> {
        Err(RagError::NotImplemented("learn_agglomerate"))
    }

    pub fn try_clone(&self) -> RagResult<Stack> {
        Err(RagError::NotImplemented("Stack::try_clone"))
    }
}

pub mod agglomerate;
pub mod build;
pub mod config;
pub mod error;
pub mod events;
pub mod exclusion;
pub mod export;
pub mod features;
pub mod region_graph;
pub mod stack;

#[cfg(test)]
mod tests;

pub use agglomerate::{AgglomerationEngine, AgglomerationStats, ConvergeReason, EngineState};
pub use build::BuildMode;
pub use config::{AgglomerationConfig, FalseEdgePolicy, FeatureConfig, SurvivorRule};
pub use error::{MergeRejection, RagError, RagResult};
pub use events::{CollectingSink, EventSink, RagEvent, TracingSink};
pub use exclusion::{AnnotationFile, AnnotationItem, ExclusionSet};
pub use export::{EdgeRecord, GraphSummary};
pub use features::{Classifier, FeatureKind, FeatureManager};
pub use region_graph::{NodeId, Point3, RegionGraph};
pub use stack::{Stack, StackOptions};

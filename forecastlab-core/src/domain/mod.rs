//! Domain types shared by every stage of the pipeline.

pub mod ids;
pub mod record;
pub mod window;

pub use ids::{PipelineRunId, TrialId};
pub use record::{is_strictly_ordered, Granularity, ParseGranularityError, RawRecord};
pub use window::TimeWindow;

/// Symbol type alias
pub type Symbol = String;

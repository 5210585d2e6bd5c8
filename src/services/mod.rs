pub mod report;
pub mod scan;
pub mod select;

pub use report::{Report, SortKey, summarize};
pub use scan::{PipelineError, ScanRequest, ScanSummary, measure_distances, run_scan};
pub use select::run_session;

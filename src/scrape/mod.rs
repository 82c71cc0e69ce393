pub mod engine;
pub mod pipeline;
pub mod planner;

pub use engine::{ScrapeError, ScrapeOutcome, ScrapeStatus, ScraperEngine};
pub use pipeline::{PipelineStats, RecordPipeline};
pub use planner::{plan_scrape, PlanError, ScrapePlan, WorkUnit};

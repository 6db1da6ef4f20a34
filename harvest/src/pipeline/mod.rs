pub mod chunker;
pub mod dates;
pub mod enrichment;
pub mod search;

pub use chunker::{plan_windows, ChunkWindow, Chunker, FetchReport};
pub use dates::{filter_to_window, normalize_timestamp, parse_datetime_text, WindowFilter};
pub use enrichment::{EnrichmentCoordinator, EnrichmentMetrics, EnrichmentTask, SubFetchOutcome};
pub use search::{DedupSet, PagedSearchClient, StopReason};

//! Cache orchestrator and range-aware lazy reader: the glue between the
//! hydrator, metadata cache, and distributed block cache (each its own
//! crate) and the HTTP surface `casserole-server` exposes.

mod orchestrator;
mod reader;

pub use orchestrator::{CacheMetrics, Orchestrator, OrchestratorConfig};
pub use reader::{
    effective_ranges, parse_range, BlockReaderAt, ByteRange, LazyRangeReader, MultiReaderAt,
    SeekFrom, SizeReaderAt,
};

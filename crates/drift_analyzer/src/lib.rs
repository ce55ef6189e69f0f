//! Offline analysis of scheduler operator logs.
//!
//! [`transfer`] measures how much of the observed peer movement is cyclic
//! (redundant) and how much is net topology change (necessary). [`ingest`]
//! feeds it from operator log files.

pub mod ingest;
pub mod transfer;

pub use ingest::{IngestError, IngestSummary, LineOutcome, LogIngester, Move, Operator, TimeWindow};
pub use transfer::{
    append_result_line, result_line, AnalyzerError, Cycle, TransferCounter, TransferSummary,
};

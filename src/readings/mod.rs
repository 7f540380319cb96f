//! Consumers of the link payload stream
//!
//! Payloads are parsed and smoothed by the [`ReadingPipeline`]; the
//! [`Recorder`] samples the smoothed values into CSV files on demand.

pub mod filter;
pub mod pipeline;
pub mod recorder;

pub use pipeline::{FilteredValues, ReadingPipeline};
pub use recorder::{Recorder, RecorderConfig};

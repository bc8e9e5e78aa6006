//! Frame pipeline: acquisition loop and per-sensor fan-out.

pub mod fanout;
pub mod grab;

pub use fanout::{FanOut, FrameReport, PipelineTotals, SensorReport};
pub use grab::{run, GrabSummary};

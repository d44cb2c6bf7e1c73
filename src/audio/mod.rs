//! Microphone capture, the mixing graph, and level metering.

pub mod capture;
pub mod graph;
pub mod level;
pub mod meter;
pub mod ring_buffer;

pub use graph::{AnalyserNode, AudioGraph, AudioGraphBuilder, GainNode};
pub use level::DbfsRms;
pub use meter::{MeterLoop, RmsRoutine};
pub use ring_buffer::{audio_ring_buffer, AudioConsumer, AudioProducer};

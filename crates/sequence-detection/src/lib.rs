//! Image sequence detection library for AssetLoupe
//!
//! This crate groups numbered render and comp frames found during directory
//! enumeration into sequences, so that a browser can show one tile per
//! sequence and thumbnail it from its middle frame.

pub mod sequence;

pub use sequence::{Frame, ImageSequence, SequenceConfig, SequenceDetector, SequenceResult};

//! Square fiducial markers: dictionaries, full-frame quad finding and decoding.
//!
//! The pipeline in [`MarkerDetector`]:
//! 1. local-mean threshold of the frame,
//! 2. 4-connected dark components and their convex hulls,
//! 3. quad fit per hull,
//! 4. bit sampling through the quad homography and dictionary lookup
//!    (all four rotations, bounded Hamming distance).
//!
//! Reported corners follow the marker's own frame (top-left, top-right,
//! bottom-right, bottom-left) regardless of how the marker is turned.

pub mod builtins;
mod decode;
mod detector;
mod dictionary;
mod matcher;
mod quad;
mod threshold;

pub use decode::{CellReading, DecodeConfig, QuadDecoder};
pub use detector::{MarkerDetection, MarkerDetector, MarkerDetectorParams};
pub use dictionary::{Dictionary, DictionaryError};
pub use matcher::{rotate_code, Match, Matcher};
pub use quad::QuadParams;

//! Freshet common: the dynamic datum model shared by every layer of the engine.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Coercion between datum types, with a textual round-trip fallback
pub mod cast;
/// Group fingerprints and key hashing
pub mod hash;
/// Engine-wide tunables
pub mod settings;
/// Clock seam and timestamp bucketing
pub mod time;
/// Tuple descriptors and rows
pub mod tuple;
/// The dynamic datum type
pub mod value;
/// CBOR wire encoding for queue payloads
pub mod wire;

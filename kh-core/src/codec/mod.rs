//! Frame payload codecs.
//!
//! | Module  | Purpose                                              |
//! |---------|------------------------------------------------------|
//! | `rvl`   | Spatial run-length compression of `i16` arrays       |
//! | `trvl`  | Temporal depth filter + delta coding over `rvl`      |
//! | `color` | Color codec traits and a zstd-backed implementation  |

pub mod color;
pub mod rvl;
pub mod trvl;

// ── Re-exports ───────────────────────────────────────────────────

pub use color::{ColorDecoder, ColorEncoder, YuvImage, ZstdColorCodec};
pub use trvl::{TrvlDecoder, TrvlEncoder, TrvlPixel};

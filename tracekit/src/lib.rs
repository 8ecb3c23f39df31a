//! `tracekit`: a file-backed ring-buffer tracing runtime and offline
//! decoder (spec §1 overview).
//!
//! Tracepoints are bound to named, file-backed regions (see
//! [`tracebuffer::Tracebuffer`]) holding a single-producer-multi-reader
//! ring buffer (see [`ring_buffer::RingBuffer`]) and a content-addressed
//! unique stack (see [`unique_stack::UniqueStack`]) that dynamic
//! tracepoints and string/dump payloads share. Emission goes through
//! [`emit`] and the [`tracepoint!`]/[`dump_tracepoint!`] macros; offline
//! decoding goes through [`decode::TracebufferSnapshot`] and
//! [`decode::merge`].

pub mod catalog;
pub mod codec;
pub mod config;
pub mod crc8;
pub mod decode;
pub mod emit;
pub mod error;
pub mod mapping;
pub mod mutex;
pub mod os;
pub mod record;
pub mod ring_buffer;
pub mod tracebuffer;
pub mod tracepoint;
pub mod unique_stack;

pub use error::{DecodeError, DecodeResult, TraceError, TraceResult};
pub use tracebuffer::Tracebuffer;

/// Re-exports used only by the expansion of [`tracepoint!`]/
/// [`dump_tracepoint!`], so callers never need their own
/// `tracekit-common` dependency just to invoke the macros.
#[doc(hidden)]
pub mod __private {
    pub use tracekit_common::CatalogKind;
}

//! GPU device management and shared allocators.
//!
//! - [`device`]: process-wide device handle and feature flags
//! - [`buffer_pool`]: reusable buffer allocator keyed by (size class, usage)
//! - [`decode_ring`]: fixed-size ring of token/stop/staging buffers for the decode loop
//! - [`decode_buffers`]: per-decode-step hidden/attention/FFN scratch buffers

pub mod buffer_pool;
pub mod decode_buffers;
pub mod decode_ring;
pub mod device;

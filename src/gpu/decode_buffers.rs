//! Per-decode-step scratch buffers: hidden state, attention output, FFN
//! intermediate, and an optional ping-pong pair for the hidden buffer.
//!
//! Same idempotent-`ensure` shape as [`crate::gpu::decode_ring`], but these
//! buffers are held singly (no ring) since a decode step fully consumes and
//! overwrites them before the next step begins — except the hidden buffer,
//! which may need a second copy to let one kernel read last step's result
//! while writing this step's, hence ping-pong.

use thiserror::Error;
use tracing::debug;

use crate::gpu::buffer_pool::{BufferPool, BufferPoolError, BufferUsage, GpuBuffer};

#[derive(Error, Debug)]
pub enum ScratchError {
    #[error("invalid scratch buffer config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Pool(#[from] BufferPoolError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScratchConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub max_batch: usize,
    pub dtype_bytes: usize,
    pub ping_pong: bool,
}

impl ScratchConfig {
    fn validate(&self) -> Result<(), ScratchError> {
        if self.hidden_size == 0 || self.intermediate_size == 0 || self.max_batch == 0 {
            return Err(ScratchError::InvalidConfig(
                "hidden_size, intermediate_size and max_batch must be positive".into(),
            ));
        }
        Ok(())
    }

    fn hidden_bytes(&self) -> u64 {
        (self.hidden_size * self.max_batch * self.dtype_bytes) as u64
    }

    fn ffn_bytes(&self) -> u64 {
        (self.intermediate_size * self.max_batch * self.dtype_bytes) as u64
    }
}

/// Decode-step scratch space: hidden state, attention output, and FFN
/// intermediate buffers, plus an optional second hidden buffer for
/// ping-pong double buffering.
pub struct DecodeBuffers {
    config: Option<ScratchConfig>,
    hidden_a: Option<GpuBuffer>,
    hidden_b: Option<GpuBuffer>,
    attn_out: Option<GpuBuffer>,
    ffn_intermediate: Option<GpuBuffer>,
    ping: bool,
}

impl DecodeBuffers {
    pub fn new() -> Self {
        Self {
            config: None,
            hidden_a: None,
            hidden_b: None,
            attn_out: None,
            ffn_intermediate: None,
            ping: true,
        }
    }

    /// Idempotent on an unchanged config; otherwise releases and reallocates.
    pub fn ensure(&mut self, pool: &mut BufferPool, config: ScratchConfig) -> Result<(), ScratchError> {
        config.validate()?;

        if self.config == Some(config) {
            return Ok(());
        }

        self.release(pool);

        let usage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;

        self.hidden_a = Some(pool.acquire(config.hidden_bytes(), usage, "decode.hidden_a")?);
        self.hidden_b = if config.ping_pong {
            Some(pool.acquire(config.hidden_bytes(), usage, "decode.hidden_b")?)
        } else {
            None
        };
        self.attn_out = Some(pool.acquire(config.hidden_bytes(), usage, "decode.attn_out")?);
        self.ffn_intermediate = Some(pool.acquire(config.ffn_bytes(), usage, "decode.ffn_intermediate")?);

        self.ping = true;
        self.config = Some(config);

        debug!(
            hidden_bytes = config.hidden_bytes(),
            ffn_bytes = config.ffn_bytes(),
            ping_pong = config.ping_pong,
            "Decode scratch buffers (re)allocated"
        );

        Ok(())
    }

    /// The currently-active hidden buffer.
    pub fn hidden(&self) -> &GpuBuffer {
        if self.ping {
            self.hidden_a.as_ref().expect("scratch buffers not ensured")
        } else {
            self.hidden_b
                .as_ref()
                .or(self.hidden_a.as_ref())
                .expect("scratch buffers not ensured")
        }
    }

    pub fn attn_out(&self) -> &GpuBuffer {
        self.attn_out.as_ref().expect("scratch buffers not ensured")
    }

    pub fn ffn_intermediate(&self) -> &GpuBuffer {
        self.ffn_intermediate
            .as_ref()
            .expect("scratch buffers not ensured")
    }

    /// Flip to the other hidden buffer. A no-op when ping-pong is disabled.
    pub fn swap_ping_pong(&mut self) {
        if self.hidden_b.is_some() {
            self.ping = !self.ping;
        }
    }

    /// Reset to the primary (`ping = true`) hidden buffer without touching
    /// buffer contents or allocation.
    pub fn reset_ping_pong(&mut self) {
        self.ping = true;
    }

    pub fn release(&mut self, pool: &mut BufferPool) {
        for b in [
            self.hidden_a.take(),
            self.hidden_b.take(),
            self.attn_out.take(),
            self.ffn_intermediate.take(),
        ]
        .into_iter()
        .flatten()
        {
            pool.release(b);
        }
    }
}

impl Default for DecodeBuffers {
    fn default() -> Self {
        Self::new()
    }
}

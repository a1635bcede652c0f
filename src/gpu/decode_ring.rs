//! Fixed-size ring of GPU buffers reused across decode steps.
//!
//! Same error-enum-plus-accounting idiom as [`crate::gpu::buffer_pool`], but
//! for the decode hot loop's token/stop/staging buffers, which are acquired
//! round-robin rather than free-listed.

use thiserror::Error;
use tracing::debug;

use crate::config::StopCheckMode;
use crate::gpu::buffer_pool::{BufferPool, BufferUsage, GpuBuffer};

#[derive(Error, Debug)]
pub enum RingError {
    #[error("invalid decode ring config: {0}")]
    InvalidConfig(String),

    #[error("required buffer size {needed} exceeds device limit {limit}")]
    BufferTooLarge { needed: u64, limit: u64 },
}

/// Normalized, validated ring configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingConfig {
    pub ring_tokens: usize,
    pub ring_stop: usize,
    pub ring_staging: usize,
    pub tokens_per_interval: usize,
    pub stop_check_mode: StopCheckMode,
}

impl RingConfig {
    fn validate(&self) -> Result<(), RingError> {
        if self.tokens_per_interval == 0 {
            return Err(RingError::InvalidConfig(
                "tokensPerInterval must be a positive finite number".into(),
            ));
        }
        if self.ring_tokens == 0 || self.ring_staging == 0 {
            return Err(RingError::InvalidConfig(
                "batch size must be a positive finite number".into(),
            ));
        }
        Ok(())
    }

    /// Overall ring size R = max(R_tokens, R_stop, R_staging, 1).
    fn ring_size(&self) -> usize {
        [self.ring_tokens, self.ring_stop, self.ring_staging, 1]
            .into_iter()
            .max()
            .unwrap()
    }
}

/// One decode-ring slot: the buffers a single decode step acquires.
pub struct RingSlot {
    pub index: usize,
    pub tokens: GpuBuffer,
    pub stop: Option<GpuBuffer>,
    pub staging_tokens: GpuBuffer,
    pub staging_stop: Option<GpuBuffer>,
}

/// The decode ring. Holds up to four parallel sub-rings.
pub struct DecodeRing {
    config: Option<RingConfig>,
    tokens: Vec<GpuBuffer>,
    stop: Vec<GpuBuffer>,
    staging_tokens: Vec<GpuBuffer>,
    staging_stop: Vec<GpuBuffer>,
    index: usize,
}

impl DecodeRing {
    pub fn new() -> Self {
        Self {
            config: None,
            tokens: Vec::new(),
            stop: Vec::new(),
            staging_tokens: Vec::new(),
            staging_stop: Vec::new(),
            index: 0,
        }
    }

    /// Idempotent when `config` matches the current configuration; otherwise
    /// releases prior buffers and reallocates.
    pub fn ensure(
        &mut self,
        pool: &mut BufferPool,
        config: RingConfig,
        max_buffer_size: u64,
    ) -> Result<(), RingError> {
        config.validate()?;

        if self.config == Some(config) {
            return Ok(());
        }

        self.release(pool);

        let token_size = (config.tokens_per_interval as u64 + 1) * 4;
        let stop_size = config.tokens_per_interval as u64 * 4;

        if token_size > max_buffer_size {
            return Err(RingError::BufferTooLarge {
                needed: token_size,
                limit: max_buffer_size,
            });
        }
        if config.stop_check_mode == StopCheckMode::PerToken && stop_size > max_buffer_size {
            return Err(RingError::BufferTooLarge {
                needed: stop_size,
                limit: max_buffer_size,
            });
        }

        let token_usage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let staging_usage = BufferUsage::MAP_READ | BufferUsage::COPY_DST;

        self.tokens = (0..config.ring_tokens)
            .map(|_| pool.acquire(token_size, token_usage, "decode_ring.tokens"))
            .collect::<Result<_, _>>()
            .map_err(|e| RingError::InvalidConfig(e.to_string()))?;

        if config.stop_check_mode == StopCheckMode::PerToken {
            self.stop = (0..config.ring_stop)
                .map(|_| pool.acquire(stop_size, token_usage, "decode_ring.stop"))
                .collect::<Result<_, _>>()
                .map_err(|e| RingError::InvalidConfig(e.to_string()))?;
        } else {
            self.stop.clear();
        }

        self.staging_tokens = (0..config.ring_staging)
            .map(|_| pool.acquire(token_size, staging_usage, "decode_ring.staging_tokens"))
            .collect::<Result<_, _>>()
            .map_err(|e| RingError::InvalidConfig(e.to_string()))?;

        if config.stop_check_mode == StopCheckMode::PerToken {
            self.staging_stop = (0..config.ring_staging)
                .map(|_| pool.acquire(stop_size, staging_usage, "decode_ring.staging_stop"))
                .collect::<Result<_, _>>()
                .map_err(|e| RingError::InvalidConfig(e.to_string()))?;
        } else {
            self.staging_stop.clear();
        }

        self.index = 0;
        self.config = Some(config);

        debug!(
            ring_size = config.ring_size(),
            tokens_per_interval = config.tokens_per_interval,
            "Decode ring (re)allocated"
        );

        Ok(())
    }

    /// Return the current slot without advancing the ring.
    pub fn acquire(&self) -> RingSlot {
        let cfg = self.config.expect("decode ring not ensured");

        let tok_idx = self.index % self.tokens.len().max(1);
        let stop_idx = if self.stop.is_empty() {
            0
        } else {
            self.index % self.stop.len()
        };
        let staging_idx = self.index % self.staging_tokens.len().max(1);

        RingSlot {
            index: self.index,
            tokens: self.tokens[tok_idx].clone(),
            stop: if cfg.stop_check_mode == StopCheckMode::PerToken {
                Some(self.stop[stop_idx].clone())
            } else {
                None
            },
            staging_tokens: self.staging_tokens[staging_idx].clone(),
            staging_stop: if cfg.stop_check_mode == StopCheckMode::PerToken {
                Some(self.staging_stop[staging_idx].clone())
            } else {
                None
            },
        }
    }

    /// Advance `index <- (index + 1) mod R`.
    pub fn advance(&mut self) {
        let cfg = self.config.expect("decode ring not ensured");
        self.index = (self.index + 1) % cfg.ring_size();
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// Destroy all held buffers, returning them to the pool.
    pub fn release(&mut self, pool: &mut BufferPool) {
        for b in self.tokens.drain(..) {
            pool.release(b);
        }
        for b in self.stop.drain(..) {
            pool.release(b);
        }
        for b in self.staging_tokens.drain(..) {
            pool.release(b);
        }
        for b in self.staging_stop.drain(..) {
            pool.release(b);
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Default for DecodeRing {
    fn default() -> Self {
        Self::new()
    }
}

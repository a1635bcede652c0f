//! Process-wide GPU device handle.
//!
//! A single `DeviceHandle` is shared by every collaborator (buffer pool,
//! decode ring, KV cache, weight loader). It is obtained through an explicit
//! getter that fails loudly when uninitialized — no hidden global mutation.
//!
//! This module does not depend on any concrete graphics/compute crate: the
//! kernel backend is out of scope. `init` stands in for whatever
//! backend-specific adapter/device request the host performs.

use std::sync::OnceLock;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device already initialized with different features")]
    AlreadyInitialized,

    #[error("no compatible device available")]
    NoDevice,
}

/// Feature flags and limits reported by the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceFeatures {
    pub has_subgroups: bool,
    pub has_f16: bool,
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u64,
}

impl Default for DeviceFeatures {
    fn default() -> Self {
        Self {
            has_subgroups: true,
            has_f16: true,
            max_buffer_size: 1 << 30,
            max_storage_buffer_binding_size: 1 << 30,
        }
    }
}

/// Process-wide GPU device handle.
///
/// Construction is idempotent: multiple calls to [`DeviceHandle::init`]
/// return the same handle as long as the requested features match what was
/// already initialized.
#[derive(Debug)]
pub struct DeviceHandle {
    features: DeviceFeatures,
}

impl DeviceHandle {
    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn has_subgroups(&self) -> bool {
        self.features.has_subgroups
    }

    pub fn has_f16(&self) -> bool {
        self.features.has_f16
    }

    pub fn max_buffer_size(&self) -> u64 {
        self.features.max_buffer_size
    }

    pub fn max_storage_buffer_binding_size(&self) -> u64 {
        self.features.max_storage_buffer_binding_size
    }
}

static DEVICE: OnceLock<DeviceHandle> = OnceLock::new();

/// Initialize the process-wide device handle with the given features.
///
/// Idempotent: re-initializing with the same features is a no-op that
/// returns the existing handle. Re-initializing with different features
/// is an error — this handle is meant to be set up once at process start.
pub fn init(features: DeviceFeatures) -> Result<&'static DeviceHandle, DeviceError> {
    if let Some(existing) = DEVICE.get() {
        return if existing.features == features {
            Ok(existing)
        } else {
            Err(DeviceError::AlreadyInitialized)
        };
    }

    info!(
        has_subgroups = features.has_subgroups,
        has_f16 = features.has_f16,
        max_buffer_size = features.max_buffer_size,
        "Initializing GPU device handle"
    );

    Ok(DEVICE.get_or_init(|| DeviceHandle { features }))
}

/// Fetch the process-wide device handle, failing loudly if uninitialized.
pub fn get() -> Result<&'static DeviceHandle, DeviceError> {
    DEVICE.get().ok_or(DeviceError::NoDevice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_idempotent_same_features() {
        let features = DeviceFeatures::default();
        let a = init(features).unwrap();
        let b = init(features).unwrap();
        assert_eq!(a.features(), b.features());
    }

    #[test]
    fn test_default_features() {
        let f = DeviceFeatures::default();
        assert!(f.has_subgroups);
        assert!(f.max_buffer_size > 0);
    }
}

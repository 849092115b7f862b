//! Engine configuration.

use crate::{prekeys::DEFAULT_ONE_TIME_BATCH, rotation::RotationPolicy};

const DAY_MS: u64 = 86_400_000;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rotation policy for the scheduler.
    pub rotation: RotationPolicy,
    /// Restore window for new backups. Default: 90 days.
    pub backup_expiry_ms: u64,
    /// Batch size for explicit one-time pre-key generation. Default: 100.
    pub one_time_batch: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rotation: RotationPolicy::default(),
            backup_expiry_ms: 90 * DAY_MS,
            one_time_batch: DEFAULT_ONE_TIME_BATCH,
        }
    }
}

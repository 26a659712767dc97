use serde::{Deserialize, Serialize};

use crate::error::{SecurityError, SecurityResult};

/// Number of slices (synchronisation points) per pass.
pub const SYNC_POINTS: u32 = 4;

/// Default key length: 256 bits for AES-256-GCM.
pub const DEFAULT_OUTPUT_LEN: usize = 32;

const MIN_OUTPUT_LEN: usize = 4;
const MAX_PARALLELISM: u32 = 0x00FF_FFFF;

/// Cost parameters for the memory-hard derivation.
///
/// Persisted alongside the salt so a later unlock re-derives with exactly the
/// parameters used at setup, even after the compiled-in defaults change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Passes over memory (`t`).
    pub iterations: u32,
    /// Memory size in KiB (`m`), one block per KiB.
    pub memory_kib: u32,
    /// Lanes (`p`).
    pub parallelism: u32,
    /// Output key length in bytes.
    pub output_len: usize,
}

impl KdfParams {
    /// Shipped parameters: 3 passes over 128 MiB, 4 lanes.
    pub const fn production() -> Self {
        Self {
            iterations: 3,
            memory_kib: 128 * 1024,
            parallelism: 4,
            output_len: DEFAULT_OUTPUT_LEN,
        }
    }

    /// Debug-build parameters: 2 passes over 64 MiB, 2 lanes.
    pub const fn debug() -> Self {
        Self {
            iterations: 2,
            memory_kib: 64 * 1024,
            parallelism: 2,
            output_len: DEFAULT_OUTPUT_LEN,
        }
    }

    /// Tiny parameters for unit tests. Never use for real secrets.
    pub const fn insecure_for_tests() -> Self {
        Self {
            iterations: 1,
            memory_kib: 64,
            parallelism: 1,
            output_len: DEFAULT_OUTPUT_LEN,
        }
    }

    /// Blocks per lane per slice. Zero (or too small to hold the two seed
    /// blocks) means the memory cannot be split across the requested lanes.
    pub fn segment_length(&self) -> u32 {
        if self.parallelism == 0 {
            return 0;
        }
        self.memory_kib / (self.parallelism * SYNC_POINTS)
    }

    /// Blocks per lane.
    pub fn lane_length(&self) -> u32 {
        self.segment_length() * SYNC_POINTS
    }

    /// Blocks actually used (`m'`), `m` rounded down to a multiple of `4p`.
    pub fn block_count(&self) -> u32 {
        self.lane_length() * self.parallelism
    }

    /// Reject parameters before any memory is allocated.
    pub fn validate(&self) -> SecurityResult<()> {
        if self.iterations == 0 {
            return Err(invalid("iterations must be at least 1"));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(invalid("parallelism out of range"));
        }
        if self.output_len < MIN_OUTPUT_LEN || u32::try_from(self.output_len).is_err() {
            return Err(invalid("output length out of range"));
        }
        // Each lane must fit its two seed blocks inside the first segment.
        if self.segment_length() < 2 {
            return Err(invalid(&format!(
                "{} KiB is too little memory for {} lanes",
                self.memory_kib, self.parallelism
            )));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::debug()
        } else {
            Self::production()
        }
    }
}

fn invalid(msg: &str) -> SecurityError {
    SecurityError::InvalidInput(format!("invalid KDF parameters: {}", msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_is_stronger_than_debug() {
        let prod = KdfParams::production();
        let dbg = KdfParams::debug();
        assert!(prod.iterations > dbg.iterations);
        assert!(prod.memory_kib > dbg.memory_kib);
        assert!(prod.validate().is_ok());
        assert!(dbg.validate().is_ok());
    }

    #[test]
    fn test_geometry() {
        let params = KdfParams {
            iterations: 1,
            memory_kib: 100,
            parallelism: 3,
            output_len: 32,
        };
        assert_eq!(params.segment_length(), 8);
        assert_eq!(params.lane_length(), 32);
        assert_eq!(params.block_count(), 96);
    }

    #[test]
    fn test_too_little_memory_rejected() {
        let params = KdfParams {
            iterations: 1,
            memory_kib: 7,
            parallelism: 1,
            output_len: 32,
        };
        assert_eq!(params.segment_length(), 1);
        assert!(matches!(
            params.validate(),
            Err(SecurityError::InvalidInput(_))
        ));

        let zero = KdfParams {
            memory_kib: 3,
            ..params
        };
        assert_eq!(zero.segment_length(), 0);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let params = KdfParams {
            iterations: 0,
            ..KdfParams::insecure_for_tests()
        };
        assert!(params.validate().is_err());
    }
}

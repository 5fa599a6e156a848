//! Volume configuration.

use tracing::warn;

use crate::cache::Ticks;
use crate::proto::errno::{self, ErrnoTable};

/// Smallest sector size a volume may announce.
pub const MIN_SECTOR_SIZE: u32 = 512;
/// Largest sector size a volume may announce.
pub const MAX_SECTOR_SIZE: u32 = 4096;

const DEFAULT_TIMEOUT: Ticks = 1_000_000_000; // 1s
const DEFAULT_MAX_COMPONENT: u32 = 255;
const DEFAULT_READAHEAD: u32 = 128 * 1024;
const DEFAULT_ALLOCATION_UNIT: u32 = 4096;

/// Per-volume parameters. Construct with struct update syntax over
/// [`Default`], then pass to the engine, which applies
/// [`validated`](Self::validated).
#[derive(Clone)]
pub struct VolumeParams {
    /// Display name reported in volume information.
    pub fs_name: String,
    /// Network-style prefix the volume is addressed under; empty for
    /// local-style volumes.
    pub unc_prefix: String,
    pub sector_size: u32,
    /// Allocation granularity reported in volume information, in bytes.
    /// Rounded up to a multiple of the sector size.
    pub allocation_unit: u32,
    pub max_component_length: u32,
    /// Fold name case in the entry cache. Forced off: cache key folding
    /// must match how names were hashed when entries were inserted, and
    /// the remote protocol is case-sensitive.
    pub case_insensitive: bool,
    /// Entry validity applied when the remote side reports none.
    pub entry_timeout: Ticks,
    /// Attribute validity applied when the remote side reports none.
    pub attr_timeout: Ticks,
    /// Ceiling on the validity of bindings cached from directory
    /// enumeration.
    pub dir_timeout: Ticks,
    /// Nonzero lets query-security answer from cached attributes (whose
    /// own validity bounds staleness); zero fetches fresh on every query.
    pub security_timeout: Ticks,
    /// How long a volume-information result is served without going back
    /// to the remote side.
    pub volume_timeout: Ticks,
    /// Entry cache capacity; `None` takes the built-in default.
    pub cache_capacity: Option<usize>,
    /// Readahead hint announced in the INIT exchange.
    pub max_readahead: u32,
    /// errno numbering flavor of the remote side.
    pub errno_table: ErrnoTable,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            fs_name: "fusebridge".to_owned(),
            unc_prefix: String::new(),
            sector_size: MIN_SECTOR_SIZE,
            allocation_unit: DEFAULT_ALLOCATION_UNIT,
            max_component_length: DEFAULT_MAX_COMPONENT,
            case_insensitive: false,
            entry_timeout: DEFAULT_TIMEOUT,
            attr_timeout: DEFAULT_TIMEOUT,
            dir_timeout: DEFAULT_TIMEOUT,
            security_timeout: 0,
            volume_timeout: DEFAULT_TIMEOUT,
            cache_capacity: None,
            max_readahead: DEFAULT_READAHEAD,
            errno_table: errno::linux,
        }
    }
}

impl VolumeParams {
    /// Clamp out-of-range values instead of rejecting them; a volume with
    /// an odd sector size should mount, just with a corrected geometry.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let sector = self.sector_size.clamp(MIN_SECTOR_SIZE, MAX_SECTOR_SIZE);
        if sector != self.sector_size {
            warn!(
                requested = self.sector_size,
                effective = sector,
                "sector size out of range; clamped"
            );
            self.sector_size = sector;
        }
        if self.allocation_unit == 0 {
            self.allocation_unit = DEFAULT_ALLOCATION_UNIT;
        }
        let unit = self
            .allocation_unit
            .max(self.sector_size)
            .next_multiple_of(self.sector_size);
        if unit != self.allocation_unit {
            warn!(
                requested = self.allocation_unit,
                effective = unit,
                "allocation unit not a multiple of the sector size; rounded up"
            );
            self.allocation_unit = unit;
        }
        if self.max_component_length == 0 {
            self.max_component_length = DEFAULT_MAX_COMPONENT;
        }
        if self.case_insensitive {
            warn!("case-insensitive volumes are not supported; forcing case-sensitive");
            self.case_insensitive = false;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_size_is_clamped() {
        let low = VolumeParams {
            sector_size: 100,
            ..VolumeParams::default()
        }
        .validated();
        assert_eq!(low.sector_size, MIN_SECTOR_SIZE);

        let high = VolumeParams {
            sector_size: 1 << 20,
            ..VolumeParams::default()
        }
        .validated();
        assert_eq!(high.sector_size, MAX_SECTOR_SIZE);

        let ok = VolumeParams {
            sector_size: 1024,
            ..VolumeParams::default()
        }
        .validated();
        assert_eq!(ok.sector_size, 1024);
    }

    #[test]
    fn allocation_unit_is_aligned_to_sectors() {
        let odd = VolumeParams {
            sector_size: 1024,
            allocation_unit: 1500,
            ..VolumeParams::default()
        }
        .validated();
        assert_eq!(odd.allocation_unit, 2048);

        let zero = VolumeParams {
            allocation_unit: 0,
            ..VolumeParams::default()
        }
        .validated();
        assert_eq!(zero.allocation_unit, 4096);
    }

    #[test]
    fn case_folding_is_forced_off() {
        let params = VolumeParams {
            case_insensitive: true,
            ..VolumeParams::default()
        }
        .validated();
        assert!(!params.case_insensitive);
    }
}

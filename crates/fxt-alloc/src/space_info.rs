//! Per-type space accounting shared by every group of one kind.

use fxt_types::{BlockGroupFlags, RaidProfile};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Which allocations a space info serves.
///
/// Zoned filesystems route tree-log and data-relocation allocations to their
/// own space infos so the dedicated groups never mix with regular ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubGroup {
    Primary,
    Treelog,
    DataReloc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceCounters {
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub bytes_reserved: u64,
    pub bytes_pinned: u64,
    pub bytes_readonly: u64,
    pub bytes_zone_unusable: u64,
    /// Largest contiguous free extent seen by the last failed search; zero
    /// when unknown.
    pub max_extent_size: u64,
}

#[derive(Debug)]
pub struct SpaceInfoState {
    pub counters: SpaceCounters,
    /// Group start offsets, per raid index, in creation order.
    pub groups: [Vec<u64>; RaidProfile::COUNT],
}

#[derive(Debug)]
pub struct SpaceInfo {
    flags: BlockGroupFlags,
    subgroup: SubGroup,
    state: Mutex<SpaceInfoState>,
}

impl SpaceInfo {
    #[must_use]
    pub fn new(flags: BlockGroupFlags, subgroup: SubGroup) -> Self {
        Self {
            flags: flags.type_bits(),
            subgroup,
            state: Mutex::new(SpaceInfoState {
                counters: SpaceCounters::default(),
                groups: Default::default(),
            }),
        }
    }

    #[must_use]
    pub fn flags(&self) -> BlockGroupFlags {
        self.flags
    }

    #[must_use]
    pub fn subgroup(&self) -> SubGroup {
        self.subgroup
    }

    /// Whether groups of this space hold both data and metadata.
    #[must_use]
    pub fn is_mixed(&self) -> bool {
        self.flags.is_mixed()
    }

    pub fn lock(&self) -> MutexGuard<'_, SpaceInfoState> {
        self.state.lock()
    }

    #[must_use]
    pub fn counters(&self) -> SpaceCounters {
        self.state.lock().counters.clone()
    }

    #[must_use]
    pub fn max_extent_size(&self) -> u64 {
        self.state.lock().counters.max_extent_size
    }

    pub fn set_max_extent_size(&self, value: u64) {
        self.state.lock().counters.max_extent_size = value;
    }

    /// Group starts at `raid_index`, in list order.
    #[must_use]
    pub fn groups_at(&self, raid_index: usize) -> Vec<u64> {
        self.state
            .lock()
            .groups
            .get(raid_index)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn link_group(&self, start: u64, flags: BlockGroupFlags, length: u64, bytes_super: u64) {
        let mut state = self.state.lock();
        let index = flags.profile().raid_index();
        state.groups[index].push(start);
        state.counters.total_bytes += length;
        state.counters.bytes_readonly += bytes_super;
    }
}

#![forbid(unsafe_code)]
//! Literal scenarios and a seeded random workload for the extent tree
//! engine, reported as JSON.

use anyhow::{Context, Result, bail, ensure};
use fxt::{
    AllocRequest, BLOCK_FLAG_FULL_BACKREF, BTRFS_SUPER_INFO_SIZE, BTRFS_SUPER_MIRROR_MAX,
    BlockGroupFlags, BtrfsKey, Chunk, Cx, DelayedRef, DeviceCommand, DeviceId, DropStatus,
    EXTENT_DATA_KEY, EXTENT_ITEM_KEY, EngineSnapshot, ExtentRecord, ExtentTarget, ExtentTree, FS_TREE_OBJECTID,
    FileExtent, FsLayout, FxtError, GroupSpec, ItemStore, LeafItem, LoopPhase, MemBlockDevice,
    MountOptions, PhysRange, RefAction, RefIdentity, Stripe, TreeBlock, super_mirror_offset,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

pub const EIO: i32 = 5;
const SNAPSHOT_ID: u64 = 256;
const SZ_1M: u64 = 1024 * 1024;

// ── Scenarios ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenarios: Vec<ScenarioOutcome>,
    pub passed: usize,
    pub failed: usize,
}

type Scenario = fn() -> Result<String>;

const SCENARIOS: &[(&str, Scenario)] = &[
    ("s1_data_extent_lifecycle", s1_data_extent_lifecycle),
    ("s2_shared_block_conversion", s2_shared_block_conversion),
    ("s3_size_class_relaxation", s3_size_class_relaxation),
    ("s4_pin_across_abort", s4_pin_across_abort),
    ("s5_discard_superblock_skip", s5_discard_superblock_skip),
    ("s6_cross_ref_check", s6_cross_ref_check),
];

#[must_use]
pub fn scenario_names() -> Vec<&'static str> {
    SCENARIOS.iter().map(|(name, _)| *name).collect()
}

impl ScenarioReport {
    /// Run every scenario, or only `only` when given.
    pub fn run(only: Option<&str>) -> Result<Self> {
        let selected: Vec<&(&str, Scenario)> = SCENARIOS
            .iter()
            .filter(|(name, _)| only.is_none_or(|wanted| wanted == *name))
            .collect();
        if selected.is_empty() {
            bail!(
                "unknown scenario {}; expected one of {}",
                only.unwrap_or_default(),
                scenario_names().join(", ")
            );
        }
        let scenarios: Vec<ScenarioOutcome> = selected
            .into_iter()
            .map(|(name, scenario)| match scenario() {
                Ok(detail) => ScenarioOutcome {
                    name: (*name).to_owned(),
                    passed: true,
                    detail,
                },
                Err(err) => ScenarioOutcome {
                    name: (*name).to_owned(),
                    passed: false,
                    detail: format!("{err:#}"),
                },
            })
            .collect();
        let passed = scenarios.iter().filter(|s| s.passed).count();
        Ok(Self {
            failed: scenarios.len() - passed,
            passed,
            scenarios,
        })
    }
}

fn data_and_metadata() -> FsLayout {
    FsLayout {
        groups: vec![
            GroupSpec {
                flags: BlockGroupFlags::DATA,
                count: 1,
            },
            GroupSpec {
                flags: BlockGroupFlags::METADATA,
                count: 1,
            },
        ],
        ..FsLayout::default()
    }
}

fn small_chunks() -> MountOptions {
    MountOptions {
        data_chunk_size: 32 * SZ_1M,
        metadata_chunk_size: 32 * SZ_1M,
        ..MountOptions::default()
    }
}

fn open(options: MountOptions, layout: &FsLayout) -> Result<(ExtentTree, Vec<Arc<MemBlockDevice>>)> {
    ExtentTree::open_layout(options, layout).context("open layout")
}

fn data_item(tree: &ExtentTree, range: PhysRange) -> Result<Option<ExtentRecord>> {
    Ok(tree
        .extents()
        .lookup_extent(ExtentTarget::data(range.start, range.len))?)
}

fn tree_item(tree: &ExtentTree, block: &TreeBlock) -> Result<Option<ExtentRecord>> {
    let nodesize = u64::from(tree.options().nodesize);
    Ok(tree
        .extents()
        .lookup_extent(ExtentTarget::tree_block(block.bytenr, nodesize, block.level))?)
}

fn backref_ids(tree: &ExtentTree, record: &ExtentRecord) -> Result<Vec<RefIdentity>> {
    Ok(tree
        .extents()
        .backrefs(record)?
        .into_iter()
        .map(|backref| backref.id)
        .collect())
}

fn s1_data_extent_lifecycle() -> Result<String> {
    let cx = Cx::for_request();
    let (tree, _) = open(MountOptions::default(), &data_and_metadata())?;
    let trans = tree.start_transaction(&cx)?;
    let x = tree.alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, 4096)?;
    trans.commit()?;

    let record = data_item(&tree, x)?.context("extent item missing after commit")?;
    ensure!(record.item.refs == 1, "refs {} after insert", record.item.refs);
    let backrefs = tree.extents().backrefs(&record)?;
    let expected = RefIdentity::ExtentData {
        root: FS_TREE_OBJECTID,
        objectid: 257,
        offset: 0,
    };
    ensure!(
        backrefs.len() == 1
            && backrefs[0].id == expected
            && backrefs[0].count == 1
            && backrefs[0].inline,
        "unexpected backrefs {backrefs:?}"
    );

    let trans = tree.start_transaction(&cx)?;
    tree.free_extent(
        &trans,
        DelayedRef::data(RefAction::DropRef, x.start, x.len, 0, FS_TREE_OBJECTID, 257, 0),
    )?;
    tree.run_delayed_refs(&trans, u64::MAX)?;
    ensure!(data_item(&tree, x)?.is_none(), "extent item survived its last drop");
    ensure!(
        tree.alloc().is_pinned(x) && !tree.alloc().contains_free(x),
        "{x:?} not pinned after the drop"
    );
    trans.commit()?;
    ensure!(tree.alloc().contains_free(x), "{x:?} not free after commit");
    Ok(format!("extent at {} inserted, dropped and freed at commit", x.start))
}

fn s2_shared_block_conversion() -> Result<String> {
    let cx = Cx::for_request();
    let (tree, _) = open(small_chunks(), &data_and_metadata())?;

    let trans = tree.start_transaction(&cx)?;
    let data = tree.alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, 4096)?;
    let leaf = tree.create_leaf(
        &trans,
        FS_TREE_OBJECTID,
        vec![LeafItem {
            key: BtrfsKey::new(257, EXTENT_DATA_KEY, 0),
            data: FileExtent::regular(trans.generation(), data.start, data.len, 0).encode(),
        }],
    )?;
    let parent = tree.create_node(&trans, FS_TREE_OBJECTID, 1, &[&leaf])?;
    let top = tree.create_node(&trans, FS_TREE_OBJECTID, 2, &[&parent])?;
    tree.create_root(&trans, FS_TREE_OBJECTID, &top)?;
    trans.commit()?;

    let trans = tree.start_transaction(&cx)?;
    tree.create_snapshot(&trans, FS_TREE_OBJECTID, SNAPSHOT_ID)?;
    trans.commit()?;

    let trans = tree.start_transaction(&cx)?;
    let report = tree.drop_snapshot(&trans, FS_TREE_OBJECTID, true)?;
    ensure!(report.status == DropStatus::Finished, "drop paused");
    trans.commit()?;

    let leaf_item = tree_item(&tree, &leaf)?.context("leaf item missing")?;
    ensure!(leaf_item.item.refs == 1, "leaf refs {}", leaf_item.item.refs);
    let ids = backref_ids(&tree, &leaf_item)?;
    ensure!(
        ids == [RefIdentity::SharedBlock {
            parent: parent.bytenr
        }],
        "leaf backrefs {ids:?}"
    );
    ensure!(
        leaf_item.item.flags & BLOCK_FLAG_FULL_BACKREF != 0,
        "leaf lacks FULL_BACKREF"
    );
    ensure!(tree_item(&tree, &top)?.is_none(), "dropped root block still has an item");
    tree.verify_refs()?;
    Ok(format!(
        "leaf {} now shared through parent {}",
        leaf.bytenr, parent.bytenr
    ))
}

fn s3_size_class_relaxation() -> Result<String> {
    let cx = Cx::for_request();
    let options = MountOptions {
        data_chunk_size: 16 * SZ_1M,
        ..MountOptions::default()
    };
    let (tree, _) = open(options, &FsLayout::default())?;
    let trans = tree.start_transaction(&cx)?;
    let fill = tree.reserve_extent(&trans, &AllocRequest::data(16 * SZ_1M))?;
    let large = tree
        .alloc()
        .block_group(fill.start)
        .context("filled group missing")?;

    let logical = large.end();
    tree.items()
        .insert_item(BtrfsKey::new(logical, EXTENT_ITEM_KEY, 16 * SZ_1M), &[0; 24])?;
    let uncached = tree.alloc().add_block_group(
        Chunk {
            logical,
            length: 16 * SZ_1M,
            flags: BlockGroupFlags::DATA,
            stripes: vec![Stripe {
                devid: DeviceId(1),
                physical: 32 * SZ_1M,
            }],
        },
        16 * SZ_1M,
    )?;

    let found = tree.reserve_extent(&trans, &AllocRequest::data(SZ_1M))?;
    let expected = [
        LoopPhase::CachingNowait,
        LoopPhase::CachingWait,
        LoopPhase::UnsetSizeClass,
        LoopPhase::AllocChunk,
    ];
    ensure!(found.phases == expected, "phases {:?}", found.phases);
    ensure!(
        !large.range().contains(found.start) && !uncached.range().contains(found.start),
        "allocation at {} landed in an old group",
        found.start
    );
    Ok(format!("1MiB granted at {} in a new chunk", found.start))
}

fn s4_pin_across_abort() -> Result<String> {
    let cx = Cx::for_request();
    let layout = FsLayout {
        groups: vec![GroupSpec {
            flags: BlockGroupFlags::DATA,
            count: 1,
        }],
        ..FsLayout::default()
    };
    let (tree, _) = open(small_chunks(), &layout)?;
    let trans = tree.start_transaction(&cx)?;
    let z = tree.alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, 65_536)?;
    ensure!(z == PhysRange::new(1_048_576, 65_536), "allocated {z:?}");

    let report = trans.abort(EIO);
    ensure!(report.stranded == [z], "stranded {:?}", report.stranded);
    ensure!(
        tree.alloc().is_pinned(z) && !tree.alloc().contains_free(z),
        "{z:?} escaped its pin"
    );
    ensure!(
        matches!(tree.start_transaction(&cx), Err(FxtError::Aborted { .. })),
        "aborted fs accepted a new transaction"
    );
    let again = tree.alloc().find_free_extent(&cx, &AllocRequest::data(65_536))?;
    ensure!(!again.range().overlaps(z), "{z:?} was reallocated");
    Ok(format!("{} bytes stranded after abort", report.stranded_bytes()))
}

fn s5_discard_superblock_skip() -> Result<String> {
    let cx = Cx::for_request();
    let (tree, devices) = open(MountOptions::default(), &FsLayout::default())?;
    let dev = devices.first().context("no device")?;
    let discarded = tree.discard_device(&cx, 1, 0, 2_000_000_000)?;
    ensure!(
        discarded == 2_000_000_000 - 2 * BTRFS_SUPER_INFO_SIZE,
        "discarded {discarded}"
    );
    let mirrors: Vec<u64> = (0..BTRFS_SUPER_MIRROR_MAX).map(super_mirror_offset).collect();
    let mut commands = 0;
    for cmd in dev.commands() {
        if let DeviceCommand::Discard { start, len } = cmd {
            commands += 1;
            for &mirror in &mirrors {
                ensure!(
                    start + len <= mirror || start >= mirror + BTRFS_SUPER_INFO_SIZE,
                    "discard {start}+{len} overlaps the superblock at {mirror}"
                );
            }
        }
    }
    Ok(format!("{discarded} bytes in {commands} commands"))
}

fn s6_cross_ref_check() -> Result<String> {
    let cx = Cx::for_request();
    let (tree, _) = open(MountOptions::default(), &data_and_metadata())?;
    let trans = tree.start_transaction(&cx)?;
    let q = tree.alloc_data_extent(&trans, FS_TREE_OBJECTID, 300, 4096, 4096)?;
    trans.commit()?;
    ensure!(
        !tree.cross_ref_exists(FS_TREE_OBJECTID, 300, 4096, q.start, true)?,
        "sole reference reported shared"
    );

    let trans = tree.start_transaction(&cx)?;
    tree.inc_extent_ref(
        &trans,
        DelayedRef::data(RefAction::AddRef, q.start, q.len, 0, FS_TREE_OBJECTID, 301, 0),
    )?;
    ensure!(
        tree.cross_ref_exists(FS_TREE_OBJECTID, 300, 4096, q.start, true)?,
        "queued second reference not seen"
    );
    trans.commit()?;
    Ok(format!("extent {} shared after the queued add", q.start))
}

// ── Layouts ─────────────────────────────────────────────────────────────────

/// Open a JSON-described layout with `options` and report the engine state.
pub fn inspect_layout(layout_json: &str, options: MountOptions) -> Result<EngineSnapshot> {
    let layout: FsLayout = serde_json::from_str(layout_json).context("parse layout")?;
    let (tree, _) = open(options, &layout)?;
    Ok(tree.snapshot())
}

// ── Workload ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub seed: u64,
    pub operations: u64,
    /// Commit after this many operations.
    pub commit_every: u64,
    /// Largest extent, in 4KiB blocks.
    pub max_extent_blocks: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 0xF0E7_0000_5EED_0001,
            operations: 2_000,
            commit_every: 64,
            max_extent_blocks: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub seed: u64,
    pub operations_executed: u64,
    pub commits: u64,
    pub live_extents: usize,
    pub live_refs: usize,
    pub operation_mix: BTreeMap<String, u64>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub duration_us: u64,
}

#[derive(Debug, Clone)]
struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, upper: u64) -> u64 {
        if upper <= 1 {
            return 0;
        }
        self.next_u64() % upper
    }

    fn index(&mut self, len: usize) -> usize {
        let upper = u64::try_from(len).unwrap_or(u64::MAX);
        usize::try_from(self.below(upper)).unwrap_or(0)
    }
}

/// `(root, inode, offset)` of one file reference.
type FileRef = (u64, u64, u64);

#[derive(Debug)]
struct LiveExtent {
    range: PhysRange,
    refs: Vec<FileRef>,
}

fn bump(mix: &mut BTreeMap<String, u64>, kind: &str) {
    *mix.entry(kind.to_owned()).or_insert(0) += 1;
}

/// Random allocations, reference adds and drops with periodic commits,
/// checking the committed state against a model after each commit.
pub fn run_workload(config: &WorkloadConfig) -> Result<WorkloadReport> {
    ensure!(config.commit_every > 0, "commit_every must be positive");
    ensure!(config.max_extent_blocks > 0, "max_extent_blocks must be positive");
    let started = Instant::now();
    let cx = Cx::for_request();
    let (tree, _) = open(small_chunks(), &data_and_metadata())?;
    let mut rng = DeterministicRng::new(config.seed);
    let mut live: Vec<LiveExtent> = Vec::new();
    let mut mix = BTreeMap::new();
    let mut commits = 0_u64;
    let mut executed = 0_u64;
    let mut failure = None;
    let mut next_inode = 257_u64;

    let mut trans = tree.start_transaction(&cx)?;
    for op in 0..config.operations {
        match rng.below(10) {
            0..=3 => {
                let blocks = 1 + rng.below(config.max_extent_blocks);
                let file_ref = (FS_TREE_OBJECTID, next_inode, 0);
                next_inode += 1;
                match tree.alloc_data_extent(&trans, file_ref.0, file_ref.1, file_ref.2, blocks * 4096) {
                    Ok(range) => {
                        live.push(LiveExtent {
                            range,
                            refs: vec![file_ref],
                        });
                        bump(&mut mix, "alloc");
                    }
                    Err(FxtError::NoSpace { .. }) => bump(&mut mix, "alloc_enospc"),
                    Err(err) => return Err(err.into()),
                }
            }
            4..=6 if !live.is_empty() => {
                let extent = rng.index(live.len());
                let root = if rng.below(2) == 0 {
                    FS_TREE_OBJECTID
                } else {
                    SNAPSHOT_ID
                };
                let file_ref = (root, 257 + rng.below(64), rng.below(16) * 4096);
                let range = live[extent].range;
                tree.inc_extent_ref(
                    &trans,
                    DelayedRef::data(
                        RefAction::AddRef,
                        range.start,
                        range.len,
                        0,
                        file_ref.0,
                        file_ref.1,
                        file_ref.2,
                    ),
                )?;
                live[extent].refs.push(file_ref);
                bump(&mut mix, "add_ref");
            }
            7..=8 if !live.is_empty() => {
                let extent = rng.index(live.len());
                let which = rng.index(live[extent].refs.len());
                let (root, inode, offset) = live[extent].refs.swap_remove(which);
                let range = live[extent].range;
                tree.free_extent(
                    &trans,
                    DelayedRef::data(RefAction::DropRef, range.start, range.len, 0, root, inode, offset),
                )?;
                if live[extent].refs.is_empty() {
                    live.swap_remove(extent);
                    bump(&mut mix, "drop_last_ref");
                } else {
                    bump(&mut mix, "drop_ref");
                }
            }
            _ => {
                if trans.throttle()?.is_some() {
                    bump(&mut mix, "throttle_ran");
                } else {
                    bump(&mut mix, "throttle_idle");
                }
            }
        }
        executed += 1;

        if (op + 1) % config.commit_every == 0 {
            trans.commit()?;
            commits += 1;
            if let Err(err) = check_model(&tree, &live) {
                failure = Some(format!("after commit {commits}: {err:#}"));
                trans = tree.start_transaction(&cx)?;
                break;
            }
            trans = tree.start_transaction(&cx)?;
        }
    }
    trans.commit()?;
    commits += 1;
    if failure.is_none() {
        if let Err(err) = check_model(&tree, &live) {
            failure = Some(format!("after final commit: {err:#}"));
        }
    }

    Ok(WorkloadReport {
        seed: config.seed,
        operations_executed: executed,
        commits,
        live_extents: live.len(),
        live_refs: live.iter().map(|extent| extent.refs.len()).sum(),
        operation_mix: mix,
        passed: failure.is_none(),
        failure,
        duration_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
    })
}

/// The committed extent items match the model and nothing leaked.
fn check_model(tree: &ExtentTree, live: &[LiveExtent]) -> Result<()> {
    let items = tree.verify_refs()?;
    ensure!(
        items == live.len(),
        "{items} extent items for {} live extents",
        live.len()
    );
    let held = tree.alloc().reserved_and_pinned();
    ensure!(held == 0, "{held} bytes still reserved or pinned");
    for extent in live {
        let record = data_item(tree, extent.range)?
            .with_context(|| format!("live extent {:?} has no item", extent.range))?;
        let refs = u64::try_from(extent.refs.len()).unwrap_or(u64::MAX);
        ensure!(
            record.item.refs == refs,
            "extent {:?} holds {} refs, model has {refs}",
            extent.range,
            record.item.refs
        );
        ensure!(
            !tree.alloc().contains_free(extent.range),
            "live extent {:?} is in free space",
            extent.range
        );
    }
    Ok(())
}

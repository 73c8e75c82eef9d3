//! End-to-end behaviour of the extent tree engine over in-memory devices.

use fxt_alloc::LoopPhase;
use fxt_block::{Chunk, DeviceCommand, MemBlockDevice, Stripe};
use fxt_btree::ItemStore;
use fxt_btrfs::{DropStatus, FileExtent, LeafItem, TreeBlock};
use fxt_core::{
    Cx, DeviceSpec, DiscardMode, ExtentTree, FsLayout, GroupSpec, Health, MountOptions,
};
use fxt_delayed_ref::{DelayedRef, RefAction};
use fxt_error::FxtError;
use fxt_extent::{Backref, ExtentRecord, ExtentTarget, RefIdentity};
use fxt_types::{
    BLOCK_FLAG_FULL_BACKREF, BTRFS_SUPER_INFO_SIZE, BlockGroupFlags, BtrfsKey, DeviceId,
    EXTENT_DATA_KEY, EXTENT_ITEM_KEY, FS_TREE_OBJECTID, PhysRange, SZ_1G, SZ_1M, SZ_32M, SZ_64K,
};
use proptest::prelude::*;
use std::sync::Arc;

const EIO: i32 = 5;
const NODESIZE: u64 = 16_384;
const SNAPSHOT_ID: u64 = 256;

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
        data_chunk_size: SZ_32M,
        metadata_chunk_size: SZ_32M,
        ..MountOptions::default()
    }
}

fn open(options: MountOptions, layout: &FsLayout) -> (ExtentTree, Vec<Arc<MemBlockDevice>>) {
    ExtentTree::open_layout(options, layout).expect("open")
}

fn data_record(tree: &ExtentTree, range: PhysRange) -> Option<ExtentRecord> {
    tree.extents()
        .lookup_extent(ExtentTarget::data(range.start, range.len))
        .expect("lookup")
}

fn tree_record(tree: &ExtentTree, block: &TreeBlock) -> Option<ExtentRecord> {
    tree.extents()
        .lookup_extent(ExtentTarget::tree_block(block.bytenr, NODESIZE, block.level))
        .expect("lookup")
}

fn backref_ids(tree: &ExtentTree, record: &ExtentRecord) -> Vec<RefIdentity> {
    tree.extents()
        .backrefs(record)
        .expect("backrefs")
        .into_iter()
        .map(|backref| backref.id)
        .collect()
}

fn file_extent(inode: u64, file_offset: u64, range: PhysRange, generation: u64) -> LeafItem {
    LeafItem {
        key: BtrfsKey::new(inode, EXTENT_DATA_KEY, file_offset),
        data: FileExtent::regular(generation, range.start, range.len, 0).encode(),
    }
}

fn discards(dev: &MemBlockDevice) -> Vec<(u64, u64)> {
    dev.commands()
        .into_iter()
        .filter_map(|cmd| match cmd {
            DeviceCommand::Discard { start, len } => Some((start, len)),
            DeviceCommand::ZoneReset { .. } => None,
        })
        .collect()
}

// ── Data extents ────────────────────────────────────────────────────────────

#[test]
fn single_data_extent_lifecycle() {
    let cx = Cx::for_testing();
    let (tree, _) = open(MountOptions::default(), &data_and_metadata());
    let trans = tree.start_transaction(&cx).expect("start");
    let x = tree
        .alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, 4096)
        .expect("alloc");
    trans.commit().expect("commit");

    let record = data_record(&tree, x).expect("extent item");
    assert_eq!(record.key.offset, 4096);
    assert_eq!(record.item.refs, 1);
    assert_eq!(
        tree.extents().backrefs(&record).expect("backrefs"),
        vec![Backref {
            id: RefIdentity::ExtentData {
                root: FS_TREE_OBJECTID,
                objectid: 257,
                offset: 0,
            },
            count: 1,
            inline: true,
        }]
    );

    let trans = tree.start_transaction(&cx).expect("start");
    tree.free_extent(
        &trans,
        DelayedRef::data(RefAction::DropRef, x.start, x.len, 0, FS_TREE_OBJECTID, 257, 0),
    )
    .expect("drop");
    tree.run_delayed_refs(&trans, u64::MAX).expect("drain");
    assert!(data_record(&tree, x).is_none());
    assert!(tree.alloc().is_pinned(x));
    assert!(!tree.alloc().contains_free(x));

    let report = trans.commit().expect("commit");
    assert_eq!(report.unpinned_bytes, 4096);
    assert!(tree.alloc().contains_free(x));
    assert!(!tree.alloc().is_pinned(x));
    assert_eq!(tree.verify_refs().expect("verify"), 0);
}

#[test]
fn cross_ref_sees_queued_refs() {
    let cx = Cx::for_testing();
    let (tree, _) = open(MountOptions::default(), &data_and_metadata());
    let trans = tree.start_transaction(&cx).expect("start");
    let q = tree
        .alloc_data_extent(&trans, FS_TREE_OBJECTID, 300, 4096, 4096)
        .expect("alloc");
    trans.commit().expect("commit");

    assert!(!tree
        .cross_ref_exists(FS_TREE_OBJECTID, 300, 4096, q.start, true)
        .expect("exclusive"));
    assert!(!tree
        .cross_ref_exists(FS_TREE_OBJECTID, 300, 4096, q.start, false)
        .expect("exclusive"));

    let trans = tree.start_transaction(&cx).expect("start");
    tree.inc_extent_ref(
        &trans,
        DelayedRef::data(RefAction::AddRef, q.start, q.len, 0, FS_TREE_OBJECTID, 301, 0),
    )
    .expect("add");
    assert!(tree
        .cross_ref_exists(FS_TREE_OBJECTID, 300, 4096, q.start, true)
        .expect("shared"));
    trans.commit().expect("commit");

    assert!(tree
        .cross_ref_exists(FS_TREE_OBJECTID, 300, 4096, q.start, true)
        .expect("shared"));
    assert_eq!(data_record(&tree, q).expect("item").item.refs, 2);
}

#[test]
fn unacknowledged_reservations_are_all_that_stays_reserved() {
    let cx = Cx::for_testing();
    let (tree, _) = open(small_chunks(), &data_and_metadata());
    let trans = tree.start_transaction(&cx).expect("start");
    let pending = tree
        .reserve_extent(&trans, &fxt_alloc::AllocRequest::data(SZ_64K))
        .expect("reserve");
    let x = tree
        .alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, 8192)
        .expect("alloc");
    trans.commit().expect("commit");
    assert_eq!(tree.alloc().reserved_and_pinned(), SZ_64K);

    let trans = tree.start_transaction(&cx).expect("start");
    tree.alloc_reserved_file_extent(&trans, FS_TREE_OBJECTID, 258, 0, pending.range())
        .expect("acknowledge");
    tree.free_extent(
        &trans,
        DelayedRef::data(RefAction::DropRef, x.start, x.len, 0, FS_TREE_OBJECTID, 257, 0),
    )
    .expect("drop");
    trans.commit().expect("commit");
    assert_eq!(tree.alloc().reserved_and_pinned(), 0);
    assert_eq!(tree.verify_refs().expect("verify"), 1);
}

// ── Allocation ──────────────────────────────────────────────────────────────

#[test]
fn full_large_groups_fall_through_to_a_new_chunk() {
    let cx = Cx::for_testing();
    let options = MountOptions {
        data_chunk_size: 16 * SZ_1M,
        ..MountOptions::default()
    };
    let (tree, _) = open(options, &FsLayout::default());
    let trans = tree.start_transaction(&cx).expect("start");
    let fill = tree
        .reserve_extent(&trans, &fxt_alloc::AllocRequest::data(16 * SZ_1M))
        .expect("fill");
    let large = tree.alloc().block_group(fill.start).expect("large");

    // An uncached group whose only extent covers it.
    let logical = large.end();
    tree.items()
        .insert_item(BtrfsKey::new(logical, EXTENT_ITEM_KEY, 16 * SZ_1M), &[0; 24])
        .expect("extent");
    let uncached = tree
        .alloc()
        .add_block_group(
            Chunk {
                logical,
                length: 16 * SZ_1M,
                flags: BlockGroupFlags::DATA,
                stripes: vec![Stripe {
                    devid: DeviceId(1),
                    physical: SZ_32M,
                }],
            },
            16 * SZ_1M,
        )
        .expect("uncached");

    let found = tree
        .reserve_extent(&trans, &fxt_alloc::AllocRequest::data(SZ_1M))
        .expect("alloc");
    assert_eq!(
        found.phases,
        vec![
            LoopPhase::CachingNowait,
            LoopPhase::CachingWait,
            LoopPhase::UnsetSizeClass,
            LoopPhase::AllocChunk,
        ]
    );
    assert!(!large.range().contains(found.start));
    assert!(!uncached.range().contains(found.start));
    let fresh = tree.alloc().block_group(found.start).expect("fresh");
    assert!(fresh.range().contains(found.start));
    assert!(fresh.start() >= uncached.end());
}

#[test]
fn throttle_drains_once_too_many_heads_are_ready() {
    let cx = Cx::for_testing();
    let options = MountOptions {
        delayed_refs_throttle_heads: 2,
        ..small_chunks()
    };
    let (tree, _) = open(options, &data_and_metadata());
    let trans = tree.start_transaction(&cx).expect("start");
    tree.alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, 4096)
        .expect("alloc");
    assert_eq!(trans.throttle().expect("throttle"), None);
    for offset in 1..4 {
        tree.alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, offset * 4096, 4096)
            .expect("alloc");
    }
    let stats = trans.throttle().expect("throttle").expect("ran");
    assert!(stats.heads > 0);
    trans.commit().expect("commit");
    assert_eq!(tree.verify_refs().expect("verify"), 4);
}

#[test]
fn tree_blocks_allocate_on_the_split_pool() {
    let cx = Cx::for_testing();
    let options = MountOptions {
        offload_split_alloc: true,
        split_workers: 2,
        ..small_chunks()
    };
    let (tree, _) = open(options, &data_and_metadata());
    let trans = tree.start_transaction(&cx).expect("start");
    let leaf = tree.create_leaf(&trans, FS_TREE_OBJECTID, Vec::new()).expect("leaf");
    tree.create_root(&trans, FS_TREE_OBJECTID, &leaf).expect("root");
    let report = trans.commit().expect("commit");
    assert_eq!(report.blocks_written, 1);
    let record = tree_record(&tree, &leaf).expect("item");
    assert_eq!(
        backref_ids(&tree, &record),
        vec![RefIdentity::TreeBlock {
            root: FS_TREE_OBJECTID
        }]
    );
    assert!(tree.blocks().load(leaf.bytenr).expect("load").is_written());
}

#[test]
fn freeing_an_unwritten_block_reuses_its_space() {
    let cx = Cx::for_testing();
    let (tree, _) = open(small_chunks(), &data_and_metadata());
    let trans = tree.start_transaction(&cx).expect("start");
    let leaf = tree.create_leaf(&trans, FS_TREE_OBJECTID, Vec::new()).expect("leaf");
    let range = PhysRange::new(leaf.bytenr, NODESIZE);
    assert!(!tree.alloc().contains_free(range));

    tree.free_tree_block(&trans, FS_TREE_OBJECTID, &leaf, 0, true)
        .expect("free");
    assert!(tree.alloc().contains_free(range));
    assert!(!tree.blocks().contains(leaf.bytenr));
    assert!(tree.delayed_refs().find_head(leaf.bytenr).is_none());

    let report = trans.commit().expect("commit");
    assert_eq!(report.blocks_written, 0);
    assert!(tree_record(&tree, &leaf).is_none());
    assert_eq!(tree.alloc().reserved_and_pinned(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn enospc_retry_at_min_alloc_stays_enospc_or_succeeds(megs in 64_u64..512) {
        let cx = Cx::for_testing();
        let layout = FsLayout {
            devices: vec![DeviceSpec::new(1, 64 * SZ_1M)],
            ..FsLayout::default()
        };
        let (tree, _) = open(small_chunks(), &layout);
        let req = fxt_alloc::AllocRequest::data(megs * SZ_1M).with_min_alloc(4096);
        let first = tree.alloc().find_free_extent(&cx, &req);
        prop_assert!(matches!(first, Err(FxtError::NoSpace { .. })), "{first:?}");
        let retry = tree.alloc().find_free_extent(&cx, &fxt_alloc::AllocRequest::data(4096));
        prop_assert!(matches!(retry, Ok(_) | Err(FxtError::NoSpace { .. })), "{retry:?}");
    }
}

// ── Abort ───────────────────────────────────────────────────────────────────

#[test]
fn abort_keeps_a_queued_extent_pinned() {
    let cx = Cx::for_testing();
    let (tree, _) = open(
        small_chunks(),
        &FsLayout {
            groups: vec![GroupSpec {
                flags: BlockGroupFlags::DATA,
                count: 1,
            }],
            ..FsLayout::default()
        },
    );
    let trans = tree.start_transaction(&cx).expect("start");
    let z = tree
        .alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, SZ_64K)
        .expect("alloc");
    assert_eq!(z, PhysRange::new(1_048_576, 65_536));

    let report = trans.abort(EIO);
    assert_eq!(report.destroyed.heads, 1);
    assert_eq!(report.destroyed.pinned, 1);
    assert_eq!(report.stranded, vec![z]);
    assert!(tree.alloc().is_pinned(z));
    assert!(!tree.alloc().contains_free(z));
    assert!(data_record(&tree, z).is_none());
    assert!(matches!(
        tree.start_transaction(&cx),
        Err(FxtError::Aborted { errno: EIO })
    ));

    let again = tree
        .alloc()
        .find_free_extent(&cx, &fxt_alloc::AllocRequest::data(SZ_64K))
        .expect("alloc");
    assert!(!again.range().overlaps(z));
}

#[test]
fn corruption_mid_drain_never_frees_reserved_ranges() {
    let cx = Cx::for_testing();
    let (tree, _) = open(small_chunks(), &data_and_metadata());
    let trans = tree.start_transaction(&cx).expect("start");
    let ranges: Vec<PhysRange> = (0..3)
        .map(|i| {
            tree.alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, i * 4096, 4096)
                .expect("alloc")
        })
        .collect();
    // A drop for an extent that was never created.
    tree.free_extent(
        &trans,
        DelayedRef::data(RefAction::DropRef, 4 * SZ_1G, 4096, 0, FS_TREE_OBJECTID, 999, 0),
    )
    .expect("queue");

    let err = tree
        .run_delayed_refs(&trans, u64::MAX)
        .expect_err("corruption");
    assert!(matches!(err, FxtError::Corruption { .. }));
    assert!(trans.is_aborted());
    assert_eq!(tree.state().status().health, Health::Sick);

    let report = trans.abort(err.to_errno());
    let pinned = ranges
        .iter()
        .filter(|range| tree.alloc().is_pinned(**range))
        .count();
    assert_eq!(report.destroyed.pinned, u64::try_from(pinned).expect("count"));
    for range in &ranges {
        assert!(!tree.alloc().contains_free(*range));
        assert!(tree.alloc().is_pinned(*range) || data_record(&tree, *range).is_some());
    }
    assert!(tree.delayed_refs().is_empty());
}

// ── Discard ─────────────────────────────────────────────────────────────────

#[test]
fn device_discard_skips_superblock_copies() {
    let cx = Cx::for_testing();
    let (tree, devices) = open(MountOptions::default(), &FsLayout::default());
    let discarded = tree
        .discard_device(&cx, 1, 0, 2_000_000_000)
        .expect("discard");
    assert_eq!(discarded, 2_000_000_000 - 2 * BTRFS_SUPER_INFO_SIZE);

    let cmds = discards(&devices[0]);
    assert_eq!(cmds[0], (0, 65_536));
    assert_eq!(cmds[1], (69_632, 67_108_864 - 69_632));
    assert_eq!(cmds.iter().map(|(_, len)| len).sum::<u64>(), discarded);
    for &(start, len) in &cmds {
        for mirror in [65_536_u64, 67_108_864, 274_877_906_944] {
            assert!(
                start + len <= mirror || start >= mirror + BTRFS_SUPER_INFO_SIZE,
                "discard {start}+{len} touches the superblock at {mirror}"
            );
        }
    }
}

#[test]
fn sync_discard_runs_at_commit() {
    let cx = Cx::for_testing();
    let options = MountOptions {
        discard: DiscardMode::Sync,
        ..small_chunks()
    };
    let (tree, devices) = open(options, &data_and_metadata());
    let trans = tree.start_transaction(&cx).expect("start");
    let x = tree
        .alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, SZ_64K)
        .expect("alloc");
    trans.commit().expect("commit");
    devices[0].clear();

    let trans = tree.start_transaction(&cx).expect("start");
    tree.free_extent(
        &trans,
        DelayedRef::data(RefAction::DropRef, x.start, x.len, 0, FS_TREE_OBJECTID, 257, 0),
    )
    .expect("drop");
    tree.run_delayed_refs(&trans, u64::MAX).expect("drain");
    assert_eq!(devices[0].discarded_bytes(), 0);
    trans.commit().expect("commit");
    assert_eq!(devices[0].discarded_bytes(), SZ_64K);
}

#[test]
fn trim_reaches_the_devices() {
    let cx = Cx::for_testing();
    let (tree, devices) = open(small_chunks(), &data_and_metadata());
    let report = tree.trim_fs(&cx, 0, u64::MAX, 0).expect("trim");
    let trimmed = report.trimmed;
    assert!(trimmed > 0);
    assert_eq!(report.into_result().expect("no failures"), trimmed);
    assert!(!discards(&devices[0]).is_empty());
}

#[test]
fn read_only_devices_mount_read_only() {
    let cx = Cx::for_testing();
    let layout = FsLayout {
        devices: vec![DeviceSpec {
            read_only: true,
            ..DeviceSpec::new(1, SZ_1G)
        }],
        ..FsLayout::default()
    };
    let (tree, _) = open(MountOptions::default(), &layout);
    assert!(tree.state().is_read_only());
    assert!(matches!(tree.start_transaction(&cx), Err(FxtError::ReadOnly)));
    assert!(matches!(tree.trim_fs(&cx, 0, u64::MAX, 0), Err(FxtError::ReadOnly)));
}

// ── Snapshots ───────────────────────────────────────────────────────────────

struct ThreeLevel {
    data: PhysRange,
    leaf: TreeBlock,
    node: TreeBlock,
    top: TreeBlock,
}

/// Root 5: a level-2 root over one node over one leaf with one data extent.
fn three_level_tree(tree: &ExtentTree) -> ThreeLevel {
    let cx = Cx::for_testing();
    let trans = tree.start_transaction(&cx).expect("start");
    let data = tree
        .alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, 4096)
        .expect("data");
    let leaf = tree
        .create_leaf(
            &trans,
            FS_TREE_OBJECTID,
            vec![file_extent(257, 0, data, trans.generation())],
        )
        .expect("leaf");
    let node = tree
        .create_node(&trans, FS_TREE_OBJECTID, 1, &[&leaf])
        .expect("node");
    let top = tree
        .create_node(&trans, FS_TREE_OBJECTID, 2, &[&node])
        .expect("top");
    tree.create_root(&trans, FS_TREE_OBJECTID, &top).expect("root");
    let report = trans.commit().expect("commit");
    assert_eq!(report.blocks_written, 3);
    ThreeLevel {
        data,
        leaf,
        node,
        top,
    }
}

#[test]
fn dropping_the_source_converts_shared_blocks() {
    let cx = Cx::for_testing();
    let (tree, _) = open(small_chunks(), &data_and_metadata());
    let t = three_level_tree(&tree);

    let trans = tree.start_transaction(&cx).expect("start");
    let snap = tree
        .create_snapshot(&trans, FS_TREE_OBJECTID, SNAPSHOT_ID)
        .expect("snapshot");
    trans.commit().expect("commit");
    assert_eq!(snap.origin_generation, 2);
    assert_eq!(tree.root(FS_TREE_OBJECTID).expect("src").last_snapshot, 2);
    let node_info = tree
        .lookup_extent_info(ExtentTarget::tree_block(t.node.bytenr, NODESIZE, 1))
        .expect("node info");
    assert_eq!(node_info.refs, 2);

    let trans = tree.start_transaction(&cx).expect("start");
    let report = tree
        .drop_snapshot(&trans, FS_TREE_OBJECTID, true)
        .expect("drop");
    assert_eq!(report.status, DropStatus::Finished);
    trans.commit().expect("commit");

    let leaf = tree_record(&tree, &t.leaf).expect("leaf item");
    assert_eq!(leaf.item.refs, 1);
    assert_eq!(
        backref_ids(&tree, &leaf),
        vec![RefIdentity::SharedBlock {
            parent: t.node.bytenr
        }]
    );
    assert_ne!(leaf.item.flags & BLOCK_FLAG_FULL_BACKREF, 0);

    let node = tree_record(&tree, &t.node).expect("node item");
    assert_eq!(node.item.refs, 1);
    assert_eq!(
        backref_ids(&tree, &node),
        vec![RefIdentity::TreeBlock { root: SNAPSHOT_ID }]
    );
    assert_ne!(node.item.flags & BLOCK_FLAG_FULL_BACKREF, 0);

    let data = data_record(&tree, t.data).expect("data item");
    assert_eq!(
        backref_ids(&tree, &data),
        vec![RefIdentity::SharedData {
            parent: t.leaf.bytenr
        }]
    );

    assert!(tree_record(&tree, &t.top).is_none());
    assert!(tree
        .alloc()
        .contains_free(PhysRange::new(t.top.bytenr, NODESIZE)));
    assert!(tree.root(FS_TREE_OBJECTID).is_none());
    assert!(tree.root(SNAPSHOT_ID).is_some());
    tree.verify_refs().expect("verify");
}

#[test]
fn dropping_both_trees_frees_everything() {
    let cx = Cx::for_testing();
    let (tree, _) = open(small_chunks(), &data_and_metadata());
    let t = three_level_tree(&tree);
    let trans = tree.start_transaction(&cx).expect("start");
    tree.create_snapshot(&trans, FS_TREE_OBJECTID, SNAPSHOT_ID)
        .expect("snapshot");
    trans.commit().expect("commit");

    for root in [FS_TREE_OBJECTID, SNAPSHOT_ID] {
        let trans = tree.start_transaction(&cx).expect("start");
        tree.drop_snapshot(&trans, root, true).expect("drop");
        trans.commit().expect("commit");
    }
    assert_eq!(tree.verify_refs().expect("verify"), 0);
    assert!(tree.roots().is_empty());
    for block in [&t.leaf, &t.node, &t.top] {
        assert!(tree_record(&tree, block).is_none());
    }
    assert!(data_record(&tree, t.data).is_none());
    assert_eq!(tree.alloc().reserved_and_pinned(), 0);
}

#[test]
fn cancelled_drop_resumes_in_a_later_transaction() {
    let cx = Cx::for_testing();
    let (tree, _) = open(small_chunks(), &data_and_metadata());
    let trans = tree.start_transaction(&cx).expect("start");
    let mut leaves = Vec::new();
    for inode in 257..260 {
        let data = tree
            .alloc_data_extent(&trans, FS_TREE_OBJECTID, inode, 0, 4096)
            .expect("data");
        leaves.push(
            tree.create_leaf(
                &trans,
                FS_TREE_OBJECTID,
                vec![file_extent(inode, 0, data, trans.generation())],
            )
            .expect("leaf"),
        );
    }
    let children: Vec<&TreeBlock> = leaves.iter().collect();
    let top = tree
        .create_node(&trans, FS_TREE_OBJECTID, 1, &children)
        .expect("top");
    tree.create_root(&trans, FS_TREE_OBJECTID, &top).expect("root");
    trans.commit().expect("commit");
    assert_eq!(tree.verify_refs().expect("verify"), 7);

    let cancelled = Cx::for_testing();
    cancelled.set_cancel_requested(true);
    let trans = tree.start_transaction(&cancelled).expect("start");
    let first = tree
        .drop_snapshot(&trans, FS_TREE_OBJECTID, true)
        .expect("first");
    assert_eq!(first.status, DropStatus::Paused);
    assert!(matches!(trans.commit(), Err(FxtError::Cancelled)));
    assert_eq!(tree.state().aborted(), None);
    tree.start_transaction(&cx)
        .expect("rejoin")
        .commit()
        .expect("commit");
    let dead = tree.dead_roots();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].drop_in_progress());
    assert_eq!(dead[0].drop_level, 1);
    assert!(tree_record(&tree, &leaves[0]).is_none());
    assert!(tree_record(&tree, &leaves[1]).is_some());

    let trans = tree.start_transaction(&cx).expect("start");
    let second = tree
        .drop_snapshot(&trans, FS_TREE_OBJECTID, true)
        .expect("second");
    assert_eq!(second.status, DropStatus::Finished);
    trans.commit().expect("commit");
    assert!(tree.roots().is_empty());
    assert_eq!(tree.verify_refs().expect("verify"), 0);
}

// ── Merging ─────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn matching_add_and_drop_leave_the_items_untouched(
        root in prop_oneof![Just(FS_TREE_OBJECTID), Just(SNAPSHOT_ID)],
        inode in 257_u64..300,
        offset in (0_u64..16).prop_map(|n| n * 4096),
        count in 1_u32..4,
    ) {
        let cx = Cx::for_testing();
        let (tree, _) = open(small_chunks(), &data_and_metadata());
        let trans = tree.start_transaction(&cx).expect("start");
        let x = tree
            .alloc_data_extent(&trans, FS_TREE_OBJECTID, 257, 0, 4096)
            .expect("alloc");
        trans.commit().expect("commit");
        let before = tree.extents().extent_records().expect("records");

        let trans = tree.start_transaction(&cx).expect("start");
        let add = DelayedRef::data(RefAction::AddRef, x.start, x.len, 0, root, inode, offset)
            .with_count(count);
        let drop = DelayedRef { action: RefAction::DropRef, ..add };
        tree.inc_extent_ref(&trans, add).expect("add");
        tree.free_extent(&trans, drop).expect("drop");
        trans.commit().expect("commit");

        prop_assert_eq!(tree.extents().extent_records().expect("records"), before);
        prop_assert_eq!(tree.alloc().reserved_and_pinned(), 0);
    }
}

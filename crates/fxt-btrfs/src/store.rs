//! In-memory tree block image.

use crate::block::{BlockCheck, HEADER_FLAG_WRITTEN, TreeBlock};
use fxt_error::{FxtError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::trace;

/// Encoded tree blocks keyed by logical bytenr.
///
/// Every read goes through [`TreeBlock::parse`] and the parent check, so a
/// damaged image surfaces as [`FxtError::Corruption`] at the failing bytenr.
#[derive(Debug)]
pub struct BlockStore {
    nodesize: usize,
    blocks: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl BlockStore {
    #[must_use]
    pub fn new(nodesize: u32) -> Self {
        Self {
            nodesize: nodesize as usize,
            blocks: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn nodesize(&self) -> u32 {
        u32::try_from(self.nodesize).unwrap_or(u32::MAX)
    }

    pub fn write(&self, block: &TreeBlock) -> Result<()> {
        let bytes = block
            .encode(self.nodesize)
            .map_err(|err| FxtError::corruption(block.bytenr, err.to_string()))?;
        trace!(bytenr = block.bytenr, level = block.level, owner = block.owner, "block_write");
        self.blocks.write().insert(block.bytenr, bytes);
        Ok(())
    }

    /// Decode the block at `bytenr` without a parent check.
    pub fn load(&self, bytenr: u64) -> Result<TreeBlock> {
        let blocks = self.blocks.read();
        let bytes = blocks
            .get(&bytenr)
            .ok_or_else(|| FxtError::corruption(bytenr, "tree block not present"))?;
        TreeBlock::parse(bytes).map_err(|err| FxtError::corruption(bytenr, err.to_string()))
    }

    pub fn read(&self, bytenr: u64, check: &BlockCheck) -> Result<TreeBlock> {
        let block = self.load(bytenr)?;
        block.verify(bytenr, check)?;
        Ok(block)
    }

    #[must_use]
    pub fn contains(&self, bytenr: u64) -> bool {
        self.blocks.read().contains_key(&bytenr)
    }

    pub fn remove(&self, bytenr: u64) -> bool {
        self.blocks.write().remove(&bytenr).is_some()
    }

    /// Flag every block in `bytenrs` as having reached disk.
    pub fn mark_written(&self, bytenrs: impl IntoIterator<Item = u64>) -> Result<usize> {
        let mut marked = 0;
        for bytenr in bytenrs {
            let mut block = self.load(bytenr)?;
            if block.flags & HEADER_FLAG_WRITTEN == 0 {
                block.flags |= HEADER_FLAG_WRITTEN;
                self.write(&block)?;
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Flip one byte of a stored block, for fault injection.
    pub fn corrupt(&self, bytenr: u64, offset: usize) -> bool {
        let mut blocks = self.blocks.write();
        match blocks.get_mut(&bytenr).and_then(|bytes| bytes.get_mut(offset)) {
            Some(byte) => {
                *byte ^= 0xff;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    #[must_use]
    pub fn bytenrs(&self) -> Vec<u64> {
        self.blocks.read().keys().copied().collect()
    }
}

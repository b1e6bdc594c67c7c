/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Iteration over every block reachable from an inode, through the direct
//! pointers and the single, double and triple indirect trees.
//!
//! Deleted inodes frequently point at indirect blocks that have been reused
//! for data in the meantime. Traversal therefore stops at the first entry
//! that is not a valid block number and reports the tree as reused or
//! corrupted; everything enumerated up to that point remains valid.

use crate::analyzer::Analyzer;
use crate::ext3::Inode;
use crate::ext3::DIND_BLOCK;
use crate::ext3::DIRECT_BLOCKS;
use crate::ext3::IND_BLOCK;
use crate::ext3::TIND_BLOCK;
use std::io;

/// Report data blocks to the action.
pub const DIRECT_BIT: u32 = 1;
/// Report indirect (metadata) blocks to the action.
pub const INDIRECT_BIT: u32 = 2;

impl Analyzer {
    /// Invokes `action(blocknr, logical_index)` for each block reachable from
    /// `inode`.
    ///
    /// `mask` selects data blocks (`DIRECT_BIT`), indirect blocks
    /// (`INDIRECT_BIT`) or both. `logical_index` is the index of the block in
    /// the file; for an indirect block it is the index of the first data
    /// block below it. Holes (zero entries) are skipped but still advance the
    /// logical index.
    ///
    /// With `diagnose`, the traversal prints what it finds instead of calling
    /// the action.
    ///
    /// Returns `true` if an indirect block was encountered that does not look
    /// like an indirect block anymore.
    pub fn for_each_block_of<F: FnMut(u32, u64)>(
        &mut self,
        inode: &Inode,
        mask: u32,
        diagnose: bool,
        action: &mut F,
    ) -> io::Result<bool> {
        // The block pointers of a short enough symlink contain its target.
        if inode.is_symlink() && inode.used_sectors == 0 {
            return Ok(false);
        }
        let vpb = (self.image.block_size / 4) as u64; // values per block
        if diagnose {
            print!("Processing direct blocks...");
        }
        if mask & DIRECT_BIT != 0 {
            for i in 0..DIRECT_BLOCKS {
                let block = inode.block(i);
                if block != 0 {
                    if diagnose {
                        print!(" {block}");
                    } else {
                        action(block, i as u64);
                    }
                }
            }
        }
        if diagnose {
            println!();
        }
        let ind = inode.block(IND_BLOCK);
        if ind != 0 {
            if !self.image.is_block_number(ind) {
                return Ok(true);
            }
            if mask & INDIRECT_BIT != 0 && !diagnose {
                action(ind, DIRECT_BLOCKS as u64);
            }
            if mask & DIRECT_BIT != 0
                && self.walk_indirect(ind, DIRECT_BLOCKS as u64, diagnose, action)?
            {
                return Ok(true);
            }
        }
        let dind = inode.block(DIND_BLOCK);
        if dind != 0 {
            if !self.image.is_block_number(dind) {
                return Ok(true);
            }
            let base = DIRECT_BLOCKS as u64 + vpb;
            if mask & INDIRECT_BIT != 0 && !diagnose {
                action(dind, base);
            }
            if self.walk_double_indirect(dind, base, mask, diagnose, action)? {
                return Ok(true);
            }
        }
        let tind = inode.block(TIND_BLOCK);
        if tind != 0 {
            if !self.image.is_block_number(tind) {
                return Ok(true);
            }
            let base = DIRECT_BLOCKS as u64 + vpb + vpb * vpb;
            if mask & INDIRECT_BIT != 0 && !diagnose {
                action(tind, base);
            }
            if self.walk_triple_indirect(tind, base, mask, diagnose, action)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Walks one indirect block whose entries are data blocks.
    fn walk_indirect<F: FnMut(u32, u64)>(
        &mut self,
        block: u32,
        base: u64,
        diagnose: bool,
        action: &mut F,
    ) -> io::Result<bool> {
        if diagnose {
            print!("Processing indirect block {block}: ");
        }
        let buf = self.image.read_block_vec(block)?;
        let count = buf.len() / 4;
        let mut i = 0;
        while i < count {
            let entry = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
            if entry != 0 {
                if !self.image.is_block_number(entry) {
                    if diagnose {
                        println!("entry {i} contains block number {entry}, which is too large.");
                    }
                    break;
                }
                if !diagnose {
                    action(entry, base + i as u64);
                }
            }
            i += 1;
        }
        let corrupted = i < count;
        if diagnose && !corrupted {
            println!("OK");
        }
        Ok(corrupted)
    }

    /// Walks one double indirect block whose entries are indirect blocks.
    fn walk_double_indirect<F: FnMut(u32, u64)>(
        &mut self,
        block: u32,
        base: u64,
        mask: u32,
        diagnose: bool,
        action: &mut F,
    ) -> io::Result<bool> {
        if diagnose {
            println!("Start processing double indirect block {block}.");
        }
        let vpb = (self.image.block_size / 4) as u64;
        let buf = self.image.read_block_vec(block)?;
        let count = buf.len() / 4;
        let mut i = 0;
        while i < count {
            let entry = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
            if entry != 0 {
                if !self.image.is_block_number(entry) {
                    if diagnose {
                        println!(
                            "Entry {i} of double indirect block {block} contains block number {entry}, which is too large."
                        );
                    }
                    break;
                }
                let sub_base = base + i as u64 * vpb;
                if mask & INDIRECT_BIT != 0 && !diagnose {
                    action(entry, sub_base);
                }
                if mask & DIRECT_BIT != 0
                    && self.walk_indirect(entry, sub_base, diagnose, action)?
                {
                    break;
                }
            }
            i += 1;
        }
        if diagnose {
            println!("End processing double indirect block {block}.");
        }
        Ok(i < count)
    }

    /// Walks one triple indirect block whose entries are double indirect
    /// blocks.
    fn walk_triple_indirect<F: FnMut(u32, u64)>(
        &mut self,
        block: u32,
        base: u64,
        mask: u32,
        diagnose: bool,
        action: &mut F,
    ) -> io::Result<bool> {
        if diagnose {
            println!("Start processing triple indirect block {block}.");
        }
        let vpb = (self.image.block_size / 4) as u64;
        let buf = self.image.read_block_vec(block)?;
        let count = buf.len() / 4;
        let mut i = 0;
        while i < count {
            let entry = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
            if entry != 0 {
                if !self.image.is_block_number(entry) {
                    if diagnose {
                        println!(
                            "Entry {i} of triple indirect block {block} contains block number {entry}, which is too large."
                        );
                    }
                    break;
                }
                let sub_base = base + i as u64 * vpb * vpb;
                if mask & INDIRECT_BIT != 0 && !diagnose {
                    action(entry, sub_base);
                }
                if self.walk_double_indirect(entry, sub_base, mask, diagnose, action)? {
                    break;
                }
            }
            i += 1;
        }
        if diagnose {
            println!("End processing triple indirect block {block}.");
        }
        Ok(i < count)
    }

    /// Collects every data block of the given inode, in file order.
    ///
    /// Returns the blocks (zero entries omitted) and whether a reused or
    /// corrupted indirect block cut the enumeration short.
    pub fn data_blocks_of(&mut self, inode: &Inode) -> io::Result<(Vec<u32>, bool)> {
        let mut blocks = Vec::new();
        let corrupted = self.for_each_block_of(inode, DIRECT_BIT, false, &mut |block, _| {
            blocks.push(block)
        })?;
        Ok((blocks, corrupted))
    }

    /// Tells whether the given inode's block list contains `block`.
    pub fn inode_refers_to(&mut self, inode: &Inode, inode_number: u32, block: u32) -> io::Result<bool> {
        let mut found = false;
        let corrupted = self.for_each_block_of(inode, DIRECT_BIT, false, &mut |b, _| {
            if b == block {
                found = true;
            }
        })?;
        if found {
            return Ok(true);
        }
        if corrupted {
            println!(
                "WARNING: Could not verify if inode {inode_number} refers to block {block}: encountered a reused or corrupted (double/triple) indirect block!"
            );
        }
        Ok(false)
    }
}

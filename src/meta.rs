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

//! Per-group metadata: block bitmap, inode bitmap and inode table.
//!
//! A group's metadata is loaded the first time anything in the group is
//! needed and kept until the analyzer is dropped. The inode table keeps the
//! 128-byte prefix of each inode; larger inode sizes only pad.

use crate::analyzer::Analyzer;
use crate::ext3::Inode;
use crate::util::from_bytes;
use std::io;

/// The loaded metadata of one block group.
pub struct GroupMeta {
    /// The block usage bitmap.
    pub block_bitmap: Vec<u8>,
    /// The inode usage bitmap.
    pub inode_bitmap: Vec<u8>,
    /// The inode table, one entry per inode of the group.
    pub inodes: Vec<Inode>,
}

/// Tests bit `bit` of a bitmap. Bit order is LSB-first within a byte; bytes
/// run left to right.
pub fn bitmap_test(bitmap: &[u8], bit: u32) -> bool {
    bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

impl Analyzer {
    /// Loads the metadata of the given group, once.
    pub fn load_group(&mut self, group: u32) -> io::Result<()> {
        if self.meta[group as usize].is_some() {
            return Ok(());
        }
        let desc = self.image.groups[group as usize];
        let block_bitmap = self.image.read_block_vec(desc.block_usage_bitmap_addr)?;
        let inode_bitmap = self.image.read_block_vec(desc.inode_usage_bitmap_addr)?;
        // Load the inode table, keeping the leading 128 bytes of each inode.
        let inode_size = self.image.inode_size as usize;
        let count = self.image.inodes_per_group as usize;
        let mut table = vec![0u8; count * inode_size];
        let offset = self.image.block_to_offset(desc.inode_table_start_addr);
        self.image.read_at(offset, &mut table)?;
        let inodes = (0..count)
            .map(|i| from_bytes::<Inode>(&table[i * inode_size..]).unwrap())
            .collect();
        self.meta[group as usize] = Some(GroupMeta {
            block_bitmap,
            inode_bitmap,
            inodes,
        });
        Ok(())
    }

    /// Returns the metadata of the given group, loading it if needed.
    pub fn group_meta(&mut self, group: u32) -> io::Result<&GroupMeta> {
        self.load_group(group)?;
        Ok(self.meta[group as usize].as_ref().unwrap())
    }

    /// Returns a copy of the given inode, as currently on disk.
    pub fn inode(&mut self, inode: u32) -> io::Result<Inode> {
        let group = self.image.inode_to_group(inode);
        let index = (inode - 1 - group * self.image.inodes_per_group) as usize;
        Ok(self.group_meta(group)?.inodes[index])
    }

    /// Tells whether the given inode is allocated.
    pub fn is_allocated_inode(&mut self, inode: u32) -> io::Result<bool> {
        let group = self.image.inode_to_group(inode);
        let bit = inode - 1 - group * self.image.inodes_per_group;
        Ok(bitmap_test(&self.group_meta(group)?.inode_bitmap, bit))
    }

    /// Tells whether the given block is allocated.
    pub fn is_allocated_block(&mut self, block: u32) -> io::Result<bool> {
        let group = self.image.block_to_group(block);
        let bit =
            block - self.image.first_data_block - group * self.image.blocks_per_group;
        Ok(bitmap_test(&self.group_meta(group)?.block_bitmap, bit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_order() {
        // LSB-first: bit 0 is the low bit of the first byte.
        let bitmap = [0b0000_0101u8, 0b1000_0000];
        assert!(bitmap_test(&bitmap, 0));
        assert!(!bitmap_test(&bitmap, 1));
        assert!(bitmap_test(&bitmap, 2));
        assert!(!bitmap_test(&bitmap, 14));
        assert!(bitmap_test(&bitmap, 15));
    }
}

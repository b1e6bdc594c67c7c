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

//! In-memory representation of reconstructed directories.
//!
//! A [`Directory`] is an inode together with the blocks recovered for it.
//! Directories live in a flat slab owned by the analyzer and are referred to
//! by [`DirectoryId`]; entries carry their owner's id instead of pointers, so
//! the graph has no cycles and no lifetimes.
//!
//! Reading a directory block records *all* entries it holds: the live entry
//! chain, and deleted entries recovered from the tail region beyond the
//! nominal end of the chain.

use crate::analyzer::Analyzer;
use crate::blockdetect::DirectoryBlockStats;
use crate::blockdetect::IsDirectory;
use crate::ext3::dir_rec_len;
use crate::ext3::DirEntryHeader;
use crate::ext3::DIR_PAD;
use crate::ext3::MODE_MAP;
use crate::util::ctime;
use crate::util::from_bytes;
use std::io;

/// Handle of a [`Directory`] in the analyzer's slab.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DirectoryId(pub usize);

/// Position of an entry within its block's entry list.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Index {
    /// The order of the entry in the block.
    pub cur: usize,
    /// The index of the entry this entry's record length chains to, or 0
    /// when it chains to the end of the block.
    pub next: usize,
}

/// One directory entry, together with the state analysis derived for it.
#[derive(Clone, Debug)]
pub struct DirEntry {
    /// The file type hint from the entry (low 3 bits), when the filetype
    /// feature is enabled.
    pub file_type: u8,
    /// The inode the entry refers to.
    pub inode: u32,
    /// The file name.
    pub name: String,
    /// Position of the entry in its block.
    pub index: Index,
    /// The entry lies in the tail region of its block, or its inode was
    /// deleted.
    pub deleted: bool,
    /// The referenced inode is currently allocated.
    pub allocated: bool,
    /// The entry is deleted but its inode has been taken over by something
    /// else since.
    pub reallocated: bool,
    /// The entry's inode field is zero (wiped deleted entry).
    pub zero_inode: bool,
    /// The entry is part of the live entry chain of its block.
    pub linked: bool,
    /// The entry is excluded by the user's filters.
    pub filtered: bool,
}

impl DirEntry {
    /// Compares the identity of two entries; used to collapse byte-identical
    /// candidate blocks.
    pub fn exactly_equal(&self, other: &DirEntry) -> bool {
        self.inode == other.inode
            && self.name == other.name
            && self.file_type == other.file_type
            && self.index.next == other.index.next
    }
}

/// The decoded contents of one directory block.
#[derive(Clone, Debug, Default)]
pub struct DirectoryBlock {
    /// The block number.
    pub block: u32,
    /// Every entry recovered from the block, in block order.
    pub entries: Vec<DirEntry>,
}

impl DirectoryBlock {
    /// Tells whether two blocks hold exactly the same entries.
    pub fn exactly_equal(&self, other: &DirectoryBlock) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.exactly_equal(b))
    }
}

/// A reconstructed directory.
pub struct Directory {
    /// The path of the directory relative to the filesystem root. The root
    /// itself has the empty path.
    pub path: String,
    /// The directory's inode number.
    pub inode: u32,
    /// The blocks recovered for this directory. The first one is the start
    /// block; the rest are extended blocks.
    pub blocks: Vec<DirectoryBlock>,
}

impl Directory {
    /// Returns the directory's first (start) block.
    pub fn first_block(&self) -> u32 {
        self.blocks[0].block
    }
}

/// An entry as laid out in the block, before filtering.
struct RawEntry {
    offset: usize,
    rec_len: usize,
    header: DirEntryHeader,
    name: Vec<u8>,
    deleted: bool,
    linked: bool,
}

impl Analyzer {
    /// Reads and decodes the given directory block.
    pub fn read_directory_block(&mut self, block: u32) -> io::Result<DirectoryBlock> {
        let buf = self.image.read_block_vec(block)?;
        self.parse_directory_block(&buf, block)
    }

    /// Decodes a directory block from its raw contents.
    pub fn parse_directory_block(&mut self, buf: &[u8], blocknr: u32) -> io::Result<DirectoryBlock> {
        let block_size = self.image.block_size as usize;
        let mut raw = Vec::new();
        let mut occupied = vec![false; block_size / DIR_PAD];
        // Walk the live entry chain.
        let mut offset = 0;
        while offset + dir_rec_len(1) <= block_size {
            let header: DirEntryHeader = from_bytes(&buf[offset..]).unwrap();
            let rec_len = header.rec_len as usize;
            if rec_len == 0 || rec_len & 3 != 0 || offset + rec_len > block_size {
                // Not a valid chain (this block was not validated, or the
                // caller wants whatever can be salvaged).
                break;
            }
            let name_end = (offset + 8 + header.name_len as usize).min(block_size);
            raw.push(RawEntry {
                offset,
                rec_len,
                header,
                name: buf[offset + 8..name_end].to_vec(),
                deleted: false,
                linked: true,
            });
            occupied[offset / DIR_PAD] = true;
            offset += rec_len;
        }
        // Search the tail region for deleted entries.
        let mut offset = block_size - dir_rec_len(1);
        while offset > 0 {
            if !occupied[offset / DIR_PAD] {
                let mut stats = DirectoryBlockStats::default();
                if self.is_directory_block(buf, blocknr, &mut stats, false, false, offset)
                    != IsDirectory::No
                {
                    let header: DirEntryHeader = from_bytes(&buf[offset..]).unwrap();
                    let name_end = (offset + 8 + header.name_len as usize).min(block_size);
                    raw.push(RawEntry {
                        offset,
                        rec_len: header.rec_len as usize,
                        header,
                        name: buf[offset + 8..name_end].to_vec(),
                        deleted: true,
                        linked: false,
                    });
                }
            }
            offset -= DIR_PAD;
        }
        raw.sort_by_key(|entry| entry.offset);
        // Resolve the chain indices.
        let mut entries = Vec::with_capacity(raw.len());
        for (cur, entry) in raw.iter().enumerate() {
            let target = entry.offset + entry.rec_len;
            let next = raw
                .iter()
                .position(|other| other.offset == target)
                .unwrap_or(0);
            let mut dir_entry = self.filter_dir_entry(&entry.header, &entry.name, entry.deleted, entry.linked)?;
            dir_entry.index = Index { cur, next };
            entries.push(dir_entry);
        }
        Ok(DirectoryBlock {
            block: blocknr,
            entries,
        })
    }

    /// Derives the analysis state of one entry and applies the user's
    /// filters.
    pub(crate) fn filter_dir_entry(
        &mut self,
        header: &DirEntryHeader,
        name: &[u8],
        deleted: bool,
        linked: bool,
    ) -> io::Result<DirEntry> {
        let inode_number = header.inode;
        let file_type = header.file_type & 7;
        let zero_inode = inode_number == 0;
        let mut deleted = deleted;
        let mut allocated = false;
        let mut reallocated = false;
        let mut filtered = zero_inode && !self.opts.zeroed_inodes;
        if !zero_inode && inode_number <= self.image.inode_count {
            let inode = self.inode(inode_number)?;
            allocated = self.is_allocated_inode(inode_number)?;
            reallocated = (deleted && allocated)
                || (deleted && !inode.is_deleted())
                || (self.image.has_filetype
                    && MODE_MAP[file_type as usize] != inode.kind() as u32);
            deleted = deleted || inode.is_deleted();
            // Block pointers are wiped on deletion (the reason this tool
            // exists), except that symlinks keep their target there. A valid
            // dtime alongside a surviving block list is worth a note.
            let inode_count = self.image.inode_count;
            if inode.has_valid_dtime(inode_count)
                && inode.block(0) != 0
                && (inode.is_regular_file() || inode.is_directory())
            {
                let dtime = inode.dtime;
                let considered = if inode.is_deleted() { "" } else { " not" };
                println!(
                    "Note: Inode {inode_number} has non-zero dtime ({dtime}  {}) but non-zero block list ({}) [ext3grep does{considered} consider this inode to be deleted]",
                    ctime(dtime),
                    inode.block(0)
                );
            }
            let opts = &self.opts;
            let dtime = inode.dtime as i64;
            filtered = !((!opts.allocated || allocated)
                && (!opts.unallocated || !allocated)
                && (!opts.deleted || deleted)
                && (!opts.directory || inode.is_directory())
                && (!reallocated || opts.reallocated)
                && (reallocated
                    || (!inode.is_deleted() && !opts.deleted)
                    || (inode.has_valid_dtime(inode_count)
                        && opts.after <= dtime
                        && (opts.before == 0 || dtime < opts.before))));
        }
        Ok(DirEntry {
            file_type,
            inode: inode_number,
            name: String::from_utf8_lossy(name).into_owned(),
            index: Index::default(),
            deleted,
            allocated,
            reallocated,
            zero_inode,
            linked,
            filtered,
        })
    }
}

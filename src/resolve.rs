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

//! Stage 2: reduce the candidate blocks of every directory inode to one.
//!
//! Stage 1 may find several start blocks claiming the same inode: the live
//! block, old copies in the journal area, and blocks of directories that
//! were deleted and whose inode was reused. The reduction policy is applied
//! in order until one candidate remains:
//!
//! 1. an allocated directory inode's own first block is authoritative;
//! 2. candidates outside the journal beat candidates inside it; if all are
//!    inside, the one with the highest governing sequence wins;
//! 3. the candidate with the most recent journal tag wins;
//! 4. byte-identical candidates collapse into one.
//!
//! This module also attributes extended directory blocks to their owning
//! inode, combining journal evidence with the ".." back-links of the
//! directories listed inside the block.

use crate::analyzer::Analyzer;
use crate::directory::DirectoryBlock;
use crate::ext3::FT_DIR;
use crate::scan::BlockList;
use std::collections::BTreeMap;
use std::io;

impl Analyzer {
    /// Runs stage 1 and the stage 2 reduction, once.
    pub fn init_dir_index(&mut self) -> io::Result<()> {
        if self.stage2_done {
            return Ok(());
        }
        self.stage1()?;
        self.resolve_dir_index()?;
        self.stage2_done = true;
        Ok(())
    }

    /// Applies the reduction policy to every inode of the index.
    fn resolve_dir_index(&mut self) -> io::Result<()> {
        // Counters for the result summaries.
        let mut referenced = 0u32; // inodes referenced by at least one block
        let mut shared = 0u32; // inodes referenced by more than one block
        let mut allocated_dirs = 0u32;
        let mut allocated_shared = 0u32;
        let mut resolved_allocated = 0u32;
        let mut resolved_journal = 0u32;
        let mut resolved_sequence = 0u32;
        let mut resolved_equal = 0u32;
        // Rule 1: allocation wins.
        for inode_number in 1..=self.image.inode_count {
            let allocated = self.is_allocated_inode(inode_number)?;
            if allocated {
                let inode = self.inode(inode_number)?;
                if inode.is_directory() {
                    allocated_dirs += 1;
                    let first_block = inode.block(0);
                    if first_block == 0 {
                        eprintln!(
                            "WARNING: inode {inode_number} is an allocated directory that does not reference any block. This seems to indicate a corrupted file system."
                        );
                        continue;
                    }
                    let list = &self.dir_index[inode_number as usize];
                    if list.is_empty() {
                        eprintln!(
                            "WARNING: inode {inode_number} is an allocated inode without any directory block pointing to it!"
                        );
                        continue;
                    }
                    if list.len() > 1 {
                        allocated_shared += 1;
                    }
                    if !list.blocks().contains(&first_block) {
                        eprintln!(
                            "WARNING: the first block ({first_block}) of allocated directory inode {inode_number} was not found by the scan; keeping it anyway."
                        );
                    } else if list.len() > 1 {
                        resolved_allocated += 1;
                    }
                    self.dir_index[inode_number as usize] =
                        BlockList::One(first_block);
                }
            }
            let list = &self.dir_index[inode_number as usize];
            if list.is_empty() {
                continue;
            }
            referenced += 1;
            if list.len() > 1 {
                shared += 1;
            }
        }
        println!("Result of stage one:");
        println!(
            "  {referenced} inodes are referenced by one or more directory blocks, {allocated_dirs} of those inodes {} still allocated.",
            if allocated_dirs == 1 { "is" } else { "are" }
        );
        println!(
            "  {shared} inodes are referenced by more than one directory block, {allocated_shared} of those inodes {} still allocated.",
            if allocated_shared == 1 { "is" } else { "are" }
        );
        println!(
            "  {} blocks contain an extended directory.",
            self.extended_blocks.len()
        );
        // Rules 2 to 4, for inodes still shared between blocks.
        for inode_number in 1..=self.image.inode_count {
            if self.dir_index[inode_number as usize].len() <= 1 {
                continue;
            }
            let mut candidates: Vec<u32> = self.dir_index[inode_number as usize].blocks().to_vec();
            // Rule 2: drop journal candidates, unless all candidates are in
            // the journal; then keep the one with the highest governing
            // sequence.
            let journal_count = candidates
                .iter()
                .filter(|&&block| self.journal.is_journal(block))
                .count();
            let all_in_journal = journal_count == candidates.len();
            if all_in_journal {
                let highest = candidates
                    .iter()
                    .filter_map(|&block| self.journal.governing_sequence(block))
                    .max()
                    .unwrap_or(0);
                let min_block = candidates.iter().copied().min().unwrap();
                if highest == 0 {
                    eprintln!(
                        "WARNING: More than one directory block references inode {inode_number} but all of them are in the journal and none of them have a descriptor block (the start of the transaction was probably overwritten). The most likely correct directory block would be block {min_block} but we're disregarding it because journal blocks without a descriptor block cannot be used."
                    );
                }
                candidates.retain(|&block| {
                    self.journal.governing_sequence(block) == Some(highest) && highest != 0
                });
            } else {
                candidates.retain(|&block| !self.journal.is_journal(block));
            }
            if candidates.len() <= 1 {
                // Disregarding every candidate (all in the journal, none
                // with a descriptor) is not a resolution.
                if candidates.len() == 1 {
                    resolved_journal += 1;
                }
                self.dir_index[inode_number as usize] =
                    BlockList::from_vec(candidates);
                continue;
            }
            // Rule 3: journal recency. Ties keep the first candidate.
            let mut best: Option<(u32, u32)> = None;
            for &block in &candidates {
                let sequence = self.journal.largest_sequence_for(block);
                if sequence > best.map(|(s, _)| s).unwrap_or(0) {
                    best = Some((sequence, block));
                }
            }
            let best = best.map(|(_, block)| block);
            if let Some(best) = best {
                candidates.retain(|&block| block == best);
            }
            if candidates.len() == 1 {
                self.dir_index[inode_number as usize] =
                    BlockList::from_vec(candidates);
                resolved_sequence += 1;
                continue;
            }
            // Rule 4: collapse byte-identical candidates.
            let mut decoded: Vec<DirectoryBlock> = Vec::with_capacity(candidates.len());
            for &block in &candidates {
                decoded.push(self.read_directory_block(block)?);
            }
            let mut kept: Vec<u32> = Vec::new();
            let mut kept_blocks: Vec<DirectoryBlock> = Vec::new();
            for (i, block) in decoded.into_iter().enumerate() {
                if kept_blocks.iter().any(|other| other.exactly_equal(&block)) {
                    continue;
                }
                kept.push(candidates[i]);
                kept_blocks.push(block);
            }
            let resolved = kept.len() == 1;
            if resolved {
                resolved_equal += 1;
            } else {
                // Two equally strong candidates; pick the lowest block to
                // make progress.
                kept.sort_unstable();
                eprintln!(
                    "WARNING: inode {inode_number} is still claimed by blocks {kept:?}; picking the lowest."
                );
            }
            self.dir_index[inode_number as usize] = BlockList::from_vec(kept);
        }
        println!("Result of stage two:");
        if resolved_allocated > 0 {
            println!(
                "  {resolved_allocated} of those inodes could be resolved because they are still allocated."
            );
        }
        if resolved_journal > 0 {
            println!(
                "  {resolved_journal} inodes could be resolved because all referring blocks but one were journal blocks."
            );
        }
        if resolved_sequence > 0 {
            println!(
                "  {resolved_sequence} inodes could be resolved because at least one of the blocks was found in the journal."
            );
        }
        if resolved_equal > 0 {
            println!(
                "  {resolved_equal} inodes could be resolved because all referring blocks were exactly identical."
            );
        }
        println!();
        Ok(())
    }

    /// Determines the inode owning an extended directory block.
    ///
    /// Three sources are combined: the journal's `block_to_dir_inode` map
    /// (trusted most), the ".." entries of directories listed in the block,
    /// and nothing else; a block no source can attribute ends up in
    /// lost+found.
    pub(crate) fn find_extended_block_owner(&mut self, blocknr: u32) -> io::Result<Option<u32>> {
        let inode_from_journal = self.journal.block_to_dir_inode.get(&blocknr).copied();
        let block = self.read_directory_block(blocknr)?;
        // Count, for every directory entry of the block that looks like a
        // directory, the parent inode its first block's ".." entry points
        // to. Linked entries are more trustworthy than deleted ones.
        let mut linked: BTreeMap<u32, u32> = BTreeMap::new();
        let mut unlinked: BTreeMap<u32, u32> = BTreeMap::new();
        for entry in block.entries.clone() {
            if entry.zero_inode {
                continue;
            }
            let maybe_directory = if self.image.has_filetype {
                entry.file_type == FT_DIR
            } else if !entry.reallocated {
                self.inode(entry.inode)?.is_directory()
            } else {
                // Without the filetype feature there is no way to tell what
                // a reallocated entry used to be.
                true
            };
            if !maybe_directory {
                continue;
            }
            let Some(first_block) = self.dir_inode_to_block(entry.inode) else {
                if self.image.has_filetype || !entry.reallocated {
                    println!("Cannot find a directory block for inode {}.", entry.inode);
                }
                break;
            };
            let first = self.read_directory_block(first_block)?;
            // A start block begins with "." for the directory itself and
            // ".." for its parent.
            if first.entries.len() < 2
                || first.entries[0].name != "."
                || first.entries[0].inode != entry.inode
                || first.entries[1].name != ".."
                || first.entries[1].inode == 0
            {
                continue;
            }
            let parent = first.entries[1].inode;
            let map = if entry.linked { &mut linked } else { &mut unlinked };
            *map.entry(parent).or_insert(0) += 1;
        }
        let counts = if !linked.is_empty() { &linked } else { &unlinked };
        let linked_source = !linked.is_empty();
        let mut inode_number = None;
        if counts.len() > 1 {
            if inode_from_journal.is_some() {
                println!(
                    "Extended directory at {blocknr} has entries that appear to be directories, but their parent directory inode is not consistent."
                );
            } else {
                println!(
                    "WARNING: extended directory at {blocknr} has entries that appear to be directories, but their parent directory inode is not consistent! I can't make this decision for you. You will have to manually pick an inode for this block number. The inodes that I found are (although ALL could be wrong):"
                );
                for (inode, count) in counts {
                    println!(
                        "  {inode} ({count} time{})",
                        if *count == 1 { "" } else { "s" }
                    );
                }
            }
        } else if let Some((&found, &count)) = counts.iter().next() {
            inode_number = Some(found);
            match inode_from_journal {
                Some(journal_inode) if journal_inode != found => {
                    let kind = if linked_source { "linked" } else { "unlinked" };
                    println!(
                        "Extended directory at {blocknr} appears to contain {count} {kind} directory whose parent directory has inode {found} but according to the journal it should be {journal_inode}. Using the latter."
                    );
                    // The journal is the more reliable source: inode contents
                    // can have been reused and not refer to this block at
                    // all.
                    inode_number = Some(journal_inode);
                    if linked_source {
                        println!(
                            "WARNING: We really only expect that to happen for unlinked directory entries. Have a look at block {blocknr}"
                        );
                    }
                    if count > 1 {
                        println!(
                            "WARNING: It's suspiciously weird that there are more than one such \"directories\". Have a look at block {blocknr}"
                        );
                    }
                }
                _ => {
                    let kind = if linked_source { "linked" } else { "unlinked" };
                    println!(
                        "Extended directory at {blocknr} belongs to inode {found} (from {count} {kind} directories)."
                    );
                }
            }
        }
        if inode_number.is_none() {
            match inode_from_journal {
                Some(journal_inode) => {
                    println!(
                        "Extended directory at {blocknr} belongs to inode {journal_inode} (from journal)."
                    );
                    inode_number = Some(journal_inode);
                }
                None => {
                    println!("Could not find an inode for extended directory at {blocknr}.");
                }
            }
        }
        Ok(inode_number)
    }
}

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

//! Stage 1: scan the whole image for directory blocks.
//!
//! Every block of every group is classified, including the journal area
//! since deleted directory blocks frequently survive only there. Start
//! blocks are recorded per referenced inode in a small-vector index; blocks
//! holding only tail entries go to the extended block list. The result is
//! persisted so reruns skip the scan.

use crate::analyzer::Analyzer;
use crate::blockdetect::DirectoryBlockStats;
use crate::blockdetect::IsDirectory;
use crate::cache;
use crate::ext3::DirEntryHeader;
use crate::util::from_bytes;
use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;

/// Candidate directory start blocks of one inode.
///
/// Most inodes have zero or one candidate; only collisions allocate.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum BlockList {
    /// No candidate block.
    #[default]
    Empty,
    /// Exactly one candidate block.
    One(u32),
    /// Several candidate blocks.
    Many(Vec<u32>),
}

impl BlockList {
    /// Tells whether the list is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns the number of candidates.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::One(_) => 1,
            Self::Many(blocks) => blocks.len(),
        }
    }

    /// Returns the candidates as a slice.
    pub fn blocks(&self) -> &[u32] {
        match self {
            Self::Empty => &[],
            Self::One(block) => std::slice::from_ref(block),
            Self::Many(blocks) => blocks,
        }
    }

    /// Returns the first candidate, if any.
    pub fn first(&self) -> Option<u32> {
        self.blocks().first().copied()
    }

    /// Appends a candidate.
    pub fn push(&mut self, block: u32) {
        match self {
            Self::Empty => *self = Self::One(block),
            Self::One(first) => *self = Self::Many(vec![*first, block]),
            Self::Many(blocks) => blocks.push(block),
        }
    }

    /// Removes a candidate, collapsing the representation.
    pub fn remove(&mut self, block: u32) {
        match self {
            Self::Empty => {}
            Self::One(first) => {
                if *first == block {
                    *self = Self::Empty;
                }
            }
            Self::Many(blocks) => {
                blocks.retain(|&b| b != block);
                match blocks.len() {
                    0 => *self = Self::Empty,
                    1 => *self = Self::One(blocks[0]),
                    _ => {}
                }
            }
        }
    }

    /// Builds a list from a vector of blocks.
    pub fn from_vec(mut blocks: Vec<u32>) -> Self {
        match blocks.len() {
            0 => Self::Empty,
            1 => Self::One(blocks[0]),
            _ => Self::Many(std::mem::take(&mut blocks)),
        }
    }
}

impl Analyzer {
    /// Returns the path of the stage 1 cache file.
    pub fn stage1_cache_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.ext3grep.stage1", self.device_basename()))
    }

    /// Returns the canonical directory start block of the given inode, if
    /// one is known.
    ///
    /// Stage 1 and the stage 2 reduction must have run. When several
    /// candidates remain after the reduction policy, the first (lowest)
    /// block is returned.
    pub fn dir_inode_to_block(&self, inode: u32) -> Option<u32> {
        debug_assert!(self.stage2_done || self.tree_done);
        self.dir_index[inode as usize].first()
    }

    /// Runs stage 1, or loads its cache.
    pub(crate) fn stage1(&mut self) -> io::Result<()> {
        if self.stage1_done {
            return Ok(());
        }
        let cache_path = self.stage1_cache_path();
        if cache::is_valid(&cache_path)? {
            self.load_stage1_cache()?;
        } else {
            self.scan_all_groups()?;
            self.write_stage1_cache()?;
        }
        self.stage1_done = true;
        Ok(())
    }

    /// Scans every block of every group for directory blocks.
    fn scan_all_groups(&mut self) -> io::Result<()> {
        println!("Finding all blocks that might be directories.");
        println!("D: block containing directory start, d: block containing more directory entries.");
        println!("Each plus represents a directory start that references the same inode as a directory start that we found previously.");
        let mut buf = vec![0u8; self.image.block_size as usize];
        for group in 0..self.image.group_count {
            print!("\nSearching group {group}: ");
            io::stdout().flush()?;
            let first_block = self.image.group_to_block(group);
            let last_block = (first_block + self.image.blocks_per_group).min(self.image.block_count);
            for block in first_block..last_block {
                self.image.read_block(block, &mut buf)?;
                let mut stats = DirectoryBlockStats::default();
                match self.is_directory_block(&buf, block, &mut stats, false, true, 0) {
                    IsDirectory::Start => {
                        // The "." entry names the directory's own inode.
                        let entry: DirEntryHeader = from_bytes(&buf).unwrap();
                        let inode = entry.inode;
                        if self.dir_index[inode as usize].is_empty() {
                            print!("D");
                        } else {
                            print!("+");
                        }
                        self.dir_index[inode as usize].push(block);
                    }
                    IsDirectory::Extended => {
                        print!("d");
                        self.extended_blocks.push(block);
                    }
                    IsDirectory::No => {}
                }
            }
            io::stdout().flush()?;
        }
        println!();
        Ok(())
    }

    /// Writes the stage 1 cache.
    fn write_stage1_cache(&self) -> io::Result<()> {
        let cache_path = self.stage1_cache_path();
        println!(
            "Writing analysis so far to '{}'. Delete that file if you want to do this stage again.",
            cache_path.display()
        );
        let mut out = BufWriter::new(File::create(&cache_path)?);
        writeln!(out, "# Stage 1 data for {}.", self.image.path.display())?;
        writeln!(out, "# Inodes and directory start blocks that use it for dir entry '.'.")?;
        writeln!(out, "# INODE : BLOCK [BLOCK ...]")?;
        for inode in 1..=self.image.inode_count {
            let list = &self.dir_index[inode as usize];
            if list.is_empty() {
                continue;
            }
            write!(out, "{inode} :")?;
            for block in list.blocks() {
                write!(out, " {block}")?;
            }
            writeln!(out)?;
        }
        writeln!(out, "# Extended directory blocks.")?;
        for block in &self.extended_blocks {
            writeln!(out, "{block}")?;
        }
        out.write_all(cache::END_MARKER)?;
        out.flush()
    }

    /// Loads the stage 1 cache.
    fn load_stage1_cache(&mut self) -> io::Result<()> {
        let cache_path = self.stage1_cache_path();
        println!("Loading {}...", cache_path.display());
        for line in cache::read_lines(&cache_path)? {
            match line.split_once(':') {
                Some((inode_part, blocks_part)) => {
                    let inode: u32 = inode_part
                        .trim()
                        .parse()
                        .map_err(|_| bad_cache(&cache_path, &line))?;
                    if inode == 0 || inode > self.image.inode_count {
                        return Err(bad_cache(&cache_path, &line));
                    }
                    let mut blocks = Vec::new();
                    for word in blocks_part.split_whitespace() {
                        blocks.push(word.parse().map_err(|_| bad_cache(&cache_path, &line))?);
                    }
                    self.dir_index[inode as usize] = BlockList::from_vec(blocks);
                }
                None => {
                    let block = line
                        .trim()
                        .parse()
                        .map_err(|_| bad_cache(&cache_path, &line))?;
                    self.extended_blocks.push(block);
                }
            }
        }
        Ok(())
    }
}

/// Produces the error for a malformed cache line.
fn bad_cache(path: &std::path::Path, line: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: malformed cache line: {line}", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_list() {
        let mut list = BlockList::default();
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
        list.push(10);
        assert_eq!(list, BlockList::One(10));
        assert_eq!(list.blocks(), &[10]);
        list.push(20);
        assert_eq!(list, BlockList::Many(vec![10, 20]));
        list.remove(10);
        assert_eq!(list, BlockList::One(20));
        list.remove(20);
        assert!(list.is_empty());
        // Removing from a One that does not match keeps the entry.
        let mut list = BlockList::One(5);
        list.remove(7);
        assert_eq!(list, BlockList::One(5));
    }
}

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

//! Directory tree reconstruction.
//!
//! A depth-first walk from the root inode assigns a path to every directory
//! that can be placed, live or deleted. Deleted directories are entered
//! through their recovered start block, after verifying that the block's
//! ".." entry still points back to the parent; a mismatch means the block
//! was reused and the subtree is reported as lost.
//!
//! When two directory blocks claim the same path with different inodes, the
//! journal decides: the inode whose last undeleted copy refers to its block
//! with the highest transaction sequence wins.
//!
//! The result is persisted as the stage 2 cache. A second pass derives the
//! path of every non-directory file, preferring the newest directory block
//! that names it.

use crate::analyzer::Analyzer;
use crate::cache;
use crate::directory::Directory;
use crate::directory::DirectoryId;
use crate::ext3::FT_DIR;
use crate::ext3::ROOT_INODE;
use crate::scan::BlockList;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;

/// The recursion limit while reconstructing the tree, when `--depth` does
/// not impose a smaller one.
const TREE_DEPTH: u32 = 10000;

impl Analyzer {
    /// Returns the path of the stage 2 cache file.
    pub fn stage2_cache_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.ext3grep.stage2", self.device_basename()))
    }

    /// Reconstructs the directory tree, or loads it from the stage 2 cache.
    pub fn init_directories(&mut self) -> io::Result<()> {
        if self.tree_done {
            return Ok(());
        }
        let cache_path = self.stage2_cache_path();
        if cache::is_valid(&cache_path)? {
            self.load_stage2_cache()?;
            self.tree_done = true;
            return Ok(());
        }
        self.init_dir_index()?;
        // Attribute every extended block to its owning inode.
        let extended = self.extended_blocks.clone();
        let mut inode_to_extended: HashMap<u32, Vec<u32>> = HashMap::new();
        for blocknr in extended {
            if let Some(inode) = self.find_extended_block_owner(blocknr)? {
                inode_to_extended.entry(inode).or_default().push(blocknr);
            }
        }
        // Walk the tree from the root. Inode 2 is never wiped, so a missing
        // root block means the image is not usable at all.
        let Some(root_block) = self.dir_inode_to_block(ROOT_INODE) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no directory block found for the root inode",
            ));
        };
        let root_inode = self.inode(ROOT_INODE)?;
        let (mut root_blocks, _) = self.data_blocks_of(&root_inode)?;
        if root_blocks.is_empty() {
            root_blocks = vec![root_block];
        }
        let root_id = self
            .insert_directory(String::new(), ROOT_INODE, root_blocks, &inode_to_extended)?
            .expect("the root directory cannot conflict");
        let mut chain = vec![ROOT_INODE];
        self.walk_directory(root_id, 1, 0, &mut chain, &inode_to_extended)?;
        // Extended blocks whose owner could not be placed anywhere are
        // attached to lost+found.
        self.attach_leftovers_to_lost_plus_found(&inode_to_extended)?;
        println!();
        self.write_stage2_cache()?;
        self.tree_done = true;
        Ok(())
    }

    /// Places a directory at the given path.
    ///
    /// `base_blocks` are the blocks known from the walk (the inode's block
    /// list for live directories, the recovered start block for deleted
    /// ones); the extended blocks attributed to the inode are appended.
    ///
    /// Returns `None` when the directory was already processed or lost a
    /// conflict, in which case the caller must not recurse into it.
    fn insert_directory(
        &mut self,
        path: String,
        inode: u32,
        base_blocks: Vec<u32>,
        inode_to_extended: &HashMap<u32, Vec<u32>>,
    ) -> io::Result<Option<DirectoryId>> {
        let first_block = base_blocks[0];
        let mut replace = None;
        if let Some(&existing_id) = self.all_directories.get(&path) {
            let existing_inode = self.directory(existing_id).inode;
            let existing_first = self.directory(existing_id).first_block();
            if existing_inode == inode && existing_first == first_block {
                // Already processed.
                return Ok(None);
            }
            println!(
                "Directory \"{path}\" is linked to both inode/block {inode}/{first_block} as well as {existing_inode}/{existing_first}"
            );
            let sequence_new =
                self.last_undeleted_directory_inode_referring_to_block(inode, first_block)?;
            let sequence_old = self
                .last_undeleted_directory_inode_referring_to_block(existing_inode, existing_first)?;
            if sequence_new == sequence_old {
                eprintln!(
                    "WARNING: two directories with the same path have the same journal evidence (sequence {sequence_new}); keeping the first. It could be the WRONG one though."
                );
                return Ok(None);
            }
            if sequence_new > sequence_old {
                print!("Replacing {existing_inode}/{existing_first} ");
                if sequence_old == u32::MAX {
                    print!("(allocated) ");
                } else {
                    print!("(sequence {sequence_old}) ");
                }
                print!("with {inode}/{first_block} ");
                if sequence_new == u32::MAX {
                    println!("(allocated).");
                } else {
                    println!("(sequence {sequence_new}).");
                }
                self.inode_to_directory.remove(&existing_inode);
                replace = Some(existing_id);
            } else {
                print!("Keeping {existing_inode}/{existing_first} ");
                if sequence_old == u32::MAX {
                    print!("(allocated) ");
                } else {
                    print!("(sequence {sequence_old}) ");
                }
                println!("over {inode}/{first_block} (sequence {sequence_new}).");
                return Ok(None);
            }
        }
        // Read the directory's blocks.
        let mut block_numbers = base_blocks;
        if let Some(extended) = inode_to_extended.get(&inode) {
            for &block in extended {
                if !block_numbers.contains(&block) {
                    block_numbers.push(block);
                }
            }
        }
        let mut blocks = Vec::with_capacity(block_numbers.len());
        for &block in &block_numbers {
            blocks.push(self.read_directory_block(block)?);
        }
        let directory = Directory {
            path: path.clone(),
            inode,
            blocks,
        };
        let id = match replace {
            Some(id) => {
                *self.directory_mut(id) = directory;
                id
            }
            None => {
                let id = DirectoryId(self.directories.len());
                self.directories.push(directory);
                self.all_directories.insert(path.clone(), id);
                id
            }
        };
        match self.inode_to_directory.get(&inode) {
            Some(&other_id) if other_id != id => {
                let other_path = self.directory(other_id).path.clone();
                println!(
                    "Inode number {inode} is linked to both, \"{path}\" as well as \"{other_path}\"!"
                );
                println!("WARNING: Keeping \"{other_path}\".");
            }
            Some(_) => {}
            None => {
                self.inode_to_directory.insert(inode, id);
            }
        }
        Ok(Some(id))
    }

    /// Recursively walks the entries of the given directory.
    ///
    /// `ancestor_dtime` is the deletion time of the nearest ancestor with a
    /// valid one, or 0.
    fn walk_directory(
        &mut self,
        dir_id: DirectoryId,
        depth: u32,
        ancestor_dtime: u32,
        chain: &mut Vec<u32>,
        inode_to_extended: &HashMap<u32, Vec<u32>>,
    ) -> io::Result<()> {
        let parent_inode = self.directory(dir_id).inode;
        let parent_path = self.directory(dir_id).path.clone();
        let inode_count = self.image.inode_count;
        let block_count = self.directory(dir_id).blocks.len();
        for block_index in 0..block_count {
            let entries = self.directory(dir_id).blocks[block_index].entries.clone();
            for entry in entries {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                if entry.zero_inode || entry.filtered {
                    continue;
                }
                if entry.inode > inode_count {
                    continue;
                }
                // Recursion trusts the current inode's kind, never the
                // entry's file type hint: a reallocated entry can carry a
                // directory hint for an inode that is no longer one, and
                // following it would graft an unrelated directory's blocks
                // onto this name.
                let is_directory = self.inode(entry.inode)?.is_directory();
                let max_depth = if self.opts.depth == 0 {
                    TREE_DEPTH
                } else {
                    self.opts.depth
                };
                if !is_directory || depth >= max_depth {
                    continue;
                }
                let child_path = if parent_path.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{parent_path}/{}", entry.name)
                };
                if chain.contains(&entry.inode) {
                    println!("Detected loop for inode {} ({child_path}).", entry.inode);
                    continue;
                }
                let child_inode = self.inode(entry.inode)?;
                let base_blocks;
                if !entry.deleted && entry.allocated && !entry.reallocated {
                    // An existing directory: its own block list is
                    // authoritative.
                    let (blocks, corrupted) = self.data_blocks_of(&child_inode)?;
                    if corrupted {
                        eprintln!(
                            "WARNING: directory inode {} has reused or corrupted (double/triple) indirect blocks.",
                            entry.inode
                        );
                    }
                    if blocks.is_empty() {
                        println!("Cannot find a directory block for inode {}.", entry.inode);
                        continue;
                    }
                    base_blocks = blocks;
                } else {
                    // A deleted directory: only the recovered start block is
                    // known, which is enough to construct the tree.
                    let Some(first_block) = self.dir_inode_to_block(entry.inode) else {
                        println!("Cannot find a directory block for inode {}.", entry.inode);
                        continue;
                    };
                    // `rm -rf` can stamp a parent as deleted up to a minute
                    // before its children; anything beyond that skew means
                    // the link is stale.
                    if ancestor_dtime != 0
                        && child_inode.has_valid_dtime(inode_count)
                        && ancestor_dtime + self.opts.dtime_skew < child_inode.dtime
                    {
                        continue;
                    }
                    // Verify that the block still links back to the parent.
                    let first = self.read_directory_block(first_block)?;
                    let links_back = first.entries.len() >= 2
                        && first.entries[0].name == "."
                        && first.entries[1].name == ".."
                        && first.entries[1].inode == parent_inode;
                    if !links_back {
                        println!("The directory \"{child_path}\" is lost.");
                        continue;
                    }
                    base_blocks = vec![first_block];
                }
                let Some(child_id) = self.insert_directory(
                    child_path,
                    entry.inode,
                    base_blocks,
                    inode_to_extended,
                )?
                else {
                    continue;
                };
                let child_dtime = if child_inode.has_valid_dtime(inode_count) {
                    child_inode.dtime
                } else {
                    ancestor_dtime
                };
                chain.push(entry.inode);
                self.walk_directory(child_id, depth + 1, child_dtime, chain, inode_to_extended)?;
                chain.pop();
            }
        }
        Ok(())
    }

    /// Attaches extended blocks whose owner was never placed to lost+found.
    fn attach_leftovers_to_lost_plus_found(
        &mut self,
        inode_to_extended: &HashMap<u32, Vec<u32>>,
    ) -> io::Result<()> {
        let mut leftovers: Vec<(u32, &Vec<u32>)> = inode_to_extended
            .iter()
            .filter(|(inode, _)| !self.inode_to_directory.contains_key(inode))
            .map(|(&inode, blocks)| (inode, blocks))
            .collect();
        if leftovers.is_empty() {
            return Ok(());
        }
        leftovers.sort_by_key(|&(inode, _)| inode);
        let Some(&lost_id) = self.all_directories.get("lost+found") else {
            eprintln!(
                "WARNING: there is no lost+found directory to attach unattributed extended blocks to."
            );
            return Ok(());
        };
        let leftovers: Vec<(u32, Vec<u32>)> = leftovers
            .into_iter()
            .map(|(inode, blocks)| (inode, blocks.clone()))
            .collect();
        for (inode, blocks) in leftovers {
            print!("WARNING: Can't link block");
            if blocks.len() > 1 {
                print!("s");
            }
            for block in &blocks {
                print!(" {block}");
            }
            println!(
                " to inode {inode} because that inode cannot be found in the inode_to_directory map. Linking it to lost+found instead!"
            );
            for block in blocks {
                let decoded = self.read_directory_block(block)?;
                self.directory_mut(lost_id).blocks.push(decoded);
            }
        }
        Ok(())
    }

    /// Writes the stage 2 cache.
    fn write_stage2_cache(&mut self) -> io::Result<()> {
        let cache_path = self.stage2_cache_path();
        println!(
            "Writing analysis so far to '{}'. Delete that file if you want to do this stage again.",
            cache_path.display()
        );
        let mut by_inode: Vec<(u32, DirectoryId)> = self
            .inode_to_directory
            .iter()
            .map(|(&inode, &id)| (inode, id))
            .collect();
        by_inode.sort_by_key(|&(inode, _)| inode);
        let mut out = BufWriter::new(File::create(&cache_path)?);
        writeln!(out, "# Stage 2 data for {}.", self.image.path.display())?;
        writeln!(out, "# Inodes path and directory blocks.")?;
        writeln!(out, "# INODE PATH BLOCK [BLOCK ...]")?;
        for (inode, id) in by_inode {
            let directory = self.directory(id);
            if directory.inode != inode {
                eprintln!(
                    "ERROR: inode_to_directory entry with inode number {inode} points to a directory with inode number {} (path \"{}\").",
                    directory.inode, directory.path
                );
                continue;
            }
            write!(out, "{inode} '{}'", directory.path)?;
            for block in &directory.blocks {
                write!(out, " {}", block.block)?;
            }
            writeln!(out)?;
        }
        out.write_all(cache::END_MARKER)?;
        out.flush()
    }

    /// Loads the stage 2 cache, reconstructing the directory graph from the
    /// recorded paths and block numbers.
    fn load_stage2_cache(&mut self) -> io::Result<()> {
        let cache_path = self.stage2_cache_path();
        print!("Loading {}...", cache_path.display());
        io::stdout().flush()?;
        for line in cache::read_lines(&cache_path)? {
            let parsed = parse_stage2_line(&line);
            let Some((inode, path, block_numbers)) = parsed else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: malformed cache line: {line}", cache_path.display()),
                ));
            };
            if inode == 0 || inode > self.image.inode_count {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: inode out of range: {line}", cache_path.display()),
                ));
            }
            let mut blocks = Vec::with_capacity(block_numbers.len());
            for &block in &block_numbers {
                blocks.push(self.read_directory_block(block)?);
            }
            let id = DirectoryId(self.directories.len());
            self.directories.push(Directory {
                path: path.clone(),
                inode,
                blocks,
            });
            self.all_directories.insert(path, id);
            self.inode_to_directory.insert(inode, id);
            self.dir_index[inode as usize] = BlockList::from_vec(block_numbers);
        }
        println!(" done");
        Ok(())
    }

    /// Orders the blocks of a directory by descending journal sequence.
    ///
    /// Journal blocks without a governing descriptor are disregarded with a
    /// warning. Returns (sequence, block index) pairs.
    fn blocks_by_recency(&mut self, dir_id: DirectoryId) -> Vec<(u32, usize)> {
        let directory = self.directory(dir_id);
        let inode = directory.inode;
        let block_numbers: Vec<u32> = directory.blocks.iter().map(|block| block.block).collect();
        let mut with_sequence = Vec::with_capacity(block_numbers.len());
        for (index, &block) in block_numbers.iter().enumerate() {
            if self.journal.is_journal(block) {
                match self.journal.governing_sequence(block) {
                    Some(sequence) => with_sequence.push((sequence, index)),
                    None => {
                        eprintln!(
                            "WARNING: Disregarding directory block {block} from the journal, that appears to belong to a directory with inode number {inode}, because it doesn't have a descriptor block (the start of the transaction was probably overwritten)."
                        );
                    }
                }
            } else {
                // The newest tag for the block, if the journal has one.
                with_sequence.push((self.journal.largest_sequence_for(block), index));
            }
        }
        with_sequence.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        with_sequence
    }

    /// Maps every non-directory file to a single inode, preferring the
    /// newest directory block that names it.
    pub fn init_files(&mut self) -> io::Result<()> {
        if self.files_done {
            return Ok(());
        }
        self.init_directories()?;
        let ids: Vec<DirectoryId> = self.all_directories.values().copied().collect();
        for dir_id in ids {
            let ordered = self.blocks_by_recency(dir_id);
            let directory = self.directory(dir_id);
            let dir_path = directory.path.clone();
            let mut seen: HashSet<String> = HashSet::new();
            let mut found: Vec<(String, u32)> = Vec::new();
            for &(_, block_index) in &ordered {
                for entry in &directory.blocks[block_index].entries {
                    if entry.zero_inode || entry.reallocated || entry.file_type == FT_DIR {
                        continue;
                    }
                    if seen.insert(entry.name.clone()) {
                        found.push((entry.name.clone(), entry.inode));
                    }
                }
            }
            for (name, inode) in found {
                let full_path = if dir_path.is_empty() {
                    name
                } else {
                    format!("{dir_path}/{name}")
                };
                self.path_to_inode.insert(full_path, inode);
            }
        }
        self.files_done = true;
        Ok(())
    }

    /// Prints the inode/dirblock evidence table of one directory: rows are
    /// filenames, columns are the directory's blocks ordered by descending
    /// journal sequence, cells are inode numbers.
    pub fn print_inode_dirblock_table(&mut self, path: &str) -> io::Result<()> {
        self.init_directories()?;
        let Some(&dir_id) = self.all_directories.get(path) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("--inode-dirblock-table: No such directory: {path}"),
            ));
        };
        let ordered = self.blocks_by_recency(dir_id);
        let directory = self.directory(dir_id);
        // Collect the distinct filenames, keeping the block order.
        let mut filenames: Vec<String> = Vec::new();
        for &(_, block_index) in &ordered {
            for entry in &directory.blocks[block_index].entries {
                if entry.zero_inode || entry.reallocated || entry.file_type == FT_DIR {
                    continue;
                }
                if !filenames.contains(&entry.name) {
                    filenames.push(entry.name.clone());
                }
            }
        }
        let width = filenames
            .iter()
            .map(|name| name.len())
            .max()
            .unwrap_or(0)
            .max(19);
        println!("Possible inodes for files in \"{path}\":");
        print!("{:>width$}", "Directory block nr:");
        for &(_, block_index) in &ordered {
            print!(" |{:>7}", directory.blocks[block_index].block);
        }
        println!();
        print!("{:>width$}", "Last tag sequence: ");
        for &(sequence, _) in &ordered {
            print!(" |{sequence:>7}");
        }
        println!();
        print!("{}", "-".repeat(width));
        for _ in &ordered {
            print!("-+-------");
        }
        println!();
        for name in &filenames {
            print!("{name:<width$}");
            for &(_, block_index) in &ordered {
                let inode = directory.blocks[block_index]
                    .entries
                    .iter()
                    .find(|entry| {
                        !entry.zero_inode
                            && !entry.reallocated
                            && entry.file_type != FT_DIR
                            && entry.name == *name
                    })
                    .map(|entry| entry.inode)
                    .unwrap_or(0);
                if inode == 0 {
                    print!(" |       ");
                } else {
                    print!(" |{inode:>7}");
                }
            }
            println!();
        }
        Ok(())
    }

    /// Returns every recovered path, directories and files, sorted.
    pub fn all_paths(&mut self) -> io::Result<Vec<String>> {
        self.init_files()?;
        let mut paths: Vec<String> = self
            .all_directories
            .keys()
            .filter(|path| !path.is_empty())
            .cloned()
            .collect();
        paths.extend(self.path_to_inode.keys().cloned());
        paths.sort();
        paths.dedup();
        Ok(paths)
    }
}

/// Parses one `INODE 'PATH' BLOCK [BLOCK ...]` cache line.
fn parse_stage2_line(line: &str) -> Option<(u32, String, Vec<u32>)> {
    let (inode_part, rest) = line.split_once(' ')?;
    let inode: u32 = inode_part.trim().parse().ok()?;
    let rest = rest.trim_start();
    if !rest.starts_with('\'') {
        return None;
    }
    let close = rest.rfind('\'')?;
    if close == 0 {
        return None;
    }
    let path = rest[1..close].to_owned();
    let mut blocks = Vec::new();
    for word in rest[close + 1..].split_whitespace() {
        blocks.push(word.parse().ok()?);
    }
    if blocks.is_empty() {
        return None;
    }
    Some((inode, path, blocks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage2_line_parsing() {
        assert_eq!(
            parse_stage2_line("2 '' 22"),
            Some((2, String::new(), vec![22]))
        );
        assert_eq!(
            parse_stage2_line("12 'a/b c' 7 9"),
            Some((12, "a/b c".to_owned(), vec![7, 9]))
        );
        // A path containing a quote: the last quote wins.
        assert_eq!(
            parse_stage2_line("5 'it's here' 3"),
            Some((5, "it's here".to_owned(), vec![3]))
        );
        assert_eq!(parse_stage2_line("5 'missing blocks'"), None);
        assert_eq!(parse_stage2_line("garbage"), None);
    }
}

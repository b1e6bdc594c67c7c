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

//! Raw searches over the image: blocks by content, inodes by referenced
//! block, zeroed-out inode slots.

use crate::analyzer::Analyzer;
use crate::indirect::DIRECT_BIT;
use std::io;
use std::io::Write;

impl Analyzer {
    /// Prints every data block whose contents contain (or, with
    /// `start_only`, start with) the given pattern.
    ///
    /// Inode table blocks are skipped. `--allocated` / `--unallocated`
    /// restrict the search; giving both cancels the restriction.
    pub fn search_blocks(&mut self, pattern: &[u8], start_only: bool) -> io::Result<()> {
        if pattern.is_empty() || pattern.len() > self.image.block_size as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "the search pattern must fit in one block",
            ));
        }
        let mut allocated_only = self.opts.allocated;
        let mut unallocated_only = self.opts.unallocated;
        if allocated_only && unallocated_only {
            allocated_only = false;
            unallocated_only = false;
        }
        if allocated_only {
            print!("Allocated blocks ");
        } else if unallocated_only {
            print!("Unallocated blocks ");
        } else {
            print!("Blocks ");
        }
        println!(
            "{} \"{}\":",
            if start_only { "starting with" } else { "containing" },
            String::from_utf8_lossy(pattern)
        );
        let mut buf = vec![0u8; self.image.block_size as usize];
        for group in 0..self.image.group_count {
            if let Some(wanted) = self.opts.group {
                if group != wanted {
                    continue;
                }
            }
            let group_start = self.image.group_to_block(group);
            let last_block =
                (group_start + self.image.blocks_per_group).min(self.image.block_count);
            // Skip the inode table; inodes are not data.
            let table = self.image.groups[group as usize].inode_table_start_addr;
            let first_block = table + self.image.sb.inode_blocks_per_group();
            for block in first_block..last_block {
                let allocated = self.is_allocated_block(block)?;
                if allocated_only && !allocated {
                    continue;
                }
                if unallocated_only && allocated {
                    continue;
                }
                self.image.read_block(block, &mut buf)?;
                let found = if start_only {
                    buf.starts_with(pattern)
                } else {
                    buf.windows(pattern.len()).any(|window| window == pattern)
                };
                if found {
                    if !allocated_only && allocated {
                        print!(" {block} (allocated)");
                    } else {
                        print!(" {block}");
                    }
                    io::stdout().flush()?;
                }
            }
        }
        println!();
        Ok(())
    }

    /// Prints every inode whose block list refers to the given block.
    pub fn search_inode_refs(&mut self, block: u32) -> io::Result<()> {
        print!("Inodes refering to block {block}:");
        io::stdout().flush()?;
        for inode_number in 1..=self.image.inode_count {
            let inode = self.inode(inode_number)?;
            if inode.is_symlink() {
                // No blocks of its own and no indirection to walk.
                continue;
            }
            let mut found = false;
            let corrupted = self.for_each_block_of(&inode, DIRECT_BIT, false, &mut |b, _| {
                if b == block {
                    found = true;
                }
            })?;
            if corrupted {
                println!();
                println!(
                    "WARNING: while iterating over all blocks of inode {inode_number} a reused or corrupt indirect block was encountered; search aborted."
                );
                print!("Inodes refering to block {block} (cont):");
            }
            if found {
                print!(" {inode_number}");
                io::stdout().flush()?;
            }
        }
        println!();
        Ok(())
    }

    /// Prints every allocated inode whose table slot is completely zeroed.
    pub fn search_zeroed_inodes(&mut self) -> io::Result<()> {
        print!("Allocated inodes filled with zeroes:");
        io::stdout().flush()?;
        for inode_number in 1..=self.image.inode_count {
            if let Some(group) = self.opts.group {
                if self.image.inode_to_group(inode_number) != group {
                    continue;
                }
            }
            if !self.is_allocated_inode(inode_number)? {
                continue;
            }
            let inode = self.inode(inode_number)?;
            if crate::util::reinterpret(&inode).iter().all(|&b| b == 0) {
                print!(" {inode_number}");
                io::stdout().flush()?;
            }
        }
        println!();
        Ok(())
    }

    /// Prints the block and the intra-block offset holding the given inode.
    pub fn print_inode_to_block(&self, inode: u32) {
        let block = self.image.inode_to_block(inode);
        let offset = (inode - self.image.block_to_inode(block)) * self.image.inode_size;
        println!("Inode {inode} resides in block {block} at offset {offset:#x}.");
    }
}

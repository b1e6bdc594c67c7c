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

//! Human-readable reports: superblock, group descriptors, inodes, directory
//! blocks and journal records.

use crate::analyzer::Analyzer;
use crate::blockdetect::DirectoryBlockStats;
use crate::blockdetect::IsDirectory;
use crate::ext3::Inode;
use crate::jbd;
use crate::jbd::BlockTag;
use crate::jbd::JournalHeader;
use crate::jbd::RevokeHeader;
use crate::journal::DescriptorKind;
use crate::util::ctime;
use crate::util::from_bytes;
use std::fmt;
use std::io;
use std::mem::size_of;
use uuid::Uuid;

/// Renders an inode mode the way `ls -l` does.
pub struct FileMode(pub u16);

impl fmt::Display for FileMode {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = self.0;
        let kind = match mode & 0xf000 {
            0x1000 => 'p',
            0x2000 => 'c',
            0x4000 => 'd',
            0x6000 => 'b',
            0x8000 => '-',
            0xa000 => 'l',
            0xc000 => 's',
            _ => '?',
        };
        fmt.write_fmt(format_args!("{kind}"))?;
        for shift in [6u16, 3, 0] {
            let bits = (mode >> shift) & 7;
            let special = match shift {
                6 => mode & 0o4000 != 0, // setuid
                3 => mode & 0o2000 != 0, // setgid
                _ => mode & 0o1000 != 0, // sticky
            };
            let r = if bits & 4 != 0 { 'r' } else { '-' };
            let w = if bits & 2 != 0 { 'w' } else { '-' };
            let x = match (bits & 1 != 0, special, shift) {
                (true, false, _) => 'x',
                (false, false, _) => '-',
                (true, true, 0) => 't',
                (false, true, 0) => 'T',
                (true, true, _) => 's',
                (false, true, _) => 'S',
            };
            fmt.write_fmt(format_args!("{r}{w}{x}"))?;
        }
        Ok(())
    }
}

/// Returns the name of the kind encoded in an inode mode.
pub fn mode_string(mode: u16) -> &'static str {
    match mode & 0xf000 {
        0x1000 => "FIFO",
        0x2000 => "character device",
        0x4000 => "directory",
        0x6000 => "block device",
        0x8000 => "regular file",
        0xa000 => "symbolic link",
        0xc000 => "socket",
        _ => "unknown object",
    }
}

/// Returns the character standing for a directory entry file type.
fn file_type_char(file_type: u8) -> char {
    match file_type & 7 {
        crate::ext3::FT_REG_FILE => 'r',
        crate::ext3::FT_DIR => 'd',
        crate::ext3::FT_CHRDEV => 'c',
        crate::ext3::FT_BLKDEV => 'b',
        crate::ext3::FT_FIFO => 'p',
        crate::ext3::FT_SOCK => 's',
        crate::ext3::FT_SYMLINK => 'l',
        _ => '?',
    }
}

impl Analyzer {
    /// Prints the contents of the superblock.
    pub fn print_superblock(&self) {
        let sb = &self.image.sb;
        let total_inodes = sb.total_inodes;
        let total_blocks = sb.total_blocks;
        let superuser_blocks = sb.superuser_blocks;
        let free_blocks = sb.total_unallocated_blocks;
        let free_inodes = sb.total_unallocated_inodes;
        let first_data_block = sb.superblock_block_number;
        let blocks_per_group = sb.blocks_per_group;
        let inodes_per_group = sb.inodes_per_group;
        let last_mount = sb.last_mount_timestamp;
        let last_write = sb.last_write_timestamp;
        let mount_count = sb.mount_count_since_fsck;
        let max_mount_count = sb.mount_count_before_fsck;
        let state = sb.fs_state;
        let errors = sb.error_action;
        let last_fsck = sb.last_fsck_timestamp;
        let major = sb.major_version;
        let minor = sb.minor_version;
        let first_inode = sb.first_inode();
        let inode_size = sb.inode_size();
        let optional = sb.optional_features;
        let required = sb.required_features;
        let ro_required = sb.write_required_features;
        let journal_inode = sb.journal_inode;
        let orphan_head = sb.orphan_inode_head;
        println!("Inodes count: {total_inodes}");
        println!("Blocks count: {total_blocks}");
        println!("Reserved blocks count: {superuser_blocks}");
        println!("Free blocks count: {free_blocks}");
        println!("Free inodes count: {free_inodes}");
        println!("First data block: {first_data_block}");
        println!("Block size: {}", self.image.block_size);
        println!("Fragment size: {}", sb.fragment_size());
        println!("Blocks per group: {blocks_per_group}");
        println!("Inodes per group: {inodes_per_group}");
        println!("Number of groups: {}", self.image.group_count);
        println!("Last mount time: {last_mount} = {}", ctime(last_mount));
        println!("Last write time: {last_write} = {}", ctime(last_write));
        println!("Mount count: {mount_count} (maximum {max_mount_count})");
        println!("Filesystem state: {state}");
        println!("Error behaviour: {errors}");
        println!("Last check time: {last_fsck} = {}", ctime(last_fsck));
        println!("Revision: {major}.{minor}");
        println!("First non-reserved inode: {first_inode}");
        println!("Inode size: {inode_size}");
        println!("Compatible features: {optional:#x}");
        println!("Incompatible features: {required:#x}");
        println!("Read-only compatible features: {ro_required:#x}");
        println!("UUID: {}", Uuid::from_bytes(sb.filesystem_id));
        let volume_name_bytes = sb.volume_name;
        let volume_name: String = volume_name_bytes
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        println!("Volume name: \"{volume_name}\"");
        println!("Journal inode: {journal_inode}");
        println!("First orphan inode: {orphan_head}");
    }

    /// Prints the contents of the journal superblock.
    pub fn print_journal_superblock(&self) {
        let Some(jsb) = self.journal.sb.as_ref() else {
            return;
        };
        println!("Journal Super Block:");
        println!();
        let header = jsb.s_header;
        println!("Signature: {:#x}", header.magic());
        println!("Block size: {}", jsb.blocksize());
        println!("Number of journal blocks: {}", jsb.maxlen());
        println!("First block of log: {}", jsb.first());
        println!("First commit expected: {}", jsb.sequence());
        println!("Start of log: {}", jsb.start());
        println!("UUID: {}", Uuid::from_bytes(jsb.s_uuid));
    }

    /// Prints the group descriptor of the given group.
    pub fn print_group_descriptor(&self, group: u32) {
        let desc = &self.image.groups[group as usize];
        let block_bitmap = desc.block_usage_bitmap_addr;
        let inode_bitmap = desc.inode_usage_bitmap_addr;
        let inode_table = desc.inode_table_start_addr;
        let free_blocks = desc.unallocated_blocks_number;
        let free_inodes = desc.unallocated_inodes_number;
        let directories = desc.directories_number;
        println!(
            " Group\t{group}: block bitmap at {block_bitmap}, inode bitmap at {inode_bitmap}, inode table at {inode_table}"
        );
        println!(
            "\t   {free_blocks} free blocks, {free_inodes} free inodes, {directories} used directories"
        );
    }

    /// Prints the decoded fields of an inode.
    pub fn print_inode(&mut self, inode: &Inode) -> io::Result<()> {
        let generation = inode.generation;
        let uid = inode.uid();
        let gid = inode.gid();
        let links = inode.hard_links_count;
        let sectors = inode.used_sectors;
        let flags = inode.flags;
        let mode = inode.mode;
        println!("Generation: {generation}");
        println!("uid / gid: {uid} / {gid}");
        println!("mode: {} ({mode:#o})", FileMode(mode));
        println!("size: {}", inode.size());
        println!("num of links: {links}");
        println!("sectors: {sectors}");
        println!("flags: {flags:#x}");
        println!();
        let inode_count = self.image.inode_count;
        let atime = inode.atime;
        if atime != 0 {
            println!("Inode Times:");
            println!("Accessed:       {atime} = {}", ctime(atime));
            let ctime_field = inode.ctime;
            let mtime = inode.mtime;
            println!("File Modified:  {mtime} = {}", ctime(mtime));
            println!("Inode Modified: {ctime_field} = {}", ctime(ctime_field));
            let dtime = inode.dtime;
            if inode.is_orphan(inode_count) {
                println!("Next orphan inode: {dtime}");
            } else if dtime != 0 {
                println!("Deleted:        {dtime} = {}", ctime(dtime));
            }
        }
        if inode.is_symlink() && inode.used_sectors == 0 {
            let target = self.symlink_target(inode)?;
            println!(
                "Symbolic link target: {}",
                String::from_utf8_lossy(&target)
            );
        } else {
            print!("Direct Blocks:");
            for i in 0..crate::ext3::DIRECT_BLOCKS {
                let block = inode.block(i);
                if block != 0 {
                    print!(" {block}");
                }
            }
            println!();
            let ind = inode.block(crate::ext3::IND_BLOCK);
            if ind != 0 {
                println!("Indirect Block: {ind}");
            }
            let dind = inode.block(crate::ext3::DIND_BLOCK);
            if dind != 0 {
                println!("Double Indirect Block: {dind}");
            }
            let tind = inode.block(crate::ext3::TIND_BLOCK);
            if tind != 0 {
                println!("Triple Indirect Block: {tind}");
            }
        }
        Ok(())
    }

    /// Prints the report for `--inode N`.
    pub fn print_inode_report(&mut self, inode_number: u32) -> io::Result<()> {
        let allocated = self.is_allocated_inode(inode_number)?;
        if allocated {
            println!("Inode is Allocated");
        } else {
            println!("Inode is Unallocated");
        }
        println!("Group: {}", self.image.inode_to_group(inode_number));
        let inode = self.inode(inode_number)?;
        self.print_inode(&inode)?;
        if inode.is_directory() {
            // Show what we recovered for this directory.
            self.init_dir_index()?;
            if let Some(block) = self.dir_inode_to_block(inode_number) {
                println!();
                println!("Directory start block: {block}");
                self.print_directory_block(block)?;
            }
        }
        Ok(())
    }

    /// Prints a listing of the entries of a directory block.
    pub fn print_directory_block(&mut self, block: u32) -> io::Result<()> {
        let decoded = self.read_directory_block(block)?;
        let inode_count = self.image.inode_count;
        println!("          .-- File type in dir_entry (r=regular file, d=directory, l=symlink)");
        println!("          |          .-- D: Deleted ; R: Reallocated");
        println!("Indx Next |  Inode   | Deletion time                        Mode        File name");
        println!("==========+==========+{}", "=".repeat(58));
        for entry in &decoded.entries {
            if entry.filtered {
                continue;
            }
            let type_char = if self.image.has_filetype {
                file_type_char(entry.file_type)
            } else if !entry.zero_inode && entry.inode <= inode_count {
                file_type_char(kind_to_file_type(self.inode(entry.inode)?.kind()))
            } else {
                '?'
            };
            let mut flags = String::new();
            if entry.deleted {
                flags.push('D');
            }
            if entry.reallocated {
                flags.push('R');
            }
            let (dtime_str, mode_str) = if !entry.zero_inode && entry.inode <= inode_count {
                let inode = self.inode(entry.inode)?;
                let dtime = inode.dtime;
                let dtime_str = if inode.has_valid_dtime(inode_count) {
                    format!("{dtime} = {}", ctime(dtime))
                } else {
                    String::new()
                };
                (dtime_str, format!("{}", FileMode(inode.mode)))
            } else {
                (String::new(), String::new())
            };
            println!(
                "{:>4} {:>4} {type_char} {:>8} {flags:>2} {dtime_str:<36} {mode_str:<11} {}",
                entry.index.cur, entry.index.next, entry.inode, entry.name
            );
        }
        Ok(())
    }

    /// Prints the report for `--block N`.
    ///
    /// `print_detail` decodes the inodes of inode table blocks; `ls` forces
    /// a directory listing even when detection rejected the block.
    pub fn print_block_report(&mut self, block: u32, print_detail: bool, ls: bool) -> io::Result<()> {
        let group = self.image.block_to_group(block);
        println!("Group: {group}");
        let buf = self.image.read_block_vec(block)?;
        let mut stats = DirectoryBlockStats::default();
        let verdict = self.is_directory_block(&buf, block, &mut stats, false, true, 0);
        match verdict {
            IsDirectory::Start => {
                println!("Block {block} is a directory start block.");
                self.print_directory_block(block)?;
                return Ok(());
            }
            IsDirectory::Extended => {
                println!("Block {block} is an extended directory block.");
                self.print_directory_block(block)?;
                return Ok(());
            }
            IsDirectory::No => {}
        }
        if ls {
            // The user wants to examine the block as a directory anyway;
            // list whatever entries can be salvaged.
            self.print_directory_block(block)?;
        }
        let allocated = self.is_allocated_block(block)?;
        if !allocated {
            println!("Block {block} is Unallocated.");
            return Ok(());
        }
        if self.journal.is_journal(block) {
            println!("Block {block} belongs to the journal.");
            let header: JournalHeader = from_bytes(&buf).unwrap();
            if header.magic() == jbd::JBD_MAGIC {
                println!();
                self.print_journal_metadata_block(block, &buf, &header);
            } else {
                let real_block = self.journal_block_contains_inodes(block);
                if real_block != 0 {
                    println!("It contains a copy of inode table block {real_block}.");
                    if print_detail {
                        self.print_inode_table_block(&buf, real_block)?;
                    }
                }
            }
            return Ok(());
        }
        println!("Block {block} is Allocated.");
        if self.image.is_inode(block) {
            let inode = self.image.block_to_inode(block);
            println!(
                "It's inside the inode table of group {group} (inodes [{inode} - {}>).",
                inode + self.image.inodes_per_block()
            );
            if print_detail {
                self.print_inode_table_block(&buf, block)?;
            }
        }
        Ok(())
    }

    /// Prints every inode stored in a raw inode table block.
    fn print_inode_table_block(&mut self, buf: &[u8], table_block: u32) -> io::Result<()> {
        let first_inode = self.image.block_to_inode(table_block);
        for index in 0..self.image.inodes_per_block() {
            let inode = self.image.inode_from_block(buf, index);
            println!();
            println!("--------------Inode {}-----------------------", first_inode + index);
            self.print_inode(&inode)?;
        }
        Ok(())
    }

    /// Decodes a journal metadata block: descriptor, commit, revoke or
    /// journal superblock.
    fn print_journal_metadata_block(&self, block: u32, buf: &[u8], header: &JournalHeader) {
        let sequence = header.sequence();
        match header.blocktype() {
            jbd::DESCRIPTOR_BLOCK => {
                println!("Descriptor block (sequence {sequence}):");
                let mut offset = size_of::<JournalHeader>();
                let mut current = block;
                loop {
                    let Some(tag) = from_bytes::<BlockTag>(&buf[offset.min(buf.len())..]) else {
                        break;
                    };
                    let flags = tag.flags();
                    current += 1;
                    while self.journal.is_indirect(current) {
                        current += 1;
                    }
                    let escaped = if flags & jbd::FLAG_ESCAPE != 0 {
                        "(escaped)"
                    } else {
                        ""
                    };
                    let deleted = if flags & jbd::FLAG_DELETED != 0 {
                        "(deleted)"
                    } else {
                        ""
                    };
                    println!("  {current}{escaped} = {}{deleted}", tag.blocknr());
                    if flags & jbd::FLAG_LAST_TAG != 0 {
                        break;
                    }
                    offset += size_of::<BlockTag>();
                    if flags & jbd::FLAG_SAME_UUID == 0 {
                        offset += jbd::TAG_UUID_SIZE;
                    }
                }
            }
            jbd::COMMIT_BLOCK => {
                println!("Commit block (sequence {sequence}).");
            }
            jbd::REVOKE_BLOCK => {
                let revoke: RevokeHeader = from_bytes(buf).unwrap();
                let count = revoke.count();
                print!("Revoke block (sequence {sequence}):");
                if count >= size_of::<RevokeHeader>() as i32 && count as usize <= buf.len() {
                    for chunk in buf[size_of::<RevokeHeader>()..count as usize].chunks_exact(4) {
                        print!(" {}", u32::from_be_bytes(chunk.try_into().unwrap()));
                    }
                }
                println!();
            }
            jbd::SUPERBLOCK_V1 | jbd::SUPERBLOCK_V2 => {
                self.print_journal_superblock();
            }
            blocktype => {
                println!("Unknown journal blocktype {blocktype}.");
            }
        }
    }

    /// Prints the journal descriptors referencing the given filesystem
    /// block (`--journal --block N`).
    pub fn print_block_descriptors(&self, block: u32) {
        let Some(list) = self.journal.block_to_descriptors.get(&block) else {
            println!("There are no descriptors in the journal referencing block {block}.");
            return;
        };
        println!("Journal descriptors referencing block {block}:");
        for &index in list {
            let descriptor = &self.journal.descriptors[index];
            println!("{} {}", descriptor.sequence, descriptor.journal_block);
        }
    }

    /// Prints a transaction with its neighbours (`--journal-transaction S`).
    pub fn print_journal_transaction(&self, sequence: u32) {
        let transactions = &self.journal.transactions;
        match transactions.get(&sequence) {
            None => {
                println!(
                    "There is no transaction in the journal with sequence number {sequence}"
                );
                let min = self.journal.min_sequence;
                let max = self.journal.max_sequence;
                if sequence < min || sequence > max {
                    println!("The sequence numbers found are in the range [{min}, {max}].");
                }
                let prev = transactions.range(..sequence).next_back().map(|(&s, _)| s);
                let next = transactions
                    .range(sequence + 1..)
                    .next()
                    .map(|(&s, _)| s);
                match (prev, next) {
                    (Some(prev), Some(next)) => {
                        println!("Prev / Next sequences numbers: {prev} {next}")
                    }
                    (Some(prev), None) => println!("Prev sequence number: {prev}"),
                    (None, Some(next)) => println!("Next sequence number: {next}"),
                    (None, None) => {}
                }
            }
            Some(transaction) => {
                let prev = transactions.range(..sequence).next_back().map(|(&s, _)| s);
                let next = transactions
                    .range(sequence + 1..)
                    .next()
                    .map(|(&s, _)| s);
                match (prev, next) {
                    (Some(prev), Some(next)) => {
                        println!("Prev / Current / Next sequences numbers: {prev} {sequence} {next}")
                    }
                    (Some(prev), None) => {
                        println!("Prev / Current sequences numbers: {prev} {sequence}")
                    }
                    (None, Some(next)) => {
                        println!("Current / Next sequences numbers: {sequence} {next}")
                    }
                    (None, None) => println!("Sequence number: {sequence}"),
                }
                if !transaction.committed {
                    println!("Transaction was NOT COMMITTED!");
                }
                let mut last_kind = "";
                for &index in &transaction.descriptors {
                    let descriptor = &self.journal.descriptors[index];
                    match &descriptor.kind {
                        DescriptorKind::Tag(tag) => {
                            if last_kind != "TAG" {
                                if !last_kind.is_empty() {
                                    println!();
                                }
                                print!("TAG:");
                                last_kind = "TAG";
                            }
                            print!(" {}={}", descriptor.journal_block, tag.fs_block);
                            let mut decorations = Vec::new();
                            if tag.flags & jbd::FLAG_ESCAPE != 0 {
                                decorations.push("ESCAPED");
                            }
                            if tag.flags & jbd::FLAG_DELETED != 0 {
                                decorations.push("DELETED");
                            }
                            if !decorations.is_empty() {
                                print!("({})", decorations.join("|"));
                            }
                        }
                        DescriptorKind::Revoke(blocks) => {
                            if last_kind != "REVOKE" {
                                if !last_kind.is_empty() {
                                    println!();
                                }
                                print!("REVOKE:");
                                last_kind = "REVOKE";
                            }
                            for block in blocks {
                                print!(" {block}");
                            }
                        }
                        DescriptorKind::Commit => {
                            if !last_kind.is_empty() {
                                println!();
                            }
                            print!("COMMIT: {}", descriptor.journal_block);
                            last_kind = "COMMIT";
                        }
                    }
                }
                println!();
            }
        }
    }

    /// Prints every distinct journal copy of an inode
    /// (`--show-journal-inodes N`).
    pub fn show_journal_inodes(&mut self, inode_number: u32) -> io::Result<()> {
        let copies = self.copies_of_inode(inode_number)?;
        println!("Copies of inode {inode_number} found in the journal:");
        let mut last_mtime = u32::MAX;
        for (_, inode) in copies {
            if inode.mtime != last_mtime {
                last_mtime = inode.mtime;
                println!();
                println!("--------------Inode {inode_number}-----------------------");
                self.print_inode(&inode)?;
            }
        }
        Ok(())
    }

    /// Prints every inode reached by more than one recovered path
    /// (`--show-hardlinks`).
    pub fn show_hardlinks(&mut self) -> io::Result<()> {
        self.init_files()?;
        let mut by_inode: std::collections::BTreeMap<u32, Vec<String>> =
            std::collections::BTreeMap::new();
        for (path, &inode) in &self.path_to_inode {
            by_inode.entry(inode).or_default().push(path.clone());
        }
        for (inode, paths) in by_inode {
            if paths.len() < 2 {
                continue;
            }
            println!("Inode {inode}:");
            for path in paths {
                let parent = match path.rfind('/') {
                    Some(slash) => &path[..slash],
                    None => "",
                };
                let parent_inode = self
                    .all_directories
                    .get(parent)
                    .map(|&id| self.directory(id).inode);
                match parent_inode {
                    Some(parent_inode) => println!("  {path} ({parent_inode})"),
                    None => println!("  {path}"),
                }
            }
        }
        Ok(())
    }
}

/// Maps the kind bits of a mode onto a directory entry file type.
fn kind_to_file_type(kind: u16) -> u8 {
    match kind {
        0x1000 => crate::ext3::FT_FIFO,
        0x2000 => crate::ext3::FT_CHRDEV,
        0x4000 => crate::ext3::FT_DIR,
        0x6000 => crate::ext3::FT_BLKDEV,
        0x8000 => crate::ext3::FT_REG_FILE,
        0xa000 => crate::ext3::FT_SYMLINK,
        0xc000 => crate::ext3::FT_SOCK,
        _ => crate::ext3::FT_UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_modes() {
        assert_eq!(format!("{}", FileMode(0x8000 | 0o644)), "-rw-r--r--");
        assert_eq!(format!("{}", FileMode(0x4000 | 0o755)), "drwxr-xr-x");
        assert_eq!(format!("{}", FileMode(0xa000 | 0o777)), "lrwxrwxrwx");
        assert_eq!(format!("{}", FileMode(0x8000 | 0o4755)), "-rwsr-xr-x");
        assert_eq!(format!("{}", FileMode(0x4000 | 0o1777)), "drwxrwxrwt");
    }

    #[test]
    fn kind_names() {
        assert_eq!(mode_string(0x8000), "regular file");
        assert_eq!(mode_string(0x2000), "character device");
        assert_eq!(mode_string(0xa000), "symbolic link");
    }
}

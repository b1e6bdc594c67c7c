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

//! Journal analysis.
//!
//! The journal is a circular log stored inside a regular inode. Every
//! metadata block that was ever journaled still has copies in there until
//! the log wraps over them, which makes it the main source of evidence about
//! deleted directories and inodes.
//!
//! Initialization enumerates every descriptor, commit and revoke record,
//! sorts the descriptors by transaction sequence number and builds the
//! indices the other analyses query.

use crate::analyzer::Analyzer;
use crate::ext3::Inode;
use crate::image::Image;
use crate::indirect::DIRECT_BIT;
use crate::indirect::INDIRECT_BIT;
use crate::jbd;
use crate::jbd::BlockTag;
use crate::jbd::JournalHeader;
use crate::jbd::JournalSuperBlock;
use crate::jbd::RevokeHeader;
use crate::meta::bitmap_test;
use crate::util::ctime;
use crate::util::from_bytes;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::mem::size_of;

/// A descriptor tag: one filesystem block whose copy sits in the journal.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorTag {
    /// The filesystem block the copy belongs to.
    pub fs_block: u32,
    /// The tag flags (`jbd::FLAG_*`).
    pub flags: u32,
}

/// The payload of a journal record.
#[derive(Clone, Debug)]
pub enum DescriptorKind {
    /// A copy of a filesystem block.
    Tag(DescriptorTag),
    /// A list of filesystem blocks that must not be replayed.
    Revoke(Vec<u32>),
    /// A transaction terminator.
    Commit,
}

/// One journal record.
#[derive(Clone, Debug)]
pub struct Descriptor {
    /// For a tag, the journal block holding the copy; otherwise the journal
    /// block holding the record itself.
    pub journal_block: u32,
    /// The transaction sequence number.
    pub sequence: u32,
    /// The record payload.
    pub kind: DescriptorKind,
}

impl Descriptor {
    /// Returns the tag payload, if this record is a tag.
    pub fn tag(&self) -> Option<&DescriptorTag> {
        match &self.kind {
            DescriptorKind::Tag(tag) => Some(tag),
            _ => None,
        }
    }
}

/// A group of records sharing one sequence number.
pub struct Transaction {
    /// The journal block of the first record of the transaction.
    pub start_block: u32,
    /// The sequence number.
    pub sequence: u32,
    /// Whether a commit record terminates the transaction. An uncommitted
    /// trailing transaction is still valuable as metadata evidence.
    pub committed: bool,
    /// Indices into [`Journal::descriptors`].
    pub descriptors: Vec<usize>,
}

/// The journal indices.
#[derive(Default)]
pub struct Journal {
    /// The journal superblock, read from the first block of the journal
    /// inode.
    pub sb: Option<JournalSuperBlock>,
    /// The journal inode number.
    pub inum: u32,
    /// A copy of the journal inode.
    pub inode: Option<Inode>,
    /// The number of blocks in the journal file.
    pub maxlen: u32,
    /// The smallest filesystem block belonging to the journal.
    pub min_block: u32,
    /// One more than the largest filesystem block belonging to the journal.
    pub max_block: u32,
    /// Bitmap over `[min_block, max_block)` of blocks belonging to the
    /// journal.
    block_bitmap: Vec<u8>,
    /// Bitmap over the same range marking the journal inode's indirect
    /// blocks; their contents are block numbers, not copies.
    indirect_bitmap: Vec<u8>,
    /// All records, sorted by ascending sequence number.
    pub descriptors: Vec<Descriptor>,
    /// Transactions by sequence number.
    pub transactions: BTreeMap<u32, Transaction>,
    /// Filesystem block to the records tagging it, ordered by sequence.
    pub block_to_descriptors: HashMap<u32, Vec<usize>>,
    /// Journal block to the record governing it.
    pub block_in_journal_to_descriptor: HashMap<u32, usize>,
    /// Any block ever used by a directory to the most recently observed
    /// owning inode, from journal copies of inode table blocks.
    pub block_to_dir_inode: HashMap<u32, u32>,
    /// The sequence of the transaction cut short by log wrap-around, or 0.
    pub wrapped_sequence: u32,
    /// The smallest sequence number seen.
    pub min_sequence: u32,
    /// The largest sequence number seen.
    pub max_sequence: u32,
}

impl Journal {
    /// Tells whether the given filesystem block lies in the journal's block
    /// range.
    pub fn contains(&self, block: u32) -> bool {
        block >= self.min_block && block < self.max_block
    }

    /// Tells whether the given filesystem block belongs to the journal.
    pub fn is_journal(&self, block: u32) -> bool {
        self.contains(block) && bitmap_test(&self.block_bitmap, block - self.min_block)
    }

    /// Tells whether the given filesystem block is one of the journal
    /// inode's indirect blocks.
    pub fn is_indirect(&self, block: u32) -> bool {
        self.contains(block) && bitmap_test(&self.indirect_bitmap, block - self.min_block)
    }

    /// Returns the highest sequence number among tags naming the given
    /// filesystem block, or 0.
    pub fn largest_sequence_for(&self, block: u32) -> u32 {
        self.block_to_descriptors
            .get(&block)
            .and_then(|list| list.last())
            .map(|&i| self.descriptors[i].sequence)
            .unwrap_or(0)
    }

    /// Returns the sequence number of the record governing the given journal
    /// block, if it has one.
    pub fn governing_sequence(&self, journal_block: u32) -> Option<u32> {
        self.block_in_journal_to_descriptor
            .get(&journal_block)
            .map(|&i| self.descriptors[i].sequence)
    }
}

/// Maps a block number relative to the journal file onto a filesystem block,
/// through the journal inode's block tree.
fn journal_block_to_real_block(image: &mut Image, jinode: &Inode, jbn: u32) -> io::Result<u32> {
    let vpb = image.block_size / 4; // values per block
    let entry_of = |buf: &[u8], i: u32| {
        u32::from_le_bytes(buf[i as usize * 4..i as usize * 4 + 4].try_into().unwrap())
    };
    if jbn < 12 {
        return Ok(jinode.block(jbn as usize));
    }
    let jbn = jbn - 12;
    if jbn < vpb {
        let buf = image.read_block_vec(jinode.block(crate::ext3::IND_BLOCK))?;
        return Ok(entry_of(&buf, jbn));
    }
    let jbn = jbn - vpb;
    if jbn < vpb * vpb {
        let buf = image.read_block_vec(jinode.block(crate::ext3::DIND_BLOCK))?;
        let ind = entry_of(&buf, jbn / vpb);
        let buf = image.read_block_vec(ind)?;
        return Ok(entry_of(&buf, jbn % vpb));
    }
    let jbn = jbn - vpb * vpb;
    let buf = image.read_block_vec(jinode.block(crate::ext3::TIND_BLOCK))?;
    let dind = entry_of(&buf, jbn / (vpb * vpb));
    let buf = image.read_block_vec(dind)?;
    let ind = entry_of(&buf, (jbn / vpb) % vpb);
    let buf = image.read_block_vec(ind)?;
    Ok(entry_of(&buf, jbn % vpb))
}

impl Analyzer {
    /// Translates a journal-relative block number to a filesystem block.
    pub fn journal_block_to_real_block(&mut self, jbn: u32) -> io::Result<u32> {
        let jinode = self.journal.inode.expect("journal not initialized");
        journal_block_to_real_block(&mut self.image, &jinode, jbn)
    }

    /// Builds the journal indices. Called once during construction.
    pub(crate) fn init_journal(&mut self) -> io::Result<()> {
        let inum = self.image.sb.journal_inode;
        if !self.is_allocated_inode(inum)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "the journal inode is not allocated; is the journal external?",
            ));
        }
        let jinode = self.inode(inum)?;
        // Find the filesystem block range used by the journal.
        let mut smallest = self.image.block_count;
        let mut largest = 0u32;
        let corrupted = self.for_each_block_of(
            &jinode,
            DIRECT_BIT | INDIRECT_BIT,
            false,
            &mut |block, _| {
                smallest = smallest.min(block);
                largest = largest.max(block);
            },
        )?;
        if corrupted || smallest >= largest {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "the journal inode's block tree is corrupt",
            ));
        }
        let min_block = smallest;
        let max_block = largest + 1;
        println!("Minimum / maximum journal block: {min_block} / {max_block}");
        // Fill the journal membership bitmaps.
        let bitmap_len = (max_block - min_block).div_ceil(8) as usize;
        let mut indirect_bitmap = vec![0u8; bitmap_len];
        self.for_each_block_of(&jinode, INDIRECT_BIT, false, &mut |block, _| {
            indirect_bitmap[((block - min_block) / 8) as usize] |= 1 << ((block - min_block) % 8);
        })?;
        let mut block_bitmap = vec![0u8; bitmap_len];
        self.for_each_block_of(&jinode, DIRECT_BIT | INDIRECT_BIT, false, &mut |block, _| {
            block_bitmap[((block - min_block) / 8) as usize] |= 1 << ((block - min_block) % 8);
        })?;
        // Read the journal superblock from the first block of the journal
        // file.
        let first_block = jinode.block(0);
        let mut buf = vec![0u8; size_of::<JournalSuperBlock>()];
        self.image.read_at(self.image.block_to_offset(first_block), &mut buf)?;
        let jsb: JournalSuperBlock = from_bytes(&buf).unwrap();
        let jsb_header = jsb.s_header;
        if jsb_header.magic() != jbd::JBD_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad journal superblock magic",
            ));
        }
        self.journal.sb = Some(jsb);
        self.journal.inum = inum;
        self.journal.inode = Some(jinode);
        self.journal.maxlen = jsb.maxlen();
        self.journal.min_block = min_block;
        self.journal.max_block = max_block;
        self.journal.block_bitmap = block_bitmap;
        self.journal.indirect_bitmap = indirect_bitmap;
        // Collect all records.
        print!("Loading journal descriptors...");
        let (mut descriptors, wrapped_sequence) = self.collect_journal_records(&jinode, &jsb)?;
        self.journal.wrapped_sequence = wrapped_sequence;
        print!(" sorting...");
        descriptors.sort_by_key(|descriptor| descriptor.sequence);
        let mut min_sequence = u32::MAX;
        let mut max_sequence = 0;
        for descriptor in &descriptors {
            min_sequence = min_sequence.min(descriptor.sequence);
            max_sequence = max_sequence.max(descriptor.sequence);
        }
        // Group the records into transactions and build the per-block
        // indices.
        let mut transactions: BTreeMap<u32, Transaction> = BTreeMap::new();
        let mut block_to_descriptors: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut block_in_journal: HashMap<u32, usize> = HashMap::new();
        for (i, descriptor) in descriptors.iter().enumerate() {
            match &descriptor.kind {
                DescriptorKind::Tag(tag) => {
                    let transaction = transactions
                        .entry(descriptor.sequence)
                        .or_insert_with(|| Transaction {
                            start_block: descriptor.journal_block,
                            sequence: descriptor.sequence,
                            committed: false,
                            descriptors: Vec::new(),
                        });
                    transaction.descriptors.push(i);
                    block_to_descriptors.entry(tag.fs_block).or_default().push(i);
                    block_in_journal.insert(descriptor.journal_block, i);
                }
                DescriptorKind::Revoke(blocks) => {
                    let transaction = transactions
                        .entry(descriptor.sequence)
                        .or_insert_with(|| Transaction {
                            start_block: descriptor.journal_block,
                            sequence: descriptor.sequence,
                            committed: false,
                            descriptors: Vec::new(),
                        });
                    transaction.descriptors.push(i);
                    for &block in blocks {
                        block_to_descriptors.entry(block).or_default().push(i);
                    }
                    block_in_journal.insert(descriptor.journal_block, i);
                }
                DescriptorKind::Commit => {
                    // A transaction consisting of only a commit record is of
                    // no use (its descriptors were overwritten).
                    if let Some(transaction) = transactions.get_mut(&descriptor.sequence) {
                        transaction.committed = true;
                        transaction.descriptors.push(i);
                    }
                    block_in_journal.insert(descriptor.journal_block, i);
                }
            }
        }
        let descriptor_count = descriptors.len();
        self.journal.descriptors = descriptors;
        self.journal.transactions = transactions;
        self.journal.block_to_descriptors = block_to_descriptors;
        self.journal.block_in_journal_to_descriptor = block_in_journal;
        self.journal.min_sequence = if descriptor_count == 0 { 0 } else { min_sequence };
        self.journal.max_sequence = max_sequence;
        // Find the owning directory inode of every block referenced from a
        // journaled copy of an inode table block. Ascending sequence order
        // makes the latest copy win.
        self.build_block_to_dir_inode()?;
        println!(" done");
        if self.journal.wrapped_sequence != 0 {
            let wrapped = self.journal.wrapped_sequence;
            println!(
                "Journal transaction {wrapped} wraps around, some data blocks might have been lost of this transaction."
            );
        }
        let min = self.journal.min_sequence;
        let max = self.journal.max_sequence;
        println!(
            "Number of descriptors in journal: {descriptor_count}; min / max sequence numbers: {min} / {max}"
        );
        Ok(())
    }

    /// Walks the journal file once, decoding every record.
    ///
    /// Returns the records in journal order, plus the sequence number of the
    /// transaction cut by wrap-around (0 if none).
    fn collect_journal_records(
        &mut self,
        jinode: &Inode,
        jsb: &JournalSuperBlock,
    ) -> io::Result<(Vec<Descriptor>, u32)> {
        let maxlen = jsb.maxlen();
        let header_size = size_of::<JournalHeader>();
        let tag_size = size_of::<BlockTag>();
        let mut descriptors = Vec::new();
        let mut jbn = jsb.first();
        while jbn < maxlen {
            let bn = journal_block_to_real_block(&mut self.image, jinode, jbn)?;
            let buf = self.image.read_block_vec(bn)?;
            let header: JournalHeader = from_bytes(&buf).unwrap();
            if header.magic() == jbd::JBD_MAGIC {
                let sequence = header.sequence();
                match header.blocktype() {
                    jbd::DESCRIPTOR_BLOCK => {
                        // The data copies governed by this descriptor follow
                        // it; each tag names the filesystem block the next
                        // copy belongs to.
                        let mut offset = header_size;
                        loop {
                            let Some(tag) = from_bytes::<BlockTag>(&buf[offset.min(buf.len())..])
                            else {
                                break;
                            };
                            jbn += 1;
                            if jbn >= maxlen {
                                // The transaction wraps around the end of the
                                // log; its remaining tags are lost.
                                return Ok((descriptors, sequence));
                            }
                            let copy_block =
                                journal_block_to_real_block(&mut self.image, jinode, jbn)?;
                            let flags = tag.flags();
                            descriptors.push(Descriptor {
                                journal_block: copy_block,
                                sequence,
                                kind: DescriptorKind::Tag(DescriptorTag {
                                    fs_block: tag.blocknr(),
                                    flags,
                                }),
                            });
                            offset += tag_size;
                            if flags & jbd::FLAG_SAME_UUID == 0 {
                                offset += jbd::TAG_UUID_SIZE;
                            }
                            if flags & jbd::FLAG_LAST_TAG != 0 {
                                break;
                            }
                        }
                    }
                    jbd::COMMIT_BLOCK => {
                        descriptors.push(Descriptor {
                            journal_block: bn,
                            sequence,
                            kind: DescriptorKind::Commit,
                        });
                    }
                    jbd::REVOKE_BLOCK => {
                        let revoke: RevokeHeader = from_bytes(&buf).unwrap();
                        let count = revoke.count();
                        let header_len = size_of::<RevokeHeader>();
                        if count < header_len as i32 || count as usize > buf.len() {
                            eprintln!(
                                "WARNING: revoke record in journal block {jbn} has a corrupt size ({count})."
                            );
                        } else {
                            let blocks = buf[header_len..count as usize]
                                .chunks_exact(4)
                                .map(|chunk| {
                                    u32::from_be_bytes(chunk.try_into().unwrap())
                                })
                                .collect();
                            descriptors.push(Descriptor {
                                journal_block: bn,
                                sequence,
                                kind: DescriptorKind::Revoke(blocks),
                            });
                        }
                    }
                    jbd::SUPERBLOCK_V1 | jbd::SUPERBLOCK_V2 => {}
                    blocktype => {
                        eprintln!(
                            "WARNING: unexpected journal blocktype ({blocktype}). Journal corrupt?"
                        );
                        return Ok((descriptors, 0));
                    }
                }
            }
            jbn += 1;
        }
        Ok((descriptors, 0))
    }

    /// Fills [`Journal::block_to_dir_inode`] from journal copies of inode
    /// table blocks.
    fn build_block_to_dir_inode(&mut self) -> io::Result<()> {
        let mut map: HashMap<u32, u32> = HashMap::new();
        let inodes_per_block = self.image.inodes_per_block();
        let mut oldtime: u32 = 0;
        // Descriptors are sorted, so later insertions are newer.
        for i in 0..self.journal.descriptors.len() {
            let descriptor = &self.journal.descriptors[i];
            let Some(tag) = descriptor.tag() else {
                continue;
            };
            let fs_block = tag.fs_block;
            let copy_block = descriptor.journal_block;
            if !self.image.is_block_number(fs_block) {
                eprintln!("{fs_block} is not a block number (sequence {}).", descriptor.sequence);
                continue;
            }
            if !self.image.is_inode(fs_block) {
                continue;
            }
            let mut inode_number = self.image.block_to_inode(fs_block);
            let buf = self.image.read_block_vec(copy_block)?;
            let mut lasttime: u32 = 0;
            for index in 0..inodes_per_block {
                let inode = self.image.inode_from_block(&buf, index);
                lasttime = lasttime
                    .max(inode.atime)
                    .max(inode.ctime)
                    .max(inode.mtime)
                    .max(inode.dtime);
                if inode.is_directory() && !inode.is_deleted() {
                    let mut blocks = Vec::new();
                    let corrupted =
                        self.for_each_block_of(&inode, DIRECT_BIT, false, &mut |block, _| {
                            blocks.push(block)
                        })?;
                    for block in blocks {
                        map.insert(block, inode_number);
                    }
                    if corrupted {
                        println!(
                            "Note: Block {copy_block} in the journal contains a copy of inode {inode_number} which is a directory, but this directory has reused or corrupted (double/triple) indirect blocks."
                        );
                    }
                }
                inode_number += 1;
            }
            // A copy block full of block numbers can masquerade as inodes;
            // real timestamps are far larger than the inode count.
            if lasttime > self.image.inode_count && (lasttime < oldtime || oldtime == 0) {
                oldtime = lasttime;
            }
        }
        if oldtime != 0 {
            println!(
                "The oldest inode block that is still in the journal, appears to be from {oldtime} = {}",
                ctime(oldtime)
            );
        }
        self.journal.block_to_dir_inode = map;
        Ok(())
    }

    /// Returns the inode-table block a journal block holds a copy of, or 0.
    pub fn journal_block_contains_inodes(&self, block: u32) -> u32 {
        let Some(&i) = self.journal.block_in_journal_to_descriptor.get(&block) else {
            return 0;
        };
        let Some(tag) = self.journal.descriptors[i].tag() else {
            return 0;
        };
        if self.image.is_inode(tag.fs_block) {
            tag.fs_block
        } else {
            0
        }
    }

    /// Returns every journal copy of the given inode, newest first, as
    /// (sequence, inode) pairs.
    pub fn copies_of_inode(&mut self, inode: u32) -> io::Result<Vec<(u32, Inode)>> {
        let block = self.image.inode_to_block(inode);
        let offset = ((inode - self.image.block_to_inode(block)) * self.image.inode_size) as usize;
        let Some(list) = self.journal.block_to_descriptors.get(&block) else {
            return Ok(Vec::new());
        };
        let copies: Vec<(u32, u32)> = list
            .iter()
            .rev()
            .filter_map(|&i| {
                let descriptor = &self.journal.descriptors[i];
                descriptor
                    .tag()
                    .map(|_| (descriptor.sequence, descriptor.journal_block))
            })
            .collect();
        let mut inodes = Vec::with_capacity(copies.len());
        for (sequence, copy_block) in copies {
            let buf = self.image.read_block_vec(copy_block)?;
            let inode: Inode = from_bytes(&buf[offset..]).unwrap();
            inodes.push((sequence, inode));
        }
        Ok(inodes)
    }

    /// Returns `u32::MAX` if the inode is still allocated and refers to the
    /// given block, otherwise the sequence number of the newest journal copy
    /// of an undeleted directory inode referring to it, or 0.
    pub fn last_undeleted_directory_inode_referring_to_block(
        &mut self,
        inode_number: u32,
        block: u32,
    ) -> io::Result<u32> {
        if self.is_allocated_inode(inode_number)? {
            let inode = self.inode(inode_number)?;
            if inode.is_directory() && self.inode_refers_to(&inode, inode_number, block)? {
                return Ok(u32::MAX);
            }
        }
        for (sequence, inode) in self.copies_of_inode(inode_number)? {
            if inode.is_directory() && self.inode_refers_to(&inode, inode_number, block)? {
                return Ok(sequence);
            }
        }
        Ok(0)
    }
}

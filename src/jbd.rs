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

//! On-disk structures of the JBD journal used by ext3.
//!
//! Unlike the rest of the filesystem, journal headers are big-endian. Fields
//! are stored raw; the accessor methods perform the conversion.

/// The magic number identifying a journal metadata block.
pub const JBD_MAGIC: u32 = 0xc03b3998;

/// Journal block type: descriptor block.
pub const DESCRIPTOR_BLOCK: u32 = 1;
/// Journal block type: commit record.
pub const COMMIT_BLOCK: u32 = 2;
/// Journal block type: journal superblock, version 1.
pub const SUPERBLOCK_V1: u32 = 3;
/// Journal block type: journal superblock, version 2.
pub const SUPERBLOCK_V2: u32 = 4;
/// Journal block type: revoke record.
pub const REVOKE_BLOCK: u32 = 5;

/// Tag flag: the first word of the data block was escaped (it aliased the
/// journal magic and was replaced by zero in the copy).
pub const FLAG_ESCAPE: u32 = 1;
/// Tag flag: the tag carries no UUID; the previous one applies.
pub const FLAG_SAME_UUID: u32 = 2;
/// Tag flag: the block was deleted by this transaction.
pub const FLAG_DELETED: u32 = 4;
/// Tag flag: last tag of the descriptor block.
pub const FLAG_LAST_TAG: u32 = 8;

/// The size of the UUID that follows a tag without `FLAG_SAME_UUID`.
pub const TAG_UUID_SIZE: usize = 16;

/// The common header of all journal metadata blocks.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct JournalHeader {
    /// The journal magic number.
    pub h_magic: u32,
    /// The type of this block.
    pub h_blocktype: u32,
    /// The sequence number of the transaction this block belongs to.
    pub h_sequence: u32,
}

impl JournalHeader {
    /// Returns the magic number.
    pub fn magic(&self) -> u32 {
        u32::from_be(self.h_magic)
    }

    /// Returns the block type.
    pub fn blocktype(&self) -> u32 {
        u32::from_be(self.h_blocktype)
    }

    /// Returns the transaction sequence number.
    pub fn sequence(&self) -> u32 {
        u32::from_be(self.h_sequence)
    }
}

/// The journal superblock, stored in the first block of the journal file.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct JournalSuperBlock {
    /// Common header.
    pub s_header: JournalHeader,
    /// The size of a journal block in bytes.
    pub s_blocksize: u32,
    /// The total number of blocks in the journal file.
    pub s_maxlen: u32,
    /// The first block of log information.
    pub s_first: u32,
    /// The first expected commit sequence number.
    pub s_sequence: u32,
    /// The journal block of the start of the log.
    pub s_start: u32,
    /// Error value, as set by the kernel.
    pub s_errno: i32,
    /// Compatible feature set.
    pub s_feature_compat: u32,
    /// Incompatible feature set.
    pub s_feature_incompat: u32,
    /// Read-only compatible feature set.
    pub s_feature_ro_compat: u32,
    /// The UUID of the journal.
    pub s_uuid: [u8; 16],
    /// The number of filesystems sharing this journal.
    pub s_nr_users: u32,
    /// The block number of the dynamic superblock copy.
    pub s_dynsuper: u32,
    /// The maximum number of journal blocks per transaction.
    pub s_max_transaction: u32,
    /// The maximum number of data blocks per transaction.
    pub s_max_trans_data: u32,
    /// Padding.
    pub s_padding: [u32; 44],
    /// The IDs of the filesystems sharing the journal.
    pub s_users: [u8; 16 * 48],
}

impl JournalSuperBlock {
    /// Returns the journal block size in bytes.
    pub fn blocksize(&self) -> u32 {
        u32::from_be(self.s_blocksize)
    }

    /// Returns the number of blocks in the journal file.
    pub fn maxlen(&self) -> u32 {
        u32::from_be(self.s_maxlen)
    }

    /// Returns the first log block.
    pub fn first(&self) -> u32 {
        u32::from_be(self.s_first)
    }

    /// Returns the first expected commit sequence number.
    pub fn sequence(&self) -> u32 {
        u32::from_be(self.s_sequence)
    }

    /// Returns the journal block of the start of the log.
    pub fn start(&self) -> u32 {
        u32::from_be(self.s_start)
    }
}

/// A tag in a descriptor block, naming the filesystem block the next data
/// block of the transaction is a copy of.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BlockTag {
    /// The filesystem block number the copy belongs to.
    pub t_blocknr: u32,
    /// Tag flags.
    pub t_flags: u32,
}

impl BlockTag {
    /// Returns the filesystem block number.
    pub fn blocknr(&self) -> u32 {
        u32::from_be(self.t_blocknr)
    }

    /// Returns the tag flags.
    pub fn flags(&self) -> u32 {
        u32::from_be(self.t_flags)
    }
}

/// The header of a revoke block. A list of big-endian filesystem block
/// numbers follows.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct RevokeHeader {
    /// Common header.
    pub r_header: JournalHeader,
    /// The number of bytes used by this record, header included.
    pub r_count: i32,
}

impl RevokeHeader {
    /// Returns the number of bytes used by the record.
    pub fn count(&self) -> i32 {
        i32::from_be(self.r_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<JournalHeader>(), 12);
        assert_eq!(size_of::<JournalSuperBlock>(), 1024);
        assert_eq!(size_of::<BlockTag>(), 8);
        assert_eq!(size_of::<RevokeHeader>(), 16);
    }

    #[test]
    fn endianness() {
        let header = JournalHeader {
            h_magic: JBD_MAGIC.to_be(),
            h_blocktype: DESCRIPTOR_BLOCK.to_be(),
            h_sequence: 42u32.to_be(),
        };
        assert_eq!(header.magic(), JBD_MAGIC);
        assert_eq!(header.blocktype(), DESCRIPTOR_BLOCK);
        assert_eq!(header.sequence(), 42);
    }
}

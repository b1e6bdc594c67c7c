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

//! On-disk structures of the ext2/ext3 filesystem.
//!
//! All fields are little-endian. Only the parts of the format that a
//! read-only investigation needs are modeled: the superblock, the block group
//! descriptor, the inode and the directory entry.
//!
//! The structures are `packed`, so fields must be copied out before being
//! borrowed (for example by a formatting macro).

/// The offset of the superblock from the beginning of the device.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// The filesystem's signature.
pub const EXT3_SIGNATURE: u16 = 0xef53;

/// The root directory's inode.
pub const ROOT_INODE: u32 = 2;

/// The number of direct block pointers in an inode.
pub const DIRECT_BLOCKS: usize = 12;
/// The index of the singly indirect block pointer.
pub const IND_BLOCK: usize = 12;
/// The index of the doubly indirect block pointer.
pub const DIND_BLOCK: usize = 13;
/// The index of the triply indirect block pointer.
pub const TIND_BLOCK: usize = 14;
/// The total number of block pointers in an inode.
pub const N_BLOCKS: usize = 15;

/// Optional feature: the filesystem has a journal.
pub const OPTIONAL_FEATURE_JOURNAL: u32 = 0x4;

/// Required feature: compression.
pub const REQUIRED_FEATURE_COMPRESSION: u32 = 0x1;
/// Required feature: directory entries have a type field.
pub const REQUIRED_FEATURE_DIRECTORY_TYPE: u32 = 0x2;
/// Required feature: the filesystem needs to replay its journal.
pub const REQUIRED_FEATURE_JOURNAL_REPLAY: u32 = 0x4;
/// Required feature: the filesystem uses a journal device.
pub const REQUIRED_FEATURE_JOURNAL_DEVICE: u32 = 0x8;
/// Required feature: meta block groups.
pub const REQUIRED_FEATURE_META_BG: u32 = 0x10;

/// Write-required feature: the filesystem uses a 64-bit file size.
pub const WRITE_REQUIRED_64_BITS: u32 = 0x2;

/// Directory entry type: unknown.
pub const FT_UNKNOWN: u8 = 0;
/// Directory entry type: regular file.
pub const FT_REG_FILE: u8 = 1;
/// Directory entry type: directory.
pub const FT_DIR: u8 = 2;
/// Directory entry type: character device.
pub const FT_CHRDEV: u8 = 3;
/// Directory entry type: block device.
pub const FT_BLKDEV: u8 = 4;
/// Directory entry type: FIFO.
pub const FT_FIFO: u8 = 5;
/// Directory entry type: socket.
pub const FT_SOCK: u8 = 6;
/// Directory entry type: symbolic link.
pub const FT_SYMLINK: u8 = 7;
/// One more than the largest valid directory entry type.
pub const FT_MAX: u8 = 8;

/// Mode bits corresponding to each directory entry type.
///
/// `FT_UNKNOWN` maps to a value no inode mode can carry so a comparison
/// against it always fails.
pub const MODE_MAP: [u32; 8] = [
    0x10000, // FT_UNKNOWN
    0x8000,  // FT_REG_FILE
    0x4000,  // FT_DIR
    0x2000,  // FT_CHRDEV
    0x6000,  // FT_BLKDEV
    0x1000,  // FT_FIFO
    0xc000,  // FT_SOCK
    0xa000,  // FT_SYMLINK
];

/// Directory entries are padded to a multiple of this size.
pub const DIR_PAD: usize = 4;

/// Returns the record length of a directory entry with a name of `name_len`
/// bytes.
pub const fn dir_rec_len(name_len: usize) -> usize {
    (8 + name_len + DIR_PAD - 1) & !(DIR_PAD - 1)
}

/// The ext2/ext3 superblock structure.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct SuperBlock {
    /// Total number of inodes in the filesystem.
    pub total_inodes: u32,
    /// Total number of blocks in the filesystem.
    pub total_blocks: u32,
    /// Number of blocks reserved for the superuser.
    pub superuser_blocks: u32,
    /// Total number of unallocated blocks.
    pub total_unallocated_blocks: u32,
    /// Total number of unallocated inodes.
    pub total_unallocated_inodes: u32,
    /// Block number of the block containing the superblock.
    pub superblock_block_number: u32,
    /// log2(block_size) - 10
    pub block_size_log: u32,
    /// log2(fragment_size) - 10
    pub fragment_size_log: u32,
    /// The number of blocks per block group.
    pub blocks_per_group: u32,
    /// The number of fragments per block group.
    pub fragments_per_group: u32,
    /// The number of inodes per block group.
    pub inodes_per_group: u32,
    /// The timestamp of the last mount operation.
    pub last_mount_timestamp: u32,
    /// The timestamp of the last write operation.
    pub last_write_timestamp: u32,
    /// The number of mounts since the last consistency check.
    pub mount_count_since_fsck: u16,
    /// The number of mounts allowed before a consistency check must be done.
    pub mount_count_before_fsck: u16,
    /// The ext2 signature.
    pub signature: u16,
    /// The filesystem's state.
    pub fs_state: u16,
    /// The action to perform when an error is detected.
    pub error_action: u16,
    /// The minor version.
    pub minor_version: u16,
    /// The timestamp of the last consistency check.
    pub last_fsck_timestamp: u32,
    /// The interval between mandatory consistency checks.
    pub fsck_interval: u32,
    /// The id of the operating system from which the filesystem was created.
    pub os_id: u32,
    /// The major version.
    pub major_version: u32,
    /// The UID of the user that can use reserved blocks.
    pub uid_reserved: u16,
    /// The GID of the group that can use reserved blocks.
    pub gid_reserved: u16,

    // Extended superblock fields

    /// The first non reserved inode.
    pub first_non_reserved_inode: u32,
    /// The size of the inode structure in bytes.
    pub inode_size: u16,
    /// The block group containing the superblock.
    pub superblock_group: u16,
    /// Optional features for the implementation to support.
    pub optional_features: u32,
    /// Required features for the implementation to support.
    pub required_features: u32,
    /// Required features for the implementation to support for writing.
    pub write_required_features: u32,
    /// The filesystem id.
    pub filesystem_id: [u8; 16],
    /// The volume name.
    pub volume_name: [u8; 16],
    /// The path the volume was last mounted to.
    pub last_mount_path: [u8; 64],
    /// Used compression algorithms.
    pub compression_algorithms: u32,
    /// The number of blocks to preallocate for files.
    pub files_preallocate_count: u8,
    /// The number of blocks to preallocate for directories.
    pub directories_preallocate_count: u8,
    /// Unused.
    pub _unused: u16,
    /// The journal ID.
    pub journal_id: [u8; 16],
    /// The journal inode.
    pub journal_inode: u32,
    /// The journal device.
    pub journal_device: u32,
    /// The head of the orphan inodes list.
    pub orphan_inode_head: u32,

    /// Structure padding.
    pub _padding: [u8; 788],
}

impl SuperBlock {
    /// Returns the size of a block in bytes.
    pub fn block_size(&self) -> u32 {
        1024 << self.block_size_log
    }

    /// Returns the size of a fragment in bytes.
    pub fn fragment_size(&self) -> u32 {
        1024 << self.fragment_size_log
    }

    /// Returns the size of an inode in bytes.
    pub fn inode_size(&self) -> u32 {
        if self.major_version >= 1 {
            self.inode_size as u32
        } else {
            128
        }
    }

    /// Returns the first inode that is not reserved.
    pub fn first_inode(&self) -> u32 {
        if self.major_version >= 1 {
            self.first_non_reserved_inode
        } else {
            11
        }
    }

    /// Returns the number of block groups.
    pub fn groups(&self) -> u32 {
        self.total_inodes / self.inodes_per_group
    }

    /// Returns the number of blocks the inode table of a group spans.
    pub fn inode_blocks_per_group(&self) -> u32 {
        let inodes_per_group = self.inodes_per_group;
        crate::util::ceil_division(
            inodes_per_group as u64 * self.inode_size() as u64,
            self.block_size() as u64,
        ) as u32
    }

    /// Tells whether directory entries carry a file type field.
    pub fn has_filetype(&self) -> bool {
        self.required_features & REQUIRED_FEATURE_DIRECTORY_TYPE != 0
    }
}

/// A block group descriptor, stored in the Block Group Descriptor Table
/// (BGDT) which follows the superblock.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct GroupDescriptor {
    /// The block address of the block usage bitmap.
    pub block_usage_bitmap_addr: u32,
    /// The block address of the inode usage bitmap.
    pub inode_usage_bitmap_addr: u32,
    /// Starting block address of the inode table.
    pub inode_table_start_addr: u32,
    /// Number of unallocated blocks in the group.
    pub unallocated_blocks_number: u16,
    /// Number of unallocated inodes in the group.
    pub unallocated_inodes_number: u16,
    /// Number of directories in the group.
    pub directories_number: u16,

    /// Structure padding.
    pub _padding: [u8; 14],
}

/// An inode represents a file in the filesystem. The name of the file is not
/// included in the inode but in the directory entries that refer to it, since
/// several entries can refer to the same inode (hard links).
///
/// Only the 128-byte prefix is modeled; larger inode sizes pad with data this
/// tool does not use.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Inode {
    /// Type and permissions.
    pub mode: u16,
    /// Low 16 bits of the user ID.
    pub uid_low: u16,
    /// Lower 32 bits of the size in bytes.
    pub size_low: u32,
    /// Timestamp of the last access.
    pub atime: u32,
    /// Timestamp of the last metadata modification.
    pub ctime: u32,
    /// Timestamp of the last content modification.
    pub mtime: u32,
    /// Timestamp of the deletion.
    pub dtime: u32,
    /// Low 16 bits of the group ID.
    pub gid_low: u16,
    /// The number of hard links to this inode.
    pub hard_links_count: u16,
    /// The number of 512-byte sectors used by this inode.
    pub used_sectors: u32,
    /// Inode flags.
    pub flags: u32,
    /// OS-specific value.
    pub os_specific_0: u32,
    /// Direct block pointers.
    pub direct_block_ptrs: [u32; DIRECT_BLOCKS],
    /// Singly indirect block pointer.
    pub singly_indirect_block_ptr: u32,
    /// Doubly indirect block pointer.
    pub doubly_indirect_block_ptr: u32,
    /// Triply indirect block pointer.
    pub triply_indirect_block_ptr: u32,
    /// Generation number.
    pub generation: u32,
    /// The file's ACL.
    pub extended_attributes_block: u32,
    /// Higher 32 bits of the size in bytes for regular files (`dir_acl`).
    pub size_high: u32,
    /// Block address of the fragment.
    pub fragment_addr: u32,
    /// Fragment number.
    pub fragment_number: u8,
    /// Fragment size.
    pub fragment_size: u8,
    /// Padding.
    pub _pad: u16,
    /// High 16 bits of the user ID.
    pub uid_high: u16,
    /// High 16 bits of the group ID.
    pub gid_high: u16,
    /// Reserved.
    pub _reserved: u32,
}

impl Inode {
    /// Returns the block pointer at index `i` (`0..N_BLOCKS`).
    pub fn block(&self, i: usize) -> u32 {
        let direct = self.direct_block_ptrs;
        match i {
            0..=11 => direct[i],
            IND_BLOCK => self.singly_indirect_block_ptr,
            DIND_BLOCK => self.doubly_indirect_block_ptr,
            TIND_BLOCK => self.triply_indirect_block_ptr,
            _ => panic!("block pointer index out of range"),
        }
    }

    /// Returns the user ID.
    pub fn uid(&self) -> u32 {
        self.uid_low as u32 | (self.uid_high as u32) << 16
    }

    /// Returns the group ID.
    pub fn gid(&self) -> u32 {
        self.gid_low as u32 | (self.gid_high as u32) << 16
    }

    /// Returns the size of the file in bytes.
    ///
    /// For regular files, the `dir_acl` field extends the size to 64 bits.
    pub fn size(&self) -> u64 {
        if self.is_regular_file() {
            self.size_low as u64 | (self.size_high as u64) << 32
        } else {
            self.size_low as u64
        }
    }

    /// Returns the kind bits of the mode field.
    pub fn kind(&self) -> u16 {
        self.mode & 0xf000
    }

    /// Tells whether the inode is a directory.
    pub fn is_directory(&self) -> bool {
        self.kind() == 0x4000
    }

    /// Tells whether the inode is a regular file.
    pub fn is_regular_file(&self) -> bool {
        self.kind() == 0x8000
    }

    /// Tells whether the inode is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind() == 0xa000
    }

    /// Tells whether the inode is part of an orphan list.
    ///
    /// In that case, `dtime` is overloaded to contain the inode number of the
    /// next orphan instead of a deletion time. This relies on the fact that a
    /// timestamp is (much) larger than the number of inodes, `inode_count`.
    pub fn is_orphan(&self, inode_count: u32) -> bool {
        self.hard_links_count == 0
            && self.atime != 0
            && self.dtime < self.atime
            && self.dtime <= inode_count
    }

    /// Tells whether `dtime` is expected to contain a date.
    pub fn has_valid_dtime(&self, inode_count: u32) -> bool {
        self.dtime != 0 && !self.is_orphan(inode_count)
    }

    /// Tells whether the inode appears to describe a previously deleted file,
    /// directory or symlink whose block list is gone.
    ///
    /// Orphan inodes return `false` although they are partially deleted.
    pub fn is_deleted(&self) -> bool {
        self.hard_links_count == 0
            && self.mode != 0
            && (self.block(0) == 0 || !(self.is_directory() || self.is_regular_file()))
    }

    /// Returns the target of a symlink stored inline, in place of the block
    /// pointers.
    ///
    /// Only valid for symlinks whose sector count is zero.
    pub fn inline_symlink_target(&self) -> Vec<u8> {
        let len = (self.size() as usize).min(N_BLOCKS * 4);
        let mut bytes = Vec::with_capacity(len);
        for i in 0..N_BLOCKS {
            bytes.extend_from_slice(&self.block(i).to_le_bytes());
        }
        bytes.truncate(len);
        bytes
    }
}

/// The fixed-size header of a directory entry. The name follows, unpadded.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct DirEntryHeader {
    /// The inode the entry refers to.
    pub inode: u32,
    /// The length of the record; a multiple of 4 chaining to the next entry
    /// or to the end of the block.
    pub rec_len: u16,
    /// The length of the name.
    pub name_len: u8,
    /// The file type hint, present when the filetype feature is enabled.
    pub file_type: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<SuperBlock>(), 1024);
        assert_eq!(size_of::<GroupDescriptor>(), 32);
        assert_eq!(size_of::<Inode>(), 128);
        assert_eq!(size_of::<DirEntryHeader>(), 8);
    }

    #[test]
    fn rec_len_rounding() {
        assert_eq!(dir_rec_len(1), 12);
        assert_eq!(dir_rec_len(2), 12);
        assert_eq!(dir_rec_len(4), 12);
        assert_eq!(dir_rec_len(5), 16);
    }

    #[test]
    fn deleted_and_orphans() {
        let mut blocks = [0u32; DIRECT_BLOCKS];
        blocks[0] = 100;
        let mut inode: Inode = unsafe { std::mem::zeroed() };
        inode.mode = 0x8000 | 0o644;
        inode.hard_links_count = 1;
        inode.direct_block_ptrs = blocks;
        assert!(!inode.is_deleted());
        // rm: links drop to zero and the block list is wiped.
        inode.hard_links_count = 0;
        inode.direct_block_ptrs = [0; DIRECT_BLOCKS];
        inode.dtime = 1_200_000_000;
        assert!(inode.is_deleted());
        assert!(inode.has_valid_dtime(65536));
        // An orphan keeps its block list; dtime holds the next orphan inode.
        inode.direct_block_ptrs = blocks;
        inode.atime = 1_200_000_000;
        inode.dtime = 13;
        assert!(inode.is_orphan(65536));
        assert!(!inode.has_valid_dtime(65536));
        assert!(!inode.is_deleted());
    }

    #[test]
    fn large_file_size() {
        let mut inode: Inode = unsafe { std::mem::zeroed() };
        inode.mode = 0x8000;
        inode.size_low = 4096;
        inode.size_high = 1;
        assert_eq!(inode.size(), (1u64 << 32) + 4096);
        // dir_acl only extends the size of regular files.
        inode.mode = 0x4000;
        assert_eq!(inode.size(), 4096);
    }
}

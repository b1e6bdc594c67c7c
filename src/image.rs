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

//! Read-only access to the analyzed image.
//!
//! The image is opened once, its superblock is validated, and the constants
//! every other analysis derives from it are computed up front.

use crate::ext3::GroupDescriptor;
use crate::ext3::Inode;
use crate::ext3::OPTIONAL_FEATURE_JOURNAL;
use crate::ext3::REQUIRED_FEATURE_COMPRESSION;
use crate::ext3::REQUIRED_FEATURE_JOURNAL_DEVICE;
use crate::ext3::REQUIRED_FEATURE_JOURNAL_REPLAY;
use crate::ext3::REQUIRED_FEATURE_META_BG;
use crate::ext3::SUPERBLOCK_OFFSET;
use crate::ext3::SuperBlock;
use crate::util::from_bytes;
use libc::ioctl;
use std::ffi::c_long;
use std::fs::File;
use std::io;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get the size of a block device in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// Returns the size in bytes of the device or image at the given path.
pub fn device_size(path: &Path, file: &File) -> io::Result<u64> {
    let metadata = file.metadata()?;
    let file_type = metadata.file_type();
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device() || file_type.is_char_device() {
            let mut size = 0u64;
            let ret = unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
            if ret < 0 {
                return Err(Error::last_os_error());
            }
            return Ok(size);
        }
    }
    if file_type.is_file() {
        Ok(metadata.len())
    } else {
        Err(Error::new(
            ErrorKind::InvalidInput,
            format!("{}: not a regular file or device", path.display()),
        ))
    }
}

/// Produces a corruption error with the given message.
fn corrupt<M: std::fmt::Display>(msg: M) -> Error {
    Error::new(ErrorKind::InvalidData, msg.to_string())
}

/// The opened image together with the superblock-derived constants and the
/// block group descriptor table.
///
/// All reads of the analyzed filesystem go through this type; nothing ever
/// writes to it.
pub struct Image {
    /// The image file, open read-only.
    file: File,
    /// The path the image was opened from.
    pub path: PathBuf,
    /// The superblock.
    pub sb: SuperBlock,
    /// The block group descriptor table.
    pub groups: Vec<GroupDescriptor>,

    // Frequently used constants, fixed once the superblock is read.
    /// The size of a block in bytes.
    pub block_size: u32,
    /// log2 of the block size.
    pub block_size_log: u32,
    /// The number of blocks per group.
    pub blocks_per_group: u32,
    /// The number of inodes per group.
    pub inodes_per_group: u32,
    /// The size of an inode in bytes.
    pub inode_size: u32,
    /// The total number of inodes.
    pub inode_count: u32,
    /// The total number of blocks.
    pub block_count: u32,
    /// The number of the first data block (1 for 1 KiB blocks, else 0).
    pub first_data_block: u32,
    /// The number of groups.
    pub group_count: u32,
    /// Whether directory entries carry a file type field.
    pub has_filetype: bool,
}

impl Image {
    /// Opens the image at `path` read-only and validates its superblock.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        // Read the superblock.
        let mut buf = [0u8; size_of::<SuperBlock>()];
        file.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        file.read_exact(&mut buf)?;
        let sb: SuperBlock = from_bytes(&buf).unwrap();
        // Structural sanity checks. A mismatch here means this is not the
        // first superblock of an ext3 filesystem; everything downstream
        // depends on these, so they are fatal.
        let signature = sb.signature;
        if signature != crate::ext3::EXT3_SIGNATURE {
            return Err(corrupt(format!(
                "bad superblock signature {signature:#06x} (expected 0xef53); not an ext2/ext3 filesystem?"
            )));
        }
        let os_id = sb.os_id;
        if os_id != 0 {
            return Err(corrupt(format!("creator OS is {os_id} (expected 0: Linux)")));
        }
        let superblock_group = sb.superblock_group;
        if superblock_group != 0 {
            return Err(corrupt(format!(
                "this is the superblock copy of group {superblock_group}; pass the whole partition, not a copy"
            )));
        }
        let optional_features = sb.optional_features;
        if optional_features & OPTIONAL_FEATURE_JOURNAL == 0 {
            return Err(corrupt(
                "the filesystem has no journal (ext2?); nothing can be recovered without one",
            ));
        }
        let block_size = sb.block_size();
        let inode_size = sb.inode_size();
        let inodes_per_group = sb.inodes_per_group;
        let inode_count = sb.total_inodes;
        let block_count = sb.total_blocks;
        let group_count = sb.groups();
        if group_count * inodes_per_group != inode_count {
            return Err(corrupt("inode count is not a multiple of inodes per group"));
        }
        if block_size != sb.fragment_size() {
            return Err(corrupt("block size differs from fragment size"));
        }
        if inodes_per_group > 8 * block_size {
            return Err(corrupt("inode bitmap does not fit in one block"));
        }
        if inode_size < 128 || inode_size > block_size || inode_size & (inode_size - 1) != 0 {
            return Err(corrupt(format!("unsupported inode size {inode_size}")));
        }
        let required_features = sb.required_features;
        if required_features & REQUIRED_FEATURE_COMPRESSION != 0 {
            return Err(corrupt("compressed filesystems are not supported"));
        }
        if required_features & REQUIRED_FEATURE_JOURNAL_DEVICE != 0 {
            return Err(corrupt("external journal devices are not supported"));
        }
        if required_features & REQUIRED_FEATURE_JOURNAL_REPLAY != 0 {
            eprintln!(
                "WARNING: the filesystem needs journal recovery; it is either still mounted or was not cleanly unmounted"
            );
        }
        if required_features & REQUIRED_FEATURE_META_BG != 0 {
            eprintln!("WARNING: the meta block group feature is set; results may be wrong");
        }
        // Read the group descriptor table, which starts in the block
        // following the superblock.
        let bgdt_block = (SUPERBLOCK_OFFSET / block_size as u64 + 1) as u32;
        let mut groups = Vec::with_capacity(group_count as usize);
        file.seek(SeekFrom::Start(bgdt_block as u64 * block_size as u64))?;
        for _ in 0..group_count {
            let mut buf = [0u8; size_of::<GroupDescriptor>()];
            file.read_exact(&mut buf)?;
            groups.push(from_bytes::<GroupDescriptor>(&buf).unwrap());
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            sb,
            groups,
            block_size,
            block_size_log: 10 + sb.block_size_log,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group,
            inode_size,
            inode_count,
            block_count,
            first_data_block: sb.superblock_block_number,
            group_count,
            has_filetype: sb.has_filetype(),
        })
    }

    /// Returns the byte offset of the given block.
    pub fn block_to_offset(&self, block: u32) -> u64 {
        (block as u64) << self.block_size_log
    }

    /// Reads `buf.len()` bytes at the given offset.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    /// Reads the given block into `buf`, which must be one block long.
    pub fn read_block(&mut self, block: u32, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        self.read_at(self.block_to_offset(block), buf)
    }

    /// Returns a freshly allocated buffer holding the given block.
    pub fn read_block_vec(&mut self, block: u32) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize];
        self.read_block(block, &mut buf)?;
        Ok(buf)
    }

    /// Tells whether `block` is a valid block number on this filesystem.
    pub fn is_block_number(&self, block: u32) -> bool {
        block < self.block_count
    }

    /// Returns the group the given block belongs to.
    pub fn block_to_group(&self, block: u32) -> u32 {
        (block - self.first_data_block) / self.blocks_per_group
    }

    /// Returns the first block of the given group.
    pub fn group_to_block(&self, group: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group
    }

    /// Returns the group the given inode belongs to.
    pub fn inode_to_group(&self, inode: u32) -> u32 {
        (inode - 1) / self.inodes_per_group
    }

    /// Returns the block of the inode table that contains the given inode.
    pub fn inode_to_block(&self, inode: u32) -> u32 {
        let group = self.inode_to_group(inode);
        let table = self.groups[group as usize].inode_table_start_addr;
        table
            + ((inode as u64 - 1 - (group * self.inodes_per_group) as u64)
                * self.inode_size as u64
                / self.block_size as u64) as u32
    }

    /// Tells whether the given block lies inside the inode table of its
    /// group.
    pub fn is_inode(&self, block: u32) -> bool {
        let group = self.block_to_group(block);
        let table = self.groups[group as usize].inode_table_start_addr;
        let table_bytes = self.inodes_per_group as u64 * self.inode_size as u64;
        block >= table
            && self.block_to_offset(block + 1) <= self.block_to_offset(table) + table_bytes
    }

    /// Returns the number of the first inode stored in the given block.
    ///
    /// Only valid when [`Self::is_inode`] returns `true` for the block.
    pub fn block_to_inode(&self, block: u32) -> u32 {
        let group = self.block_to_group(block);
        let table = self.groups[group as usize].inode_table_start_addr;
        1 + group * self.inodes_per_group
            + ((block - table) as u64 * self.block_size as u64 / self.inode_size as u64) as u32
    }

    /// Returns the number of inodes that fit in one block.
    pub fn inodes_per_block(&self) -> u32 {
        self.block_size / self.inode_size
    }

    /// Slices an inode out of a raw inode table block.
    ///
    /// `index` is the index of the inode within the block.
    pub fn inode_from_block(&self, buf: &[u8], index: u32) -> Inode {
        let offset = (index * self.inode_size) as usize;
        from_bytes::<Inode>(&buf[offset..]).unwrap()
    }
}

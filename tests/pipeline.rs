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

//! End-to-end recovery scenarios over miniature ext3 images assembled in a
//! temporary directory.
//!
//! The images use one group, 1 KiB blocks, 16 inodes and a 12-block journal:
//!
//! | block | content                      |
//! |-------|------------------------------|
//! | 1     | superblock                   |
//! | 2     | group descriptor table       |
//! | 3, 4  | block / inode bitmaps        |
//! | 5, 6  | inode table                  |
//! | 7     | root directory               |
//! | 9     | lost+found                   |
//! | 10    | "hello" file data            |
//! | 11    | "docs" directory             |
//! | 12-15 | sparse file data + indirect  |
//! | 20-31 | journal                      |

use ext3grep::accept::AcceptSet;
use ext3grep::analyzer::Analyzer;
use ext3grep::analyzer::Options;
use ext3grep::image::Image;
use ext3grep::undelete::UndeletedInode;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

const BLOCK: usize = 1024;
const BLOCKS: u32 = 512;
const INODES: u32 = 16;
const INODE_SIZE: usize = 128;

const INODE_TABLE_BLOCK: u32 = 5;
const ROOT_BLOCK: u32 = 7;
const LOST_FOUND_BLOCK: u32 = 9;
const HELLO_DATA_BLOCK: u32 = 10;
const DOCS_BLOCK: u32 = 11;
const JOURNAL_FIRST_BLOCK: u32 = 20;
const JOURNAL_LEN: u32 = 12;

const ROOT_INO: u32 = 2;
const JOURNAL_INO: u32 = 8;
const LOST_FOUND_INO: u32 = 11;
const HELLO_INO: u32 = 12;
const DOCS_INO: u32 = 13;
const SPARSE_INO: u32 = 14;
const LINK_INO: u32 = 15;

/// The deletion time used for removed files.
const DELETION_TIME: u32 = 1_300_000_000;
/// An arbitrary file timestamp before the deletion.
const FILE_TIME: u32 = 1_299_000_000;

/// The directory-walk tests change the process working directory, which is
/// global state; serialize them.
static CWD_LOCK: Mutex<()> = Mutex::new(());

#[derive(Default, Clone, Copy)]
struct InodeSpec {
    mode: u16,
    links: u16,
    size: u64,
    atime: u32,
    ctime: u32,
    mtime: u32,
    dtime: u32,
    sectors: u32,
    blocks: [u32; 15],
}

struct ImageBuilder {
    buf: Vec<u8>,
}

impl ImageBuilder {
    fn new() -> Self {
        let mut builder = Self {
            buf: vec![0u8; BLOCKS as usize * BLOCK],
        };
        builder.write_superblock();
        builder.write_group_descriptor();
        builder
    }

    fn le16(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn le32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn be32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn write_superblock(&mut self) {
        let base = 1024;
        self.le32(base, INODES); // total inodes
        self.le32(base + 4, BLOCKS); // total blocks
        self.le32(base + 12, BLOCKS - 40); // free blocks
        self.le32(base + 16, 5); // free inodes
        self.le32(base + 20, 1); // first data block
        self.le32(base + 24, 0); // log block size
        self.le32(base + 28, 0); // log fragment size
        self.le32(base + 32, BLOCKS); // blocks per group
        self.le32(base + 40, INODES); // inodes per group
        self.le16(base + 56, 0xef53); // signature
        self.le16(base + 58, 1); // state: clean
        self.le16(base + 60, 2); // errors: remount read-only
        self.le32(base + 76, 1); // major version
        self.le32(base + 84, 11); // first non-reserved inode
        self.le16(base + 88, INODE_SIZE as u16); // inode size
        self.le16(base + 90, 0); // this superblock's group
        self.le32(base + 92, 0x4); // optional features: has journal
        self.le32(base + 96, 0x2); // required features: filetype
        self.le32(base + 224, JOURNAL_INO); // journal inode
    }

    fn write_group_descriptor(&mut self) {
        let base = 2 * BLOCK;
        self.le32(base, 3); // block bitmap
        self.le32(base + 4, 4); // inode bitmap
        self.le32(base + 8, INODE_TABLE_BLOCK); // inode table
    }

    fn set_block_allocated(&mut self, block: u32) {
        let bit = block - 1; // first data block is 1
        self.buf[3 * BLOCK + (bit / 8) as usize] |= 1 << (bit % 8);
    }

    fn set_inode_allocated(&mut self, inode: u32) {
        let bit = inode - 1;
        self.buf[4 * BLOCK + (bit / 8) as usize] |= 1 << (bit % 8);
    }

    fn write_inode(&mut self, inode: u32, spec: &InodeSpec) {
        let base = INODE_TABLE_BLOCK as usize * BLOCK + (inode as usize - 1) * INODE_SIZE;
        self.buf[base..base + INODE_SIZE].fill(0);
        self.le16(base, spec.mode);
        self.le32(base + 4, spec.size as u32);
        self.le32(base + 8, spec.atime);
        self.le32(base + 12, spec.ctime);
        self.le32(base + 16, spec.mtime);
        self.le32(base + 20, spec.dtime);
        self.le16(base + 26, spec.links);
        self.le32(base + 28, spec.sectors);
        for (i, &block) in spec.blocks.iter().enumerate() {
            self.le32(base + 40 + i * 4, block);
        }
        self.le32(base + 108, (spec.size >> 32) as u32); // dir_acl
    }

    /// Writes the target of an inline symlink over the block pointer area.
    fn write_symlink_target(&mut self, inode: u32, target: &[u8]) {
        let base = INODE_TABLE_BLOCK as usize * BLOCK + (inode as usize - 1) * INODE_SIZE + 40;
        self.buf[base..base + target.len()].copy_from_slice(target);
    }

    fn put_dirent(
        &mut self,
        block: u32,
        offset: usize,
        inode: u32,
        rec_len: u16,
        name: &str,
        file_type: u8,
    ) {
        let base = block as usize * BLOCK + offset;
        self.le32(base, inode);
        self.le16(base + 4, rec_len);
        self.buf[base + 6] = name.len() as u8;
        self.buf[base + 7] = file_type;
        self.buf[base + 8..base + 8 + name.len()].copy_from_slice(name.as_bytes());
    }

    fn fill_block(&mut self, block: u32, byte: u8) {
        let base = block as usize * BLOCK;
        self.buf[base..base + BLOCK].fill(byte);
    }

    fn snapshot_block(&self, block: u32) -> Vec<u8> {
        let base = block as usize * BLOCK;
        self.buf[base..base + BLOCK].to_vec()
    }

    fn write_block(&mut self, block: u32, content: &[u8]) {
        let base = block as usize * BLOCK;
        self.buf[base..base + content.len()].copy_from_slice(content);
    }

    /// Writes the journal superblock into the journal's first block.
    fn write_journal_superblock(&mut self) {
        let block = JOURNAL_FIRST_BLOCK;
        let base = block as usize * BLOCK;
        self.be32(base, 0xc03b3998);
        self.be32(base + 4, 4); // superblock v2
        self.be32(base + 8, 0);
        self.be32(base + 12, BLOCK as u32); // journal block size
        self.be32(base + 16, JOURNAL_LEN); // maxlen
        self.be32(base + 20, 1); // first log block
        self.be32(base + 24, 1); // first expected sequence
        self.be32(base + 28, 1); // start of log
    }

    /// Writes a descriptor block with a single tag for `fs_block` at the
    /// given journal-relative position.
    fn write_descriptor(&mut self, jbn: u32, sequence: u32, fs_block: u32) {
        let base = (JOURNAL_FIRST_BLOCK + jbn) as usize * BLOCK;
        self.be32(base, 0xc03b3998);
        self.be32(base + 4, 1); // descriptor
        self.be32(base + 8, sequence);
        self.be32(base + 12, fs_block); // tag: block number
        self.be32(base + 16, 2 | 8); // tag: SAME_UUID | LAST_TAG
    }

    /// Writes a commit block at the given journal-relative position.
    fn write_commit(&mut self, jbn: u32, sequence: u32) {
        let base = (JOURNAL_FIRST_BLOCK + jbn) as usize * BLOCK;
        self.be32(base, 0xc03b3998);
        self.be32(base + 4, 2); // commit
        self.be32(base + 8, sequence);
    }

    /// Writes a journal data copy at the given journal-relative position.
    fn write_journal_copy(&mut self, jbn: u32, content: &[u8]) {
        self.write_block(JOURNAL_FIRST_BLOCK + jbn, content);
    }

    fn finish(self, path: &Path) {
        fs::write(path, &self.buf).unwrap();
    }
}

/// Common metadata of both test images.
fn base_builder() -> ImageBuilder {
    let mut builder = ImageBuilder::new();
    for block in 1..=15 {
        builder.set_block_allocated(block);
    }
    for block in JOURNAL_FIRST_BLOCK..JOURNAL_FIRST_BLOCK + JOURNAL_LEN {
        builder.set_block_allocated(block);
    }
    for inode in [1, ROOT_INO, JOURNAL_INO, LOST_FOUND_INO, SPARSE_INO, LINK_INO] {
        builder.set_inode_allocated(inode);
    }
    // Root directory.
    builder.write_inode(
        ROOT_INO,
        &InodeSpec {
            mode: 0x4000 | 0o755,
            links: 3,
            size: BLOCK as u64,
            atime: FILE_TIME,
            ctime: FILE_TIME,
            mtime: FILE_TIME,
            sectors: 2,
            blocks: {
                let mut blocks = [0u32; 15];
                blocks[0] = ROOT_BLOCK;
                blocks
            },
            ..Default::default()
        },
    );
    // The journal inode spans blocks 20..31.
    builder.write_inode(
        JOURNAL_INO,
        &InodeSpec {
            mode: 0x8000 | 0o600,
            links: 1,
            size: (JOURNAL_LEN as usize * BLOCK) as u64,
            sectors: JOURNAL_LEN * 2,
            blocks: {
                let mut blocks = [0u32; 15];
                for (i, block) in blocks.iter_mut().enumerate().take(JOURNAL_LEN as usize) {
                    *block = JOURNAL_FIRST_BLOCK + i as u32;
                }
                blocks
            },
            ..Default::default()
        },
    );
    builder.write_inode(
        LOST_FOUND_INO,
        &InodeSpec {
            mode: 0x4000 | 0o700,
            links: 2,
            size: BLOCK as u64,
            atime: FILE_TIME,
            ctime: FILE_TIME,
            mtime: FILE_TIME,
            sectors: 2,
            blocks: {
                let mut blocks = [0u32; 15];
                blocks[0] = LOST_FOUND_BLOCK;
                blocks
            },
            ..Default::default()
        },
    );
    // lost+found contents.
    builder.put_dirent(LOST_FOUND_BLOCK, 0, LOST_FOUND_INO, 12, ".", 2);
    builder.put_dirent(LOST_FOUND_BLOCK, 12, ROOT_INO, (BLOCK - 12) as u16, "..", 2);
    // "hello" file data.
    builder.write_block(HELLO_DATA_BLOCK, b"hi\n");
    builder.write_journal_superblock();
    builder
}

/// The intact "hello" inode.
fn hello_spec(mtime: u32) -> InodeSpec {
    InodeSpec {
        mode: 0x8000 | 0o644,
        links: 1,
        size: 3,
        atime: FILE_TIME,
        ctime: FILE_TIME,
        mtime,
        sectors: 2,
        blocks: {
            let mut blocks = [0u32; 15];
            blocks[0] = HELLO_DATA_BLOCK;
            blocks
        },
        ..Default::default()
    }
}

/// The intact "docs" directory inode.
fn docs_spec() -> InodeSpec {
    InodeSpec {
        mode: 0x4000 | 0o755,
        links: 2,
        size: BLOCK as u64,
        atime: FILE_TIME,
        ctime: FILE_TIME,
        mtime: FILE_TIME,
        sectors: 2,
        blocks: {
            let mut blocks = [0u32; 15];
            blocks[0] = DOCS_BLOCK;
            blocks
        },
        ..Default::default()
    }
}

/// Adds the sparse file: logical blocks 0, 1 and 100 mapped, the rest holes.
fn add_sparse_file(builder: &mut ImageBuilder) {
    builder.write_inode(
        SPARSE_INO,
        &InodeSpec {
            mode: 0x8000 | 0o600,
            links: 1,
            size: 101 * BLOCK as u64,
            atime: FILE_TIME,
            ctime: FILE_TIME,
            mtime: FILE_TIME,
            sectors: 8,
            blocks: {
                let mut blocks = [0u32; 15];
                blocks[0] = 12;
                blocks[1] = 13;
                blocks[12] = 14; // single indirect
                blocks
            },
            ..Default::default()
        },
    );
    builder.fill_block(12, b'A');
    builder.fill_block(13, b'B');
    // Indirect block: logical block 100 = 12 + entry 88.
    builder.le32(14 * BLOCK + 88 * 4, 15);
    builder.fill_block(15, b'Z');
}

/// Adds the "link" symlink with an inline target.
fn add_symlink(builder: &mut ImageBuilder) {
    builder.write_inode(
        LINK_INO,
        &InodeSpec {
            mode: 0xa000 | 0o777,
            links: 1,
            size: 7,
            atime: FILE_TIME,
            ctime: FILE_TIME,
            mtime: FILE_TIME,
            sectors: 0,
            ..Default::default()
        },
    );
    builder.write_symlink_target(LINK_INO, b"foo/bar");
}

/// Builds the image as it was before anything was deleted: "hello",
/// "sparse.dat" and "link" all live in the root directory.
fn build_live_image(path: &Path) {
    let mut builder = base_builder();
    builder.set_inode_allocated(HELLO_INO);
    builder.write_inode(HELLO_INO, &hello_spec(FILE_TIME));
    add_sparse_file(&mut builder);
    add_symlink(&mut builder);
    // Root directory: . .. lost+found hello sparse.dat link
    builder.put_dirent(ROOT_BLOCK, 0, ROOT_INO, 12, ".", 2);
    builder.put_dirent(ROOT_BLOCK, 12, ROOT_INO, 12, "..", 2);
    builder.put_dirent(ROOT_BLOCK, 24, LOST_FOUND_INO, 20, "lost+found", 2);
    builder.put_dirent(ROOT_BLOCK, 44, HELLO_INO, 16, "hello", 1);
    builder.put_dirent(ROOT_BLOCK, 60, SPARSE_INO, 20, "sparse.dat", 1);
    builder.put_dirent(ROOT_BLOCK, 80, LINK_INO, (BLOCK - 80) as u16, "link", 7);
    // One committed transaction holding a copy of the second inode table
    // block.
    let table_copy = builder.snapshot_block(INODE_TABLE_BLOCK + 1);
    builder.write_descriptor(1, 1, INODE_TABLE_BLOCK + 1);
    builder.write_journal_copy(2, &table_copy);
    builder.write_commit(3, 1);
    builder.finish(path);
}

/// Builds the image as it is after `rm hello` and `rm -r docs`, with the
/// "docs" start block reused (its "." inode zeroed) and three generations of
/// the inode table in the journal.
fn build_deleted_image(path: &Path) {
    let mut builder = base_builder();
    add_sparse_file(&mut builder);
    add_symlink(&mut builder);
    // Root directory: the live chain is . .. lost+found; "hello" and "docs"
    // survive in the tail region.
    builder.put_dirent(ROOT_BLOCK, 0, ROOT_INO, 12, ".", 2);
    builder.put_dirent(ROOT_BLOCK, 12, ROOT_INO, 12, "..", 2);
    builder.put_dirent(ROOT_BLOCK, 24, LOST_FOUND_INO, (BLOCK - 24) as u16, "lost+found", 2);
    builder.put_dirent(ROOT_BLOCK, 900, HELLO_INO, (BLOCK - 900) as u16, "hello", 1);
    builder.put_dirent(ROOT_BLOCK, 960, DOCS_INO, (BLOCK - 960) as u16, "docs", 2);
    // The "docs" directory block, as it was.
    builder.put_dirent(DOCS_BLOCK, 0, DOCS_INO, 12, ".", 2);
    builder.put_dirent(DOCS_BLOCK, 12, ROOT_INO, (BLOCK - 12) as u16, "..", 2);
    // Journal generation 1: everything intact.
    builder.write_inode(HELLO_INO, &hello_spec(FILE_TIME));
    builder.write_inode(DOCS_INO, &docs_spec());
    let generation1 = builder.snapshot_block(INODE_TABLE_BLOCK + 1);
    // Journal generation 2: "hello" touched.
    builder.write_inode(HELLO_INO, &hello_spec(FILE_TIME + 1000));
    let generation2 = builder.snapshot_block(INODE_TABLE_BLOCK + 1);
    let docs_block_copy = builder.snapshot_block(DOCS_BLOCK);
    // Current state: both deleted, block pointers wiped.
    let mut hello_deleted = hello_spec(FILE_TIME + 1000);
    hello_deleted.links = 0;
    hello_deleted.dtime = DELETION_TIME;
    hello_deleted.ctime = DELETION_TIME;
    hello_deleted.blocks = [0; 15];
    builder.write_inode(HELLO_INO, &hello_deleted);
    let mut docs_deleted = docs_spec();
    docs_deleted.links = 0;
    docs_deleted.dtime = DELETION_TIME;
    docs_deleted.blocks = [0; 15];
    builder.write_inode(DOCS_INO, &docs_deleted);
    let generation3 = builder.snapshot_block(INODE_TABLE_BLOCK + 1);
    // The "docs" block is reused: its "." entry lost its inode.
    builder.le32(DOCS_BLOCK as usize * BLOCK, 0);
    // Journal: txn 1 and 2 with the intact generations, txn 3 with the old
    // "docs" directory block, txn 4 (uncommitted) with the deleted
    // generation.
    builder.write_descriptor(1, 1, INODE_TABLE_BLOCK + 1);
    builder.write_journal_copy(2, &generation1);
    builder.write_commit(3, 1);
    builder.write_descriptor(4, 2, INODE_TABLE_BLOCK + 1);
    builder.write_journal_copy(5, &generation2);
    builder.write_commit(6, 2);
    builder.write_descriptor(7, 3, DOCS_BLOCK);
    builder.write_journal_copy(8, &docs_block_copy);
    builder.write_commit(9, 3);
    builder.write_descriptor(10, 4, INODE_TABLE_BLOCK + 1);
    builder.write_journal_copy(11, &generation3);
    builder.finish(path);
}

/// Creates a scratch directory, makes it the working directory and returns
/// it.
fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "ext3grep-test-{name}-{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    std::env::set_current_dir(&dir).unwrap();
    dir
}

fn analyzer_for(image_path: &Path, opts: Options) -> Analyzer {
    let image = Image::open(image_path).unwrap();
    Analyzer::new(image, opts, AcceptSet::default()).unwrap()
}

#[test]
fn restore_live_file() {
    let _guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir("live");
    let image_path = dir.join("live.img");
    build_live_image(&image_path);
    let mut analyzer = analyzer_for(&image_path, Options::default());
    analyzer.restore_file("hello").unwrap();
    let restored = dir.join("RESTORED_FILES/hello");
    assert_eq!(fs::read(&restored).unwrap(), b"hi\n");
    let metadata = fs::metadata(&restored).unwrap();
    use std::os::unix::fs::MetadataExt;
    assert_eq!(metadata.mode() & 0o7777, 0o644);
    // atime is not checked: reading the file back may have updated it.
    assert_eq!(metadata.mtime(), FILE_TIME as i64);
}

#[test]
fn restore_deleted_file_from_journal() {
    let _guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir("deleted");
    let image_path = dir.join("deleted.img");
    build_deleted_image(&image_path);
    let mut analyzer = analyzer_for(&image_path, Options::default());
    // The on-disk inode is deleted; the journal still has two undeleted
    // generations and one deleted one.
    let copies = analyzer.copies_of_inode(HELLO_INO).unwrap();
    let sequences: Vec<u32> = copies.iter().map(|&(sequence, _)| sequence).collect();
    assert_eq!(sequences, vec![4, 2, 1]);
    assert!(copies[0].1.is_deleted());
    assert!(!copies[1].1.is_deleted());
    match analyzer.pick_inode(HELLO_INO).unwrap() {
        UndeletedInode::Journal(sequence, inode) => {
            assert_eq!(sequence, 2);
            assert!(!inode.is_deleted());
            assert_eq!(inode.block(0), HELLO_DATA_BLOCK);
        }
        _ => panic!("expected a journal copy"),
    }
    analyzer.restore_file("hello").unwrap();
    assert_eq!(fs::read(dir.join("RESTORED_FILES/hello")).unwrap(), b"hi\n");
}

#[test]
fn after_filter_rejects_old_deletions() {
    let _guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir("after");
    let image_path = dir.join("after.img");
    build_deleted_image(&image_path);
    let opts = Options {
        after: DELETION_TIME as i64 + 1,
        ..Default::default()
    };
    let mut analyzer = analyzer_for(&image_path, opts);
    assert!(matches!(
        analyzer.pick_inode(HELLO_INO).unwrap(),
        UndeletedInode::TooOld(_)
    ));
    analyzer.restore_file("hello").unwrap();
    assert!(!dir.join("RESTORED_FILES/hello").exists());
}

#[test]
fn reused_directory_block_recovered_from_journal() {
    let _guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir("reused");
    let image_path = dir.join("reused.img");
    build_deleted_image(&image_path);
    let mut analyzer = analyzer_for(&image_path, Options::default());
    analyzer.init_dir_index().unwrap();
    // The current "docs" block was reused (its "." inode is zero), so the
    // only candidate is the copy preserved in the journal.
    let block = analyzer.dir_inode_to_block(DOCS_INO).unwrap();
    assert_eq!(block, JOURNAL_FIRST_BLOCK + 8);
    analyzer.init_directories().unwrap();
    let &docs_id = analyzer
        .all_directories
        .get("docs")
        .expect("docs was not placed in the tree");
    assert_eq!(analyzer.directory(docs_id).inode, DOCS_INO);
}

#[test]
fn sparse_file_restores_with_holes() {
    let _guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir("sparse");
    let image_path = dir.join("sparse.img");
    build_live_image(&image_path);
    let mut analyzer = analyzer_for(&image_path, Options::default());
    analyzer.restore_file("sparse.dat").unwrap();
    let content = fs::read(dir.join("RESTORED_FILES/sparse.dat")).unwrap();
    assert_eq!(content.len(), 101 * BLOCK);
    assert!(content[..BLOCK].iter().all(|&b| b == b'A'));
    assert!(content[BLOCK..2 * BLOCK].iter().all(|&b| b == b'B'));
    // The hole reads as zeroes.
    assert!(content[2 * BLOCK..100 * BLOCK].iter().all(|&b| b == 0));
    assert!(content[100 * BLOCK..].iter().all(|&b| b == b'Z'));
}

#[test]
fn symlink_restores_inline_target() {
    let _guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir("symlink");
    let image_path = dir.join("symlink.img");
    build_live_image(&image_path);
    let mut analyzer = analyzer_for(&image_path, Options::default());
    analyzer.restore_file("link").unwrap();
    let target = fs::read_link(dir.join("RESTORED_FILES/link")).unwrap();
    assert_eq!(target.to_str().unwrap(), "foo/bar");
}

#[test]
fn stage1_cache_round_trips() {
    let _guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir("cache");
    let image_path = dir.join("cache.img");
    build_deleted_image(&image_path);
    {
        let mut analyzer = analyzer_for(&image_path, Options::default());
        analyzer.init_dir_index().unwrap();
    }
    let cache_path = dir.join("cache.img.ext3grep.stage1");
    let first = fs::read(&cache_path).unwrap();
    assert!(first.ends_with(b"# END\n"));
    // A second run loads the cache; force a rescan and compare.
    fs::remove_file(&cache_path).unwrap();
    {
        let mut analyzer = analyzer_for(&image_path, Options::default());
        analyzer.init_dir_index().unwrap();
    }
    let second = fs::read(&cache_path).unwrap();
    assert_eq!(first, second);
}

#[test]
fn restore_inode_uses_newest_undeleted_copy() {
    let _guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir("inode");
    let image_path = dir.join("inode.img");
    build_deleted_image(&image_path);
    let mut analyzer = analyzer_for(&image_path, Options::default());
    // The on-disk block pointers are wiped; content must come from the
    // journal copy.
    analyzer.restore_inode(HELLO_INO).unwrap();
    assert_eq!(
        fs::read(dir.join(format!("RESTORED_FILES/inode.{HELLO_INO}"))).unwrap(),
        b"hi\n"
    );
}

#[test]
fn paths_and_hardlink_map() {
    let _guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir("paths");
    let image_path = dir.join("paths.img");
    build_live_image(&image_path);
    let mut analyzer = analyzer_for(&image_path, Options::default());
    let paths = analyzer.all_paths().unwrap();
    for expected in ["hello", "link", "lost+found", "sparse.dat"] {
        assert!(paths.contains(&expected.to_owned()), "missing {expected}");
    }
    assert_eq!(analyzer.path_to_inode.get("hello"), Some(&HELLO_INO));
    assert_eq!(analyzer.path_to_inode.get("sparse.dat"), Some(&SPARSE_INO));
    // Directory consistency: every placed inode maps back to its path.
    for (path, &id) in &analyzer.all_directories {
        let directory = analyzer.directory(id);
        assert_eq!(&directory.path, path);
    }
}

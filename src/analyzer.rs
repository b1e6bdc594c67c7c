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

//! The analysis context.
//!
//! [`Analyzer`] owns everything the individual analyses share: the image, the
//! lazily loaded group metadata, the journal indices, the results of the two
//! directory scan stages and the reconstructed directory tree. Construction
//! is initialization; dropping it releases every resource.

use crate::accept::AcceptSet;
use crate::directory::Directory;
use crate::directory::DirectoryId;
use crate::image::Image;
use crate::journal::Journal;
use crate::meta::GroupMeta;
use crate::scan::BlockList;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;

/// Filters and tunables, from the command line.
pub struct Options {
    /// Restrict processing to this group.
    pub group: Option<u32>,
    /// The block requested with `--block`, if any. Filename suppression is
    /// disabled when the user asks for a specific block.
    pub block: Option<u32>,
    /// Maximum recursion depth when walking directories. 0 means unlimited.
    pub depth: u32,
    /// Only show/process deleted entries.
    pub deleted: bool,
    /// Only show/process directories.
    pub directory: bool,
    /// Only process entries deleted on or after this time.
    pub after: i64,
    /// Only process entries deleted before this time.
    pub before: i64,
    /// Only show/process allocated inodes.
    pub allocated: bool,
    /// Only show/process unallocated inodes.
    pub unallocated: bool,
    /// Also show/process reallocated entries.
    pub reallocated: bool,
    /// Also show/process entries with a zero inode.
    pub zeroed_inodes: bool,
    /// Show inode numbers in printed paths.
    pub show_path_inodes: bool,
    /// Accept filenames whatever characters they contain.
    pub accept_all: bool,
    /// Allowed clock skew, in seconds, between the deletion time of a parent
    /// directory and those of its children (`rm -rf` stamps parents first).
    pub dtime_skew: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            group: None,
            block: None,
            depth: 0,
            deleted: false,
            directory: false,
            after: 0,
            before: 0,
            allocated: false,
            unallocated: false,
            reallocated: false,
            zeroed_inodes: false,
            show_path_inodes: false,
            accept_all: false,
            dtime_skew: 60,
        }
    }
}

/// The analysis context.
pub struct Analyzer {
    /// The opened image and its constants.
    pub image: Image,
    /// Filters and tunables.
    pub opts: Options,
    /// Filename allow-list for names with unlikely characters.
    pub accept: AcceptSet,
    /// Journal indices.
    pub journal: Journal,
    /// Lazily loaded per-group metadata.
    pub(crate) meta: Vec<Option<GroupMeta>>,

    /// Stage 1: inode number to candidate directory start block(s).
    ///
    /// Indexed by inode number; entry 0 is unused.
    pub(crate) dir_index: Vec<BlockList>,
    /// Stage 1: blocks holding directory tail entries, with no "." / "..".
    pub extended_blocks: Vec<u32>,
    /// Whether stage 1 ran (or its cache was loaded).
    pub(crate) stage1_done: bool,
    /// Whether the stage 2 reduction of `dir_index` ran.
    pub(crate) stage2_done: bool,

    /// The directory slab; [`DirectoryId`]s index into it.
    pub(crate) directories: Vec<Directory>,
    /// Path to directory, for every directory that could be placed.
    pub all_directories: BTreeMap<String, DirectoryId>,
    /// Inode to directory back-reference.
    pub inode_to_directory: HashMap<u32, DirectoryId>,
    /// Full path to inode for non-directory files.
    pub path_to_inode: BTreeMap<String, u32>,
    /// Whether the directory tree was built.
    pub(crate) tree_done: bool,
    /// Whether `path_to_inode` was filled.
    pub(crate) files_done: bool,
}

impl Analyzer {
    /// Creates an analyzer over the given image.
    ///
    /// This loads the journal indices, which every analysis relies on.
    pub fn new(image: Image, opts: Options, accept: AcceptSet) -> io::Result<Self> {
        let group_count = image.group_count as usize;
        let inode_count = image.inode_count as usize;
        let mut analyzer = Self {
            image,
            opts,
            accept,
            journal: Journal::default(),
            meta: (0..group_count).map(|_| None).collect(),
            dir_index: Vec::new(),
            extended_blocks: Vec::new(),
            stage1_done: false,
            stage2_done: false,
            directories: Vec::new(),
            all_directories: BTreeMap::new(),
            inode_to_directory: HashMap::new(),
            path_to_inode: BTreeMap::new(),
            tree_done: false,
            files_done: false,
        };
        analyzer.dir_index = (0..=inode_count).map(|_| BlockList::Empty).collect();
        analyzer.init_journal()?;
        Ok(analyzer)
    }

    /// Returns the basename of the analyzed device, used to name the stage
    /// cache files.
    pub fn device_basename(&self) -> String {
        self.image
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_owned())
    }

    /// Returns the directory with the given id.
    pub fn directory(&self, id: DirectoryId) -> &Directory {
        &self.directories[id.0]
    }

    /// Returns the directory with the given id, mutably.
    pub(crate) fn directory_mut(&mut self, id: DirectoryId) -> &mut Directory {
        &mut self.directories[id.0]
    }
}

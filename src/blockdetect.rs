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

//! Block type detection.
//!
//! The central test is [`Analyzer::is_directory_block`]: given the raw
//! contents of a block, decide whether it holds a chain of directory entries,
//! and if so whether it is the first block of a directory (leading "." and
//! ".." entries) or an extended block holding only tail entries.

use crate::analyzer::Analyzer;
use crate::ext3::dir_rec_len;
use crate::ext3::DirEntryHeader;
use crate::ext3::FT_DIR;
use crate::ext3::FT_MAX;
use crate::ext3::FT_UNKNOWN;
use crate::util::from_bytes;

/// The verdict of directory block detection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsDirectory {
    /// The block does not hold directory entries.
    No,
    /// The block starts a directory: it begins with "." and "..".
    Start,
    /// The block holds directory tail entries.
    Extended,
}

/// Classification of a byte appearing in a filename.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilenameChar {
    /// A perfectly normal filename byte.
    Ok,
    /// A byte that cannot appear in a filename (NUL or '/').
    Illegal,
    /// Legal but rarely seen in real filenames.
    Unlikely,
    /// A control character; legal but suspicious.
    NonAscii,
}

/// Bytes marked as legal but unlikely: `" * ; < > ? \ ` |`.
const UNLIKELY: [u8; 9] = [b'"', b'*', b';', b'<', b'>', b'?', b'\\', b'`', b'|'];

/// Classifies a filename byte.
pub fn classify_filename_char(c: u8) -> FilenameChar {
    if c == 0 || c == b'/' {
        return FilenameChar::Illegal;
    }
    if c < 32 || c == 127 {
        return FilenameChar::NonAscii;
    }
    if UNLIKELY.contains(&c) {
        return FilenameChar::Unlikely;
    }
    FilenameChar::Ok
}

/// Escapes a raw filename for printing: pure ASCII passes through, control
/// characters use C escapes and anything else becomes a three-digit octal
/// escape.
pub fn escape_name(name: &[u8]) -> String {
    let mut out = String::new();
    for &c in name {
        if c > 31 && c != b'\\' && c != 127 {
            out.push(c as char);
        } else if c == b'\\' {
            out.push_str("\\\\");
        } else {
            let short = match c {
                7 => Some('a'),
                8 => Some('b'),
                9 => Some('t'),
                10 => Some('n'),
                11 => Some('v'),
                12 => Some('f'),
                13 => Some('r'),
                27 => Some('e'),
                _ => None,
            };
            match short {
                Some(s) => {
                    out.push('\\');
                    out.push(s);
                }
                None => out.push_str(&format!("\\{c:03o}")),
            }
        }
    }
    out
}

/// Statistics accumulated while validating one directory block.
#[derive(Default)]
pub struct DirectoryBlockStats {
    /// The number of accepted entries.
    pub entries: u32,
    /// The number of unlikely characters seen across all names.
    pub unlikely_characters: u32,
}

impl Analyzer {
    /// Tells whether the given block contents look like a directory block.
    ///
    /// Arguments:
    /// - `block` is the raw block contents.
    /// - `blocknr` is its block number, for messages.
    /// - `stats` accumulates entry statistics.
    /// - `start_block` restricts the test to start blocks: anything else
    ///   returns [`IsDirectory::No`] without trying the extended case.
    /// - `certainly_linked` tells whether the entry chain reaching `offset`
    ///   is the live chain of the block (as opposed to a probe into the
    ///   deleted tail region).
    /// - `offset` is where validation starts; the chain from there to the end
    ///   of the block must be fully consistent.
    pub fn is_directory_block(
        &mut self,
        block: &[u8],
        blocknr: u32,
        stats: &mut DirectoryBlockStats,
        start_block: bool,
        certainly_linked: bool,
        offset: usize,
    ) -> IsDirectory {
        let block_size = self.image.block_size as usize;
        // Entries are aligned to 4 bytes.
        if offset & 3 != 0 {
            return IsDirectory::No;
        }
        // A minimal entry must fit.
        if offset + dir_rec_len(1) > block_size {
            return IsDirectory::No;
        }
        let entry: DirEntryHeader = from_bytes(&block[offset..]).unwrap();
        let inode = entry.inode;
        let rec_len = entry.rec_len as usize;
        let name_len = entry.name_len as usize;
        let file_type = entry.file_type;
        // The first block of a directory has the "." and ".." entries at the
        // start.
        let mut is_start = false;
        if offset == 0 && dir_rec_len(1) + dir_rec_len(2) <= block_size {
            let parent: DirEntryHeader = from_bytes(&block[dir_rec_len(1)..]).unwrap();
            let parent_rec_len = dir_rec_len(1);
            is_start = name_len == 1
                && block[8] == b'.'
                && rec_len == dir_rec_len(1)
                && (!self.image.has_filetype || file_type == FT_DIR)
                && parent.name_len == 2
                && block[parent_rec_len + 8] == b'.'
                && block[parent_rec_len + 9] == b'.'
                && (!self.image.has_filetype || parent.file_type == FT_DIR);
        }
        if start_block && !is_start {
            // The caller only wants start blocks; skip the extended test.
            return IsDirectory::No;
        }
        // A start block whose "." entry lost its inode is a reused block;
        // the journal may still hold the original copy.
        if is_start && inode == 0 {
            return IsDirectory::No;
        }
        let name_end = (offset + 8 + name_len).min(block_size);
        let name = &block[offset + 8..name_end];
        if name.len() < name_len {
            return IsDirectory::No;
        }
        // The inode of a deleted entry is not wiped (except for the first
        // entry of an extended block), so the inode range check holds even
        // for deleted directories.
        let mut zero_inode_warning = None;
        if inode == 0 && name_len > 0 {
            // A zero inode with a nonsensical name rejects the block; with a
            // plausible name it is accepted as a deleted tail entry.
            let mut non_ascii = false;
            for &c in name {
                match classify_filename_char(c) {
                    FilenameChar::Illegal => return IsDirectory::No,
                    FilenameChar::NonAscii => non_ascii = true,
                    _ => {}
                }
            }
            if certainly_linked && (offset != 0 || start_block) {
                let mut msg = String::from("WARNING: zero inode (name: ");
                if non_ascii {
                    msg.push_str("*contains non-ASCII characters* ");
                }
                msg.push_str(&format!(
                    "\"{}\"; block: {blocknr}; offset {offset:#x})",
                    escape_name(name)
                ));
                zero_inode_warning = Some(msg);
            }
        }
        if inode > self.image.inode_count {
            return IsDirectory::No;
        }
        // File names are at least one character long.
        if name_len == 0 {
            return IsDirectory::No;
        }
        // The record length must make sense.
        if rec_len & 3 != 0 || rec_len < dir_rec_len(name_len) || offset + rec_len > block_size {
            return IsDirectory::No;
        }
        // Extra paranoia when the whole block appears to be a single entry.
        if rec_len == block_size
            && ((self.image.has_filetype && file_type == FT_UNKNOWN)
                || file_type >= FT_MAX
                || name_len == 1
                || (name_len >= 2 && name[0] == b'_' && name[1] == b'Z'))
        {
            return IsDirectory::No;
        }
        // The record must chain to the end of the block.
        if offset + rec_len != block_size
            && self.is_directory_block(
                block,
                blocknr,
                stats,
                false,
                certainly_linked,
                offset + rec_len,
            ) == IsDirectory::No
        {
            return IsDirectory::No;
        }
        // The name may only consist of certain characters.
        let mut ok = true;
        let mut illegal = false;
        let mut weird_characters = 0;
        for &c in name {
            match classify_filename_char(c) {
                FilenameChar::Illegal => {
                    ok = false;
                    illegal = true;
                    break;
                }
                FilenameChar::Ok => {}
                _ => {
                    weird_characters += 1;
                    stats.unlikely_characters += 1;
                }
            }
        }
        // When the user asked for a specific block, suppress nothing.
        if self.opts.block.is_some() {
            weird_characters = 0;
        }
        // Accept everything except names consisting of a single unlikely
        // character, unless --accept-all was given.
        if !self.opts.accept_all && name_len == 1 && weird_characters > 0 {
            ok = false;
        }
        if ok {
            if let Some(warning) = zero_inode_warning {
                eprintln!("{warning}");
            }
        }
        if !ok && !illegal {
            let escaped = escape_name(name);
            match self.accept.lookup(&escaped) {
                Some(verdict) => ok = verdict,
                None => {
                    // Record the name so the hint is printed only once.
                    self.accept.record_rejection(escaped.clone());
                    if certainly_linked {
                        eprintln!(
                            "\nWARNING: Rejecting possible directory (block {blocknr}) because an entry contains legal but unlikely characters."
                        );
                    } else {
                        eprintln!(
                            "\nWARNING: Rejecting a dir_entry (block {blocknr}) because it contains legal but unlikely characters."
                        );
                    }
                    eprintln!(
                        "         Use --ls --block {blocknr} to examine this possible directory block."
                    );
                    eprintln!(
                        "         If it looks like a directory to you, and '{escaped}'"
                    );
                    eprintln!(
                        "         looks like a filename that might belong in that directory, then add"
                    );
                    eprintln!(
                        "         --accept='{escaped}' as commandline parameter AND remove both stage* files!"
                    );
                }
            }
        }
        if ok {
            stats.entries += 1;
            if is_start {
                IsDirectory::Start
            } else {
                IsDirectory::Extended
            }
        } else {
            IsDirectory::No
        }
    }

    /// Returns the inode table block the given block holds inodes for, or 0.
    ///
    /// The block either lies inside an inode table itself, or is a journal
    /// copy of an inode table block.
    pub fn inode_block(&self, block: u32) -> u32 {
        if self.image.is_inode(block) {
            return block;
        }
        if !self.journal.is_journal(block) || self.journal.is_indirect(block) {
            return 0;
        }
        self.journal_block_contains_inodes(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_chars() {
        assert_eq!(classify_filename_char(0), FilenameChar::Illegal);
        assert_eq!(classify_filename_char(b'/'), FilenameChar::Illegal);
        assert_eq!(classify_filename_char(b'a'), FilenameChar::Ok);
        assert_eq!(classify_filename_char(b'.'), FilenameChar::Ok);
        assert_eq!(classify_filename_char(b'*'), FilenameChar::Unlikely);
        assert_eq!(classify_filename_char(b'|'), FilenameChar::Unlikely);
        assert_eq!(classify_filename_char(1), FilenameChar::NonAscii);
        assert_eq!(classify_filename_char(127), FilenameChar::NonAscii);
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_name(b"hello"), "hello");
        assert_eq!(escape_name(b"a\tb"), "a\\tb");
        assert_eq!(escape_name(b"a\\b"), "a\\\\b");
        assert_eq!(escape_name(&[1]), "\\001");
        assert_eq!(escape_name(&[0x1b]), "\\e");
    }
}

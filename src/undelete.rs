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

//! Selection of the best surviving version of an inode.

use crate::analyzer::Analyzer;
use crate::ext3::Inode;
use std::io;

/// The best surviving version of an inode.
pub enum UndeletedInode {
    /// The on-disk inode is not deleted; use it.
    Real(Inode),
    /// The on-disk inode is deleted but the journal holds an older,
    /// undeleted copy (with the given sequence number).
    Journal(u32, Inode),
    /// Every usable copy was deleted before `--after`.
    TooOld(Inode),
    /// No undeleted version survives.
    None,
}

impl Analyzer {
    /// Returns the most recent non-deleted version of the given inode: the
    /// on-disk inode if it is allocated and intact, otherwise the newest
    /// undeleted journal copy.
    pub fn pick_inode(&mut self, inode_number: u32) -> io::Result<UndeletedInode> {
        let real = self.inode(inode_number)?;
        if !real.is_deleted() {
            return Ok(UndeletedInode::Real(real));
        }
        // Journal copies come newest first. The first undeleted one wins; a
        // deleted copy older than --after means everything beyond it is
        // older still.
        for (sequence, copy) in self.copies_of_inode(inode_number)? {
            if !copy.is_deleted() {
                return Ok(UndeletedInode::Journal(sequence, copy));
            }
            if self.opts.after != 0 && (copy.dtime as i64) < self.opts.after {
                return Ok(UndeletedInode::TooOld(copy));
            }
        }
        Ok(UndeletedInode::None)
    }
}

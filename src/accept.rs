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

//! The allow-list for filenames containing legal but unlikely characters.
//!
//! Directory detection rejects names that accumulate unlikely characters
//! unless the user passed `--accept='<escaped name>'`. Rejections are also
//! recorded here so the accompanying hint is printed only once per name.

use std::collections::HashMap;

/// The set of filenames (in escaped form) the user accepted or that were
/// already reported.
#[derive(Default)]
pub struct AcceptSet {
    /// Escaped filename to verdict. `true` means accepted.
    names: HashMap<String, bool>,
}

impl AcceptSet {
    /// Creates the set from the names given on the command line.
    pub fn new<I: IntoIterator<Item = String>>(accepted: I) -> Self {
        Self {
            names: accepted.into_iter().map(|name| (name, true)).collect(),
        }
    }

    /// Returns the verdict for the given escaped name, if one was recorded.
    pub fn lookup(&self, escaped: &str) -> Option<bool> {
        self.names.get(escaped).copied()
    }

    /// Records a rejected name so its warning is not repeated.
    pub fn record_rejection(&mut self, escaped: String) {
        self.names.entry(escaped).or_insert(false);
    }

    /// Tells whether the user accepted any names explicitly.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

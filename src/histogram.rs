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

//! Inode timestamp and group histograms.
//!
//! Mostly useful to find the time window of a deletion: run with
//! `--histogram=dtime` over a wide `--after`/`--before` range and zoom in.

use crate::analyzer::Analyzer;
use crate::util::ctime;
use std::io;
use std::str::FromStr;

/// What to build the histogram over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HistKind {
    /// Last access times.
    Atime,
    /// Inode change times.
    Ctime,
    /// Content modification times.
    Mtime,
    /// Deletion times.
    Dtime,
    /// Deleted inodes per group.
    Group,
}

impl FromStr for HistKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atime" => Ok(Self::Atime),
            "ctime" => Ok(Self::Ctime),
            "mtime" => Ok(Self::Mtime),
            "dtime" => Ok(Self::Dtime),
            "group" => Ok(Self::Group),
            _ => Err(()),
        }
    }
}

/// The number of buckets of a time histogram.
const BUCKETS: usize = 50;
/// The width of the bar column.
const BAR_WIDTH: usize = 60;

impl Analyzer {
    /// Prints the histogram of the requested kind, restricted to
    /// `--after`/`--before` and `--group`.
    pub fn print_histogram(&mut self, kind: HistKind) -> io::Result<()> {
        if kind == HistKind::Group {
            return self.print_group_histogram();
        }
        let inode_count = self.image.inode_count;
        let after = self.opts.after;
        let before = self.opts.before;
        let mut times = Vec::new();
        for inode_number in 1..=inode_count {
            if let Some(group) = self.opts.group {
                if self.image.inode_to_group(inode_number) != group {
                    continue;
                }
            }
            let inode = self.inode(inode_number)?;
            let time = match kind {
                HistKind::Atime => inode.atime,
                HistKind::Ctime => inode.ctime,
                HistKind::Mtime => inode.mtime,
                HistKind::Dtime => {
                    if !inode.has_valid_dtime(inode_count) {
                        continue;
                    }
                    inode.dtime
                }
                HistKind::Group => unreachable!(),
            };
            if time == 0 {
                continue;
            }
            let time_signed = time as i64;
            if time_signed < after || (before != 0 && time_signed >= before) {
                continue;
            }
            times.push(time);
        }
        if times.is_empty() {
            println!("No timestamps in the given range.");
            return Ok(());
        }
        let min = *times.iter().min().unwrap();
        let max = *times.iter().max().unwrap();
        let span = (max - min).max(1);
        let mut buckets = [0u32; BUCKETS];
        for &time in &times {
            let index = ((time - min) as u64 * (BUCKETS as u64 - 1) / span as u64) as usize;
            buckets[index] += 1;
        }
        let largest = *buckets.iter().max().unwrap();
        for (index, &count) in buckets.iter().enumerate() {
            let start = min + (span as u64 * index as u64 / BUCKETS as u64) as u32;
            let bar_len = (count as usize * BAR_WIDTH) / largest as usize;
            println!("{start:>10} {} |{}{count}", ctime(start), "=".repeat(bar_len));
        }
        println!("Totals: {} timestamps in [{min}, {max}].", times.len());
        Ok(())
    }

    /// Prints the number of deleted inodes per group.
    fn print_group_histogram(&mut self) -> io::Result<()> {
        let inode_count = self.image.inode_count;
        let after = self.opts.after;
        let before = self.opts.before;
        let mut counts = vec![0u32; self.image.group_count as usize];
        for inode_number in 1..=inode_count {
            let inode = self.inode(inode_number)?;
            if !inode.has_valid_dtime(inode_count) {
                continue;
            }
            let dtime = inode.dtime as i64;
            if after != 0 && dtime < after {
                continue;
            }
            if before != 0 && dtime >= before {
                continue;
            }
            counts[self.image.inode_to_group(inode_number) as usize] += 1;
        }
        let largest = counts.iter().copied().max().unwrap_or(0).max(1);
        for (group, &count) in counts.iter().enumerate() {
            let bar_len = (count as usize * BAR_WIDTH) / largest as usize;
            println!("{group:>6} |{}{count}", "=".repeat(bar_len));
        }
        Ok(())
    }
}

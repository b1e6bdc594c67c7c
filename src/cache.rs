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

//! The textual stage caches.
//!
//! The two expensive analyses (the stage 1 whole-image scan and the stage 2
//! directory resolution) persist their results in plain text files next to
//! the current working directory, named after the device. The format is
//! editable by hand: `#` starts a comment line and the file must end with a
//! single `# END` line, which doubles as a truncation check.

use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;

/// The trailer every complete cache file ends with.
pub const END_MARKER: &[u8] = b"# END\n";

/// Tells whether a usable cache exists at the given path.
///
/// A cache is honored only if its last 6 bytes are exactly `# END\n`;
/// a missing or truncated file means the stage must run again.
pub fn is_valid(path: &Path) -> io::Result<bool> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len < END_MARKER.len() as u64 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-(END_MARKER.len() as i64)))?;
    let mut trailer = [0u8; 6];
    file.read_exact(&mut trailer)?;
    Ok(trailer == END_MARKER)
}

/// Returns the non-comment lines of a cache file.
pub fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        lines.push(line);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ext3grep-cache-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn trailer_validation() {
        let path = temp_path("trailer");
        assert!(!is_valid(&path).unwrap());
        let mut file = File::create(&path).unwrap();
        file.write_all(b"# Stage 1 data.\n12 : 34\n").unwrap();
        drop(file);
        assert!(!is_valid(&path).unwrap());
        let mut file = File::options().append(true).open(&path).unwrap();
        file.write_all(END_MARKER).unwrap();
        drop(file);
        assert!(is_valid(&path).unwrap());
        assert_eq!(read_lines(&path).unwrap(), vec!["12 : 34".to_owned()]);
        std::fs::remove_file(&path).unwrap();
    }
}

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

//! Restoring files, directories and symlinks to the output tree.
//!
//! Everything lands under `RESTORED_FILES/` in the current working
//! directory, keeping the reconstructed paths. Modes and timestamps are
//! copied from the recovered inode; directories that lack `u+wx` are created
//! with it and chmod-ed down afterwards.

use crate::analyzer::Analyzer;
use crate::display::mode_string;
use crate::display::FileMode;
use crate::ext3::Inode;
use crate::indirect::DIRECT_BIT;
use crate::undelete::UndeletedInode;
use std::ffi::CString;
use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

/// The output directory, relative to the current working directory.
pub const OUTPUT_DIR: &str = "RESTORED_FILES";

/// Sets the access and modification times of a path.
fn set_times(path: &Path, atime: u32, mtime: u32, follow: bool) -> io::Result<()> {
    let path_c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    let times = [
        libc::timeval {
            tv_sec: atime as libc::time_t,
            tv_usec: 0,
        },
        libc::timeval {
            tv_sec: mtime as libc::time_t,
            tv_usec: 0,
        },
    ];
    let ret = unsafe {
        if follow {
            libc::utimes(path_c.as_ptr(), times.as_ptr())
        } else {
            libc::lutimes(path_c.as_ptr(), times.as_ptr())
        }
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Analyzer {
    /// Creates the output root, once.
    fn ensure_output_dir(&self) -> io::Result<()> {
        match fs::DirBuilder::new().mode(0o755).create(OUTPUT_DIR) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Restores the file, directory or symlink at the given recovered path.
    pub fn restore_file(&mut self, path: &str) -> io::Result<()> {
        if path.is_empty() || path.starts_with('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid path to restore: \"{path}\""),
            ));
        }
        self.init_files()?;
        self.ensure_output_dir()?;
        let inode_number = match self.path_to_inode.get(path) {
            Some(&inode) => inode,
            None => match self.all_directories.get(path) {
                Some(&dir_id) => self.directory(dir_id).inode,
                None => {
                    println!("Cannot find an inode number for file \"{path}\".");
                    return Ok(());
                }
            },
        };
        // Make sure the parent directory exists in the output tree.
        if let Some(slash) = path.rfind('/') {
            let dirname = &path[..slash];
            let out_dir = PathBuf::from(OUTPUT_DIR).join(dirname);
            match fs::symlink_metadata(&out_dir) {
                Ok(metadata) => {
                    if !metadata.is_dir() {
                        return Err(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            format!(
                                "failed to recover {path}: {} exists but is not a directory!",
                                out_dir.display()
                            ),
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.restore_file(dirname)?;
                }
                Err(e) => {
                    eprintln!("WARNING: lstat: {}: {e}", out_dir.display());
                    println!("Failed to recover {path}");
                    return Ok(());
                }
            }
        }
        self.restore_inode_to(inode_number, path, true)
    }

    /// Restores the given inode under `RESTORED_FILES/inode.<N>`.
    pub fn restore_inode(&mut self, inode_number: u32) -> io::Result<()> {
        if inode_number == 0 || inode_number > self.image.inode_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("--restore-inode: inode {inode_number} is out of range"),
            ));
        }
        self.ensure_output_dir()?;
        self.restore_inode_to(inode_number, &format!("inode.{inode_number}"), false)
    }

    /// Restores every recovered path.
    pub fn restore_all(&mut self) -> io::Result<()> {
        for path in self.all_paths()? {
            self.restore_file(&path)?;
        }
        Ok(())
    }

    /// Restores one inode to the given path under the output root.
    ///
    /// `recurse_children` restores the directory's recovered children too;
    /// it is off for `--restore-inode`, whose output name is not a
    /// reconstructed path.
    fn restore_inode_to(
        &mut self,
        inode_number: u32,
        outfile: &str,
        recurse_children: bool,
    ) -> io::Result<()> {
        let out_path = PathBuf::from(OUTPUT_DIR).join(outfile);
        let real_inode = self.inode(inode_number)?;
        if real_inode.is_directory() {
            return self.restore_directory(&real_inode, outfile, &out_path, recurse_children);
        }
        // Not a directory: find the best surviving version of the inode.
        let inode = match self.pick_inode(inode_number)? {
            UndeletedInode::Real(inode) | UndeletedInode::Journal(_, inode) => inode,
            UndeletedInode::TooOld(copy) => {
                let after = self.opts.after;
                let dtime = copy.dtime;
                println!(
                    "Not undeleting \"{outfile}\" because it was deleted before {after} ({dtime})"
                );
                return Ok(());
            }
            UndeletedInode::None => {
                println!("Cannot find an undeleted inode for file \"{outfile}\".");
                return Ok(());
            }
        };
        if inode.is_regular_file() {
            self.restore_regular_file(&inode, outfile, &out_path)
        } else if inode.is_symlink() {
            self.restore_symlink(&inode, outfile, &out_path)
        } else {
            println!(
                "WARNING: Not recovering \"{outfile}\", which is a {}",
                mode_string(inode.mode)
            );
            Ok(())
        }
    }

    /// Restores a directory: create it, then its surviving children.
    fn restore_directory(
        &mut self,
        inode: &Inode,
        outfile: &str,
        out_path: &Path,
        recurse_children: bool,
    ) -> io::Result<()> {
        let mode = (inode.mode & 0o7777) as u32;
        if mode & 0o300 != 0o300 {
            let raw_mode = inode.mode;
            println!(
                "Note: Restoring directory {} with mode {} although its original mode is {}.",
                out_path.display(),
                FileMode(raw_mode | 0o300),
                FileMode(raw_mode)
            );
        }
        match fs::DirBuilder::new().mode(mode | 0o300).create(out_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
        // Restore the children before dropping write permission.
        if recurse_children {
            let prefix = format!("{outfile}/");
            let children: Vec<String> = self
                .all_paths()?
                .into_iter()
                .filter(|path| {
                    path.strip_prefix(&prefix)
                        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
                })
                .collect();
            for child in children {
                self.restore_file(&child)?;
            }
        }
        if let Err(e) = fs::set_permissions(out_path, fs::Permissions::from_mode(mode)) {
            println!("WARNING: failed to set mode on directory {}: {e}", out_path.display());
        }
        if let Err(e) = set_times(out_path, inode.atime, inode.mtime, true) {
            println!(
                "WARNING: Failed to set access and modification time on {}: {e}",
                out_path.display()
            );
        }
        Ok(())
    }

    /// Restores the content of a regular file, preserving holes.
    fn restore_regular_file(
        &mut self,
        inode: &Inode,
        outfile: &str,
        out_path: &Path,
    ) -> io::Result<()> {
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(out_path)?;
        println!("Restoring {outfile}");
        // Enumerate the data blocks with their logical indices first; a
        // reused indirect block cuts the list short but what came before it
        // is still worth writing.
        let mut blocks: Vec<(u32, u64)> = Vec::new();
        let corrupted = self.for_each_block_of(inode, DIRECT_BIT, false, &mut |block, index| {
            blocks.push((block, index))
        })?;
        let size = inode.size();
        let block_size = self.image.block_size as u64;
        let mut buf = vec![0u8; block_size as usize];
        for (block, index) in blocks {
            let offset = index * block_size;
            if offset >= size {
                break;
            }
            self.image.read_block(block, &mut buf)?;
            let len = (size - offset).min(block_size) as usize;
            out.seek(SeekFrom::Start(offset))?;
            out.write_all(&buf[..len])?;
        }
        // Holes at the end of the file only exist through the recorded size.
        out.set_len(size)?;
        drop(out);
        if corrupted {
            println!(
                "WARNING: Failed to restore {outfile}: encountered a reused or corrupted (double/triple) indirect block!"
            );
            println!("Running the block iterator again with diagnostic messages ON:");
            self.for_each_block_of(inode, DIRECT_BIT, true, &mut |_, _| {})?;
            println!("The partly restored file should be renamed.");
        }
        let mode = (inode.mode & 0o7777) as u32;
        if let Err(e) = fs::set_permissions(out_path, fs::Permissions::from_mode(mode)) {
            println!("WARNING: failed to set file mode on {}: {e}", out_path.display());
        }
        if let Err(e) = set_times(out_path, inode.atime, inode.mtime, true) {
            println!(
                "WARNING: Failed to set access and modification time on {}: {e}",
                out_path.display()
            );
        }
        Ok(())
    }

    /// Returns the target of a symlink inode.
    ///
    /// Short targets live in place of the block pointers; longer ones in the
    /// first data block.
    pub fn symlink_target(&mut self, inode: &Inode) -> io::Result<Vec<u8>> {
        if inode.used_sectors == 0 {
            return Ok(inode.inline_symlink_target());
        }
        let first = inode.block(0);
        if first == 0 {
            return Ok(Vec::new());
        }
        let buf = self.image.read_block_vec(first)?;
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(buf[..len].to_vec())
    }

    /// Restores a symbolic link.
    fn restore_symlink(&mut self, inode: &Inode, outfile: &str, out_path: &Path) -> io::Result<()> {
        let target = self.symlink_target(inode)?;
        if target.is_empty() {
            println!("WARNING: Failed to recover {outfile}: symlink has zero length!");
            return Ok(());
        }
        let target = std::ffi::OsStr::from_bytes(&target).to_os_string();
        if let Err(e) = symlink(&target, out_path) {
            println!("WARNING: symlink: {}: {e}", out_path.display());
            return Ok(());
        }
        if let Err(e) = set_times(out_path, inode.atime, inode.mtime, false) {
            println!(
                "WARNING: Failed to set access and modification time on {}: {e}",
                out_path.display()
            );
        }
        Ok(())
    }
}

/// Prints or restores every recovered name.
///
/// With `restore` set this is `--restore-all`; otherwise `--dump-names`.
pub fn dump_names(analyzer: &mut Analyzer, restore: bool) -> io::Result<()> {
    for path in analyzer.all_paths()? {
        if restore {
            analyzer.restore_file(&path)?;
        } else if analyzer.opts.show_path_inodes {
            let inode = analyzer
                .path_to_inode
                .get(&path)
                .copied()
                .or_else(|| {
                    analyzer
                        .all_directories
                        .get(&path)
                        .map(|&id| analyzer.directory(id).inode)
                });
            match inode {
                Some(inode) => println!("{path} <{inode}>"),
                None => println!("{path}"),
            }
        } else {
            println!("{path}");
        }
    }
    Ok(())
}

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

//! `ext3grep` investigates an ext2/ext3 partition image and recovers deleted
//! files from the information left in the journal and in unallocated
//! directory blocks.

use ext3grep::accept::AcceptSet;
use ext3grep::analyzer::Analyzer;
use ext3grep::analyzer::Options;
use ext3grep::fatal;
use ext3grep::histogram::HistKind;
use ext3grep::image;
use ext3grep::image::Image;
use ext3grep::restore::dump_names;
use ext3grep::usage_error;
use ext3grep::PROG;
use std::env;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// If true, print the version and exit.
    version: bool,

    // Action options.
    /// Print the contents of the superblock.
    superblock: bool,
    /// Show info on this inode.
    inode: Option<u32>,
    /// Show info on this block.
    block: Option<u32>,
    /// Show info on the journal.
    journal: bool,
    /// Translate and show a journal-relative block.
    journal_block: Option<u32>,
    /// Show the transaction with this sequence number.
    journal_transaction: Option<u32>,
    /// Print every recovered path.
    dump_names: bool,
    /// Paths to restore (repeatable).
    restore_file: Vec<String>,
    /// Inodes to restore, as a comma-separated list.
    restore_inode: Option<String>,
    /// Restore everything that can be restored.
    restore_all: bool,
    /// Print inodes reached by more than one path.
    show_hardlinks: bool,
    /// Print every journal copy of this inode.
    show_journal_inodes: Option<u32>,
    /// Print the block an inode resides in.
    inode_to_block: Option<u32>,
    /// Print blocks containing this string.
    search: Option<String>,
    /// Print blocks starting with this string.
    search_start: Option<String>,
    /// Print inodes referring to this block.
    search_inode: Option<u32>,
    /// Print allocated but zeroed inodes.
    search_zeroed_inodes: bool,
    /// Histogram kind.
    histogram: Option<String>,
    /// Print the inode/dirblock table of this directory.
    inode_dirblock_table: Option<String>,

    // Filter options.
    /// Restrict to this group.
    group: Option<u32>,
    /// Only show/process directories.
    directory: bool,
    /// Only show/process entries deleted on or after this time.
    after: Option<i64>,
    /// Only show/process entries deleted before this time.
    before: Option<i64>,
    /// Only show/process deleted entries.
    deleted: bool,
    /// Only show/process allocated inodes.
    allocated: bool,
    /// Only show/process unallocated inodes.
    unallocated: bool,
    /// Also show/process reallocated entries.
    reallocated: bool,
    /// Also show/process entries with a zero inode.
    zeroed_inodes: bool,
    /// Maximum recursion depth.
    depth: Option<u32>,
    /// Accepted filenames (escaped form).
    accept: Vec<String>,
    /// Accept every filename.
    accept_all: bool,
    /// Parent/child dtime skew tolerance, in seconds.
    dtime_skew: Option<u32>,

    // Display options.
    /// Print extra detail.
    print: bool,
    /// List directory blocks.
    ls: bool,
    /// Show inode numbers next to printed paths.
    show_path_inodes: bool,

    /// The device or image to analyze.
    device: Option<PathBuf>,
}

impl Args {
    /// Returns the number of action options given.
    fn action_count(&self) -> usize {
        [
            self.superblock,
            self.inode.is_some(),
            self.block.is_some(),
            self.journal,
            self.journal_block.is_some(),
            self.journal_transaction.is_some(),
            self.dump_names,
            !self.restore_file.is_empty(),
            self.restore_inode.is_some(),
            self.restore_all,
            self.show_hardlinks,
            self.show_journal_inodes.is_some(),
            self.inode_to_block.is_some(),
            self.search.is_some(),
            self.search_start.is_some(),
            self.search_inode.is_some(),
            self.search_zeroed_inodes,
            self.histogram.is_some(),
            self.inode_dirblock_table.is_some(),
        ]
        .into_iter()
        .filter(|&given| given)
        .count()
    }

    /// Tells whether any action option was given.
    fn has_action(&self) -> bool {
        self.action_count() > 0
    }
}

/// Splits `--option=value` into its two parts.
fn split_value(arg: &str) -> (&str, Option<&str>) {
    match arg.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (arg, None),
    }
}

/// Returns the value of an option, either from its `=value` part or from the
/// next argument.
fn option_value(
    name: &str,
    inline: Option<&str>,
    iter: &mut impl Iterator<Item = String>,
) -> String {
    match inline {
        Some(value) => value.to_owned(),
        None => iter
            .next()
            .unwrap_or_else(|| usage_error(format_args!("{name}: missing argument"))),
    }
}

/// Parses an integer option value.
fn int_value<T: std::str::FromStr>(name: &str, value: &str) -> T {
    value
        .parse()
        .unwrap_or_else(|_| usage_error(format_args!("{name}: invalid value `{value}`")))
}

fn parse_args() -> Args {
    let mut res = Args::default();
    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        let (name, inline) = split_value(&arg);
        match name {
            "-h" | "--help" => res.help = true,
            "-v" | "--version" => res.version = true,
            "--superblock" => res.superblock = true,
            "--inode" => res.inode = Some(int_value(name, &option_value(name, inline, &mut iter))),
            "--block" => res.block = Some(int_value(name, &option_value(name, inline, &mut iter))),
            "--journal" => res.journal = true,
            "--journal-block" => {
                res.journal_block = Some(int_value(name, &option_value(name, inline, &mut iter)))
            }
            "--journal-transaction" => {
                res.journal_transaction =
                    Some(int_value(name, &option_value(name, inline, &mut iter)))
            }
            "--dump-names" => res.dump_names = true,
            "--restore-file" => res.restore_file.push(option_value(name, inline, &mut iter)),
            "--restore-inode" => res.restore_inode = Some(option_value(name, inline, &mut iter)),
            "--restore-all" => res.restore_all = true,
            "--show-hardlinks" => res.show_hardlinks = true,
            "--show-journal-inodes" => {
                res.show_journal_inodes =
                    Some(int_value(name, &option_value(name, inline, &mut iter)))
            }
            "--inode-to-block" => {
                res.inode_to_block = Some(int_value(name, &option_value(name, inline, &mut iter)))
            }
            "--search" => res.search = Some(option_value(name, inline, &mut iter)),
            "--search-start" => res.search_start = Some(option_value(name, inline, &mut iter)),
            "--search-inode" => {
                res.search_inode = Some(int_value(name, &option_value(name, inline, &mut iter)))
            }
            "--search-zeroed-inodes" => res.search_zeroed_inodes = true,
            "--histogram" => res.histogram = Some(option_value(name, inline, &mut iter)),
            "--inode-dirblock-table" => {
                res.inode_dirblock_table = Some(option_value(name, inline, &mut iter))
            }
            "--group" => res.group = Some(int_value(name, &option_value(name, inline, &mut iter))),
            "--directory" => res.directory = true,
            "--after" => res.after = Some(int_value(name, &option_value(name, inline, &mut iter))),
            "--before" => {
                res.before = Some(int_value(name, &option_value(name, inline, &mut iter)))
            }
            "--deleted" => res.deleted = true,
            "--allocated" => res.allocated = true,
            "--unallocated" => res.unallocated = true,
            "--reallocated" => res.reallocated = true,
            "--zeroed-inodes" => res.zeroed_inodes = true,
            "--depth" => res.depth = Some(int_value(name, &option_value(name, inline, &mut iter))),
            "--accept" => res.accept.push(option_value(name, inline, &mut iter)),
            "--accept-all" => res.accept_all = true,
            "--dtime-skew" => {
                res.dtime_skew = Some(int_value(name, &option_value(name, inline, &mut iter)))
            }
            "--print" => res.print = true,
            "--ls" => res.ls = true,
            "--show-path-inodes" => res.show_path_inodes = true,
            _ if name.starts_with('-') => {
                usage_error(format_args!("unrecognized option '{arg}'"))
            }
            _ => {
                if res.device.is_some() {
                    usage_error("too many non-options");
                }
                res.device = Some(PathBuf::from(arg));
            }
        }
    }
    res
}

/// Prints command help.
fn print_help() {
    println!("Usage: {PROG} [options] device");
    println!();
    println!("Analyzes an ext2/ext3 image and recovers deleted files into RESTORED_FILES/.");
    println!();
    println!("Actions:");
    println!(" --superblock            Print the contents of the superblock.");
    println!(" --inode ino             Show info on inode 'ino'; inode 2 is the root.");
    println!(" --block blk             Show info on block 'blk'.");
    println!(" --journal               Show info on the journal.");
    println!(" --journal-block jblk    Show info on the journal-relative block 'jblk'.");
    println!(" --journal-transaction seq");
    println!("                         Show the journal transaction with sequence number 'seq'.");
    println!(" --dump-names            Print the paths of all files found.");
    println!(" --restore-file 'path'   Restore the given path (repeatable).");
    println!(" --restore-inode ino[,ino,...]");
    println!("                         Restore inodes as RESTORED_FILES/inode.<ino>.");
    println!(" --restore-all           Restore everything that can be restored.");
    println!(" --show-hardlinks        Show inodes with more than one recovered path.");
    println!(" --show-journal-inodes ino");
    println!("                         Show copies of inode 'ino' still in the journal.");
    println!(" --inode-to-block ino    Print the block that inode 'ino' resides in.");
    println!(" --search str            Print blocks containing 'str'.");
    println!(" --search-start str      Print blocks starting with 'str'.");
    println!(" --search-inode blk      Print inodes referring to block 'blk'.");
    println!(" --search-zeroed-inodes  Print allocated inodes that are filled with zeroes.");
    println!(" --histogram=[atime|ctime|mtime|dtime|group]");
    println!("                         Print a histogram of timestamps, or of deleted inodes per group.");
    println!(" --inode-dirblock-table dir");
    println!("                         Print the inode/dirblock evidence table of directory 'dir'.");
    println!();
    println!("Filters:");
    println!(" --group grp             Only process group 'grp'.");
    println!(" --directory             Only show/process directory inodes.");
    println!(" --after dtime           Only entries deleted on or after 'dtime'.");
    println!(" --before dtime          Only entries deleted before 'dtime'.");
    println!(" --deleted               Only show/process deleted entries.");
    println!(" --allocated             Only show/process allocated inodes.");
    println!(" --unallocated           Only show/process unallocated inodes.");
    println!(" --reallocated           Also show/process reallocated entries.");
    println!(" --zeroed-inodes         Also show/process entries with a zero inode.");
    println!(" --depth depth           Directory recursion depth.");
    println!(" --accept 'name'         Accept the (escaped) filename 'name' (repeatable).");
    println!(" --accept-all            Accept all filenames.");
    println!(" --dtime-skew secs       Parent/child deletion time skew tolerance (default 60).");
    println!();
    println!("Display:");
    println!(" --print                 Print extra detail.");
    println!(" --ls                    List the entries of directory blocks.");
    println!(" --show-path-inodes      Show the inode of each printed path.");
}

fn main() {
    let mut args = parse_args();
    if args.help {
        print_help();
        exit(0);
    }
    if args.version {
        println!("{PROG} {}", env!("CARGO_PKG_VERSION"));
        exit(0);
    }
    // Combining --journal with --superblock, --block or the journal-relative
    // actions is meaningful; everything else is one action at a time.
    let combinable = args.journal
        && (args.superblock
            || args.block.is_some()
            || args.journal_block.is_some()
            || args.journal_transaction.is_some());
    if args.action_count() > if combinable { 2 } else { 1 } {
        usage_error("only one action can be given at a time");
    }
    if let Some(kind) = args.histogram.clone() {
        if kind.parse::<HistKind>().is_err() {
            usage_error(format_args!("--histogram: unknown histogram kind `{kind}`"));
        }
        // A time histogram without explicit bounds gets the widest range.
        if kind != "group" {
            if args.before.is_none() {
                args.before = Some(i32::MAX as i64);
                println!(
                    "{PROG}: --histogram={kind}: no --before given, assuming --before={}",
                    i32::MAX
                );
            }
            if args.after.is_none() {
                args.after = Some(1);
                println!("{PROG}: --histogram={kind}: no --after given, assuming --after=1");
            }
        }
    }
    if let (Some(after), Some(before)) = (args.after, args.before) {
        if after >= before {
            usage_error("--after must be smaller than --before");
        }
    }
    let Some(device) = args.device.clone() else {
        usage_error("missing device name");
    };
    // Sanity checks on the device.
    let metadata = std::fs::metadata(&device)
        .unwrap_or_else(|e| fatal(format_args!("{}: {e}", device.display())));
    if metadata.is_dir() {
        fatal(format_args!(
            "\"{}\" is a directory. You need to use the raw ext3 filesystem device (or a copy thereof).",
            device.display()
        ));
    }
    {
        let file = std::fs::File::open(&device)
            .unwrap_or_else(|e| fatal(format_args!("{}: {e}", device.display())));
        let size = image::device_size(&device, &file)
            .unwrap_or_else(|e| fatal(format_args!("{}: {e}", device.display())));
        if size < ext3grep::ext3::SUPERBLOCK_OFFSET + 1024 {
            fatal(format_args!(
                "\"{}\" is not an ext3 filesystem; it's WAY too small ({size} bytes).",
                device.display()
            ));
        }
    }
    let image = Image::open(&device)
        .unwrap_or_else(|e| fatal(format_args!("{}: {e}", device.display())));
    let opts = Options {
        group: args.group,
        block: args.block,
        depth: args.depth.unwrap_or(0),
        deleted: args.deleted,
        directory: args.directory,
        after: args.after.unwrap_or(0),
        before: args.before.unwrap_or(0),
        allocated: args.allocated,
        unallocated: args.unallocated,
        reallocated: args.reallocated,
        zeroed_inodes: args.zeroed_inodes,
        show_path_inodes: args.show_path_inodes,
        accept_all: args.accept_all,
        dtime_skew: args.dtime_skew.unwrap_or(60),
    };
    let accept = AcceptSet::new(args.accept.clone());
    run(args, image, opts, accept).unwrap_or_else(|e| fatal(e));
}

/// Validates ranges and executes the requested action.
fn run(args: Args, image: Image, opts: Options, accept: AcceptSet) -> std::io::Result<()> {
    // Range checks that only need the superblock, before any scan begins.
    let inode_count = image.inode_count;
    let block_count = image.block_count;
    let group_count = image.group_count;
    for inode in [args.inode, args.show_journal_inodes, args.inode_to_block]
        .into_iter()
        .flatten()
    {
        if inode == 0 || inode > inode_count {
            usage_error(format_args!(
                "inode {inode} is out of range. There are only {inode_count} inodes."
            ));
        }
    }
    for block in [args.block, args.search_inode].into_iter().flatten() {
        if block >= block_count {
            usage_error(format_args!(
                "block {block} is out of range. There are only {block_count} blocks."
            ));
        }
    }
    if let Some(group) = args.group {
        if group >= group_count {
            usage_error(format_args!("--group: group {group} is out of range."));
        }
    }
    let mut analyzer = Analyzer::new(image, opts, accept)?;
    if let Some(jblk) = args.journal_block {
        if jblk >= analyzer.journal.maxlen {
            usage_error(format_args!(
                "--journal-block: block {jblk} is out of range. There are only {} blocks in the journal.",
                analyzer.journal.maxlen
            ));
        }
    }
    if args.superblock && !args.journal {
        analyzer.print_superblock();
        println!();
    }
    if args.journal
        && (args.superblock
            || (args.block.is_none()
                && args.journal_block.is_none()
                && args.journal_transaction.is_none()))
    {
        analyzer.print_journal_superblock();
        println!();
    }
    // Print a group summary when there is nothing more specific to do.
    if !args.has_action() {
        analyzer.print_superblock();
        println!();
        println!("Number of groups: {group_count}");
        match args.group {
            Some(group) => analyzer.print_group_descriptor(group),
            None => {
                for group in 0..group_count {
                    analyzer.print_group_descriptor(group);
                }
            }
        }
        println!();
        println!("No action was specified. For example, specify one of:");
        println!("    --inode ino            Show info on inode 'ino'; inode 2 is the root.");
        println!("    --block blk [--ls]     Show info on block 'blk'.");
        println!("    --histogram=dtime --after=1000000000 --before=1400000000");
        println!("                           Show deletion-time histogram (zoom in afterwards).");
        println!("    --help                 Show all possible command line options.");
        return Ok(());
    }
    if let Some(inode) = args.inode {
        analyzer.print_inode_report(inode)?;
    }
    if let Some(block) = args.block {
        if args.journal {
            analyzer.print_block_descriptors(block);
        } else {
            analyzer.print_block_report(block, args.print, args.ls)?;
        }
    }
    if let Some(jblk) = args.journal_block {
        let block = analyzer.journal_block_to_real_block(jblk)?;
        println!("Journal block {jblk} is filesystem block {block}.");
        analyzer.print_block_report(block, args.print, args.ls)?;
    }
    if let Some(sequence) = args.journal_transaction {
        analyzer.print_journal_transaction(sequence);
    }
    if let Some(kind) = &args.histogram {
        let kind: HistKind = kind.parse().expect("validated before any scan");
        analyzer.print_histogram(kind)?;
    }
    if let Some(pattern) = &args.search {
        analyzer.search_blocks(pattern.as_bytes(), false)?;
    }
    if let Some(pattern) = &args.search_start {
        analyzer.search_blocks(pattern.as_bytes(), true)?;
    }
    if let Some(block) = args.search_inode {
        analyzer.search_inode_refs(block)?;
    }
    if args.search_zeroed_inodes {
        analyzer.search_zeroed_inodes()?;
    }
    if let Some(inode) = args.inode_to_block {
        analyzer.print_inode_to_block(inode);
    }
    if let Some(path) = &args.inode_dirblock_table {
        analyzer.print_inode_dirblock_table(path)?;
    }
    if args.dump_names {
        dump_names(&mut analyzer, false)?;
    }
    for path in &args.restore_file {
        analyzer.restore_file(path)?;
    }
    if let Some(list) = &args.restore_inode {
        for part in list.split(',') {
            let inode: u32 = part.trim().parse().unwrap_or_else(|_| {
                usage_error(format_args!("--restore-inode: invalid inode `{part}`"))
            });
            analyzer.restore_inode(inode)?;
        }
    }
    if args.restore_all {
        analyzer.restore_all()?;
    }
    if args.show_hardlinks {
        analyzer.show_hardlinks()?;
    }
    if let Some(inode) = args.show_journal_inodes {
        analyzer.show_journal_inodes(inode)?;
    }
    Ok(())
}

// fatscope: inspect and edit FAT12/16/32 and exFAT filesystem images.

mod hexdump;
mod shell;

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use fatscope_filesystems::fat_common::attributes::*;
use fatscope_filesystems::{open_image, FileStat, FilesystemOps};

use hexdump::hexdump;
use shell::Shell;

#[derive(Parser)]
#[command(name = "fatscope")]
#[command(version, about = "Dump and edit FAT/exFAT filesystem images", long_about = None)]
struct Cli {
    /// Filesystem image or block device
    image: PathBuf,

    /// File path inside the image to show status for
    file: Option<String>,

    /// Traverse all directories and print the full filesystem report
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Dump the sector containing this byte offset
    #[arg(short = 'b', long = "byte")]
    byte: Option<u64>,

    /// Dump this cluster
    #[arg(short = 'c', long = "cluster")]
    cluster: Option<u32>,

    /// List the directory at this path
    #[arg(short = 'd', long = "directory")]
    directory: Option<String>,

    /// Print the FAT entry of this cluster
    #[arg(short = 'f', long = "fat")]
    fat: Option<u32>,

    /// Prompt for filesystem operations
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,

    /// Send output to a file rather than stdout
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Suppress everything but errors
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Open the image read-only
    #[arg(short = 'r', long = "ro")]
    read_only: bool,

    /// Convert a string to upper case through the up-case table
    #[arg(short = 'u', long = "upper")]
    upper: Option<String>,

    /// Report informational messages
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        LevelFilter::Error
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let mut fs = open_image(&cli.image, cli.read_only)?;

    if cli.interactive {
        Shell::new(fs.as_mut()).run()?;
        return Ok(());
    }

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };

    let has_action = cli.byte.is_some()
        || cli.cluster.is_some()
        || cli.directory.is_some()
        || cli.fat.is_some()
        || cli.upper.is_some()
        || cli.file.is_some();

    if !has_action || cli.all {
        fs.statfs(out.as_mut())?;
    }

    if let Some(dir) = &cli.directory {
        let cluster = fs.lookup(fs.root_cluster(), dir)?;
        let entries = fs.readdir(cluster)?;
        writeln!(out, "Read {:?} Directory ({} entries).", dir, entries.len())?;
        for entry in &entries {
            write!(out, "{} ", entry.name)?;
        }
        writeln!(out)?;
    }

    if cli.all {
        fs.info(out.as_mut())?;
    }

    if let Some(cluster) = cli.fat {
        let entry = fs.get_fat(cluster)?;
        writeln!(out, "Get: Cluster {} is FAT entry {:08x}", cluster, entry)?;
    }

    if let Some(src) = &cli.upper {
        let converted = fs.convert(src)?;
        writeln!(out, "Convert: {} -> {}", src, converted)?;
    }

    if let Some(offset) = cli.byte {
        let sector = offset / fs.sector_size() as u64;
        let data = fs.read_sector_raw(sector)?;
        writeln!(out, "Sector #{}:", sector)?;
        hexdump(out.as_mut(), &data)?;
    }

    if let Some(cluster) = cli.cluster {
        let data = fs.read_cluster_raw(cluster)?;
        writeln!(out, "Cluster #{}:", cluster)?;
        hexdump(out.as_mut(), &data)?;
    }

    if let Some(path) = &cli.file {
        let (dir_path, name) = match path.rfind('/') {
            Some(pos) if pos > 0 => (&path[..pos], &path[pos + 1..]),
            Some(_) => ("/", &path[1..]),
            None => ("/", path.as_str()),
        };
        let parent = fs.lookup(fs.root_cluster(), dir_path)?;
        let stat = fs.stat(name, parent)?;
        print_stat(out.as_mut(), &stat)?;
    }

    Ok(())
}

fn print_stat(out: &mut dyn Write, stat: &FileStat) -> io::Result<()> {
    writeln!(out, "File Name:   {}", stat.name)?;
    writeln!(out, "File Size:   {}", stat.data_len)?;
    writeln!(out, "Clusters:    {}", stat.clusters)?;
    writeln!(out, "First Clu:   {}", stat.first_cluster)?;

    let mut flags = String::new();
    for (bit, ch) in [
        (ATTR_READ_ONLY, 'R'),
        (ATTR_HIDDEN, 'H'),
        (ATTR_SYSTEM, 'S'),
        (ATTR_DIRECTORY, 'D'),
        (ATTR_ARCHIVE, 'A'),
    ] {
        flags.push(if stat.attr & bit != 0 { ch } else { '-' });
    }
    writeln!(out, "File Attr:   {}", flags)?;
    writeln!(
        out,
        "File Flags:  {}/ {}",
        if stat.flags & 0x02 != 0 {
            "NoFatChain"
        } else {
            "FatChain"
        },
        if stat.flags & 0x01 != 0 {
            "AllocationPossible"
        } else {
            "AllocationImpossible"
        }
    )?;
    writeln!(out, "Access Time: {}", stat.atime)?;
    writeln!(out, "Modify Time: {}", stat.mtime)?;
    writeln!(out, "Create Time: {}", stat.ctime)?;
    writeln!(out)?;
    Ok(())
}

// Interactive shell
// Whitespace-tokenised commands over the open image. Keeps a current
// directory cluster and a PWD string; create/remove/fill reload the
// directory so the next listing reflects the mutation.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use log::warn;

use fatscope_filesystems::fat_common::attributes::*;
use fatscope_filesystems::{CreateOptions, FilesystemOps, DENTRY_SIZE};

use crate::hexdump::hexdump;

pub struct Shell<'a> {
    fs: &'a mut dyn FilesystemOps,
    cluster: u32,
    env: HashMap<String, String>,
}

impl<'a> Shell<'a> {
    pub fn new(fs: &'a mut dyn FilesystemOps) -> Self {
        let cluster = fs.root_cluster();
        let mut env = HashMap::new();
        env.insert("PWD".to_string(), "/".to_string());
        Self { fs, cluster, env }
    }

    pub fn run(&mut self) -> io::Result<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();

        println!(
            "Welcome to fatscope {} (Interactive Mode)\n",
            env!("CARGO_PKG_VERSION")
        );
        let _ = self.fs.readdir(self.cluster);

        let mut line = String::new();
        loop {
            write!(stdout, "{}> ", self.env["PWD"])?;
            stdout.flush()?;

            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            let args: Vec<&str> = line.split_whitespace().collect();
            if args.is_empty() {
                continue;
            }
            if self.execute(&args) {
                break;
            }
        }
        Ok(())
    }

    /// Dispatch one command; returns true when the shell should exit.
    fn execute(&mut self, args: &[&str]) -> bool {
        match args[0] {
            "ls" => self.cmd_ls(args),
            "cd" => self.cmd_cd(args),
            "cluster" => self.cmd_cluster(args),
            "entry" => self.cmd_entry(args),
            "alloc" => self.cmd_alloc(args),
            "release" => self.cmd_release(args),
            "fat" => self.cmd_fat(args),
            "create" => self.cmd_create(args),
            "remove" => self.cmd_remove(args),
            "trim" => self.cmd_trim(args),
            "fill" => self.cmd_fill(args),
            "tail" => self.cmd_tail(args),
            "help" => self.cmd_help(),
            "exit" => {
                println!("Goodbye!");
                return true;
            }
            other => println!("{}: command not found", other),
        }
        false
    }

    fn cmd_ls(&mut self, _args: &[&str]) {
        let entries = match self.fs.readdir(self.cluster) {
            Ok(entries) => entries,
            Err(e) => {
                println!("ls: failed to load directory: {}", e);
                return;
            }
        };

        for entry in entries {
            let attr = entry.attr;
            let mut flags = String::new();
            for (bit, ch) in [
                (ATTR_READ_ONLY, 'R'),
                (ATTR_HIDDEN, 'H'),
                (ATTR_SYSTEM, 'S'),
                (ATTR_DIRECTORY, 'D'),
                (ATTR_ARCHIVE, 'A'),
            ] {
                flags.push(if attr & bit != 0 { ch } else { '-' });
            }
            println!(
                "{} {:>8} {} {}",
                flags, entry.data_len, entry.ctime, entry.name
            );
        }
        println!();
    }

    fn cmd_cd(&mut self, args: &[&str]) {
        match args.len() {
            1 => {
                self.cluster = self.fs.root_cluster();
                self.env.insert("PWD".to_string(), "/".to_string());
            }
            2 => {
                let path = self.format_path(args[1]);
                match self.fs.lookup(self.cluster, &path) {
                    Ok(cluster) => {
                        self.cluster = cluster;
                        self.env.insert("PWD".to_string(), path);
                    }
                    Err(e) => println!("cd: {}", e),
                }
            }
            _ => println!("cd: too many arguments."),
        }
    }

    fn cmd_cluster(&mut self, args: &[&str]) {
        match args.len() {
            1 => println!("cluster: too few arguments."),
            2 => match args[1].parse::<u32>() {
                Ok(index) => match self.fs.read_cluster_raw(index) {
                    Ok(data) => {
                        println!("Cluster #{}:", index);
                        let _ = hexdump(&mut io::stdout(), &data);
                    }
                    Err(e) => println!("cluster: {}", e),
                },
                Err(_) => println!("cluster: invalid index."),
            },
            _ => println!("cluster: too many arguments."),
        }
    }

    fn cmd_entry(&mut self, args: &[&str]) {
        match args.len() {
            1 => println!("entry: too few arguments."),
            2 => match args[1].parse::<usize>() {
                Ok(index) => {
                    if let Err(e) = self.fs.dentry(&mut io::stdout(), self.cluster, index) {
                        println!("entry: {}", e);
                    }
                }
                Err(_) => println!("entry: invalid index."),
            },
            _ => println!("entry: too many arguments."),
        }
    }

    fn cmd_alloc(&mut self, args: &[&str]) {
        match args.len() {
            1 => println!("alloc: too few arguments."),
            2 => match args[1].parse::<u32>() {
                Ok(index) => match self.fs.alloc(index) {
                    Ok(()) => println!("Alloc: cluster {}.", index),
                    Err(e) => println!("alloc: {}", e),
                },
                Err(_) => println!("alloc: invalid index."),
            },
            _ => println!("alloc: too many arguments."),
        }
    }

    fn cmd_release(&mut self, args: &[&str]) {
        match args.len() {
            1 => println!("release: too few arguments."),
            2 => match args[1].parse::<u32>() {
                Ok(index) => match self.fs.release(index) {
                    Ok(()) => println!("Release: cluster {}.", index),
                    Err(e) => println!("release: {}", e),
                },
                Err(_) => println!("release: invalid index."),
            },
            _ => println!("release: too many arguments."),
        }
    }

    fn cmd_fat(&mut self, args: &[&str]) {
        match args.len() {
            1 => println!("fat: too few arguments."),
            2 => match args[1].parse::<u32>() {
                Ok(index) => match self.fs.get_fat(index) {
                    Ok(entry) => println!("Get: Cluster {} is FAT entry {:08x}", index, entry),
                    Err(e) => println!("fat: {}", e),
                },
                Err(_) => println!("fat: invalid index."),
            },
            3 => {
                let index = args[1].parse::<u32>();
                let entry = u32::from_str_radix(args[2].trim_start_matches("0x"), 16);
                match (index, entry) {
                    (Ok(index), Ok(entry)) => match self.fs.set_fat(index, entry) {
                        Ok(()) => {
                            println!("Set: Cluster {} is FAT entry {:08x}", index, entry)
                        }
                        Err(e) => println!("fat: {}", e),
                    },
                    _ => println!("fat: invalid arguments."),
                }
            }
            _ => println!("fat: too many arguments."),
        }
    }

    fn cmd_create(&mut self, args: &[&str]) {
        let mut opts = CreateOptions::default();
        let mut names = Vec::new();
        for arg in &args[1..] {
            match *arg {
                "-d" => opts.directory = true,
                name => names.push(name),
            }
        }

        match names.len() {
            0 => println!("create: too few arguments."),
            1 => {
                if names[0].contains('/') {
                    warn!("create does not support paths");
                    return;
                }
                if let Err(e) = self.fs.create(names[0], self.cluster, opts) {
                    println!("create: {}", e);
                    return;
                }
                let _ = self.fs.reload(self.cluster);
            }
            _ => println!("create: too many arguments."),
        }
    }

    fn cmd_remove(&mut self, args: &[&str]) {
        match args.len() {
            1 => println!("remove: too few arguments."),
            2 => {
                if args[1].contains('/') {
                    warn!("remove does not support paths");
                    return;
                }
                if let Err(e) = self.fs.remove(args[1], self.cluster) {
                    println!("remove: {}", e);
                    return;
                }
                let _ = self.fs.reload(self.cluster);
            }
            _ => println!("remove: too many arguments."),
        }
    }

    fn cmd_trim(&mut self, args: &[&str]) {
        match args.len() {
            1 => {
                if let Err(e) = self.fs.trim(self.cluster) {
                    println!("trim: {}", e);
                }
            }
            _ => println!("trim: too many arguments."),
        }
    }

    fn cmd_fill(&mut self, args: &[&str]) {
        let count = match args.len() {
            1 => self.fs.cluster_size() / DENTRY_SIZE as u32,
            2 => match args[1].parse::<u32>() {
                Ok(count) => count,
                Err(_) => {
                    println!("fill: invalid count.");
                    return;
                }
            },
            _ => {
                println!("fill: too many arguments.");
                return;
            }
        };

        if let Err(e) = self.fs.fill(self.cluster, count) {
            println!("fill: {}", e);
        }
        let _ = self.fs.reload(self.cluster);
    }

    fn cmd_tail(&mut self, args: &[&str]) {
        match args.len() {
            1 => println!("tail: too few arguments."),
            2 => match self.fs.contents(args[1], self.cluster) {
                Ok(tail) => println!("{}", tail),
                Err(e) => println!("tail: {}", e),
            },
            _ => println!("tail: too many arguments."),
        }
    }

    fn cmd_help(&mut self) {
        eprintln!("ls         list current directory contents.");
        eprintln!("cd         change directory.");
        eprintln!("cluster    print cluster raw-data.");
        eprintln!("entry      print directory entry.");
        eprintln!("alloc      allocate cluster.");
        eprintln!("release    release cluster.");
        eprintln!("fat        change File Allocation Table entry.");
        eprintln!("create     create directory entry.");
        eprintln!("remove     remove directory entry.");
        eprintln!("trim       trim deleted dentry.");
        eprintln!("fill       fill in directory.");
        eprintln!("tail       output the last part of files.");
        eprintln!("help       display this help.");
        eprintln!();
    }

    /// Turn a command argument into a full path: absolute arguments
    /// pass through, relative ones are joined onto PWD.
    fn format_path(&self, arg: &str) -> String {
        let components: Vec<&str> = arg.split('/').filter(|s| !s.is_empty()).collect();
        if components.is_empty() {
            return "/".to_string();
        }

        let mut path = if arg.starts_with('/') || self.env["PWD"] == "/" {
            String::from("/")
        } else {
            format!("{}/", self.env["PWD"])
        };
        path.push_str(&components.join("/"));
        path
    }
}

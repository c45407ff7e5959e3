//! CHFS Tool - Admin CLI for flash images
//!
//! Creates, inspects and exercises file-backed flash images.

use anyhow::{Context, Result, bail};
use chfs_common::config::FlashConfig;
use chfs_common::{Config, Error, Lnr, MediaKind, Vno};
use chfs_flash::{Chfs, Ebh, FileFlash, FlashDevice, Node, RecordScanner, ScanItem};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "chfs-tool")]
#[command(about = "CHFS flash image tool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "chfs.toml")]
    config: String,

    /// Flash image path
    #[arg(short, long)]
    image: String,

    /// Media kind (nor or nand)
    #[arg(long)]
    kind: Option<MediaKind>,

    /// Eraseblock size in bytes
    #[arg(long)]
    erase_size: Option<u32>,

    /// Program page size in bytes
    #[arg(long)]
    page_size: Option<u32>,

    /// Number of eraseblocks
    #[arg(long)]
    pebs: Option<u32>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a blank, fully erased image
    Format,
    /// Show the eraseblock handler's view of the image
    Info,
    /// List the records stored in one LEB
    Dump {
        /// Logical eraseblock number
        leb: u32,
    },
    /// Run a random write/overwrite/delete workload and verify it
    Exercise {
        /// Number of operations
        #[arg(long, default_value = "1000")]
        ops: u32,

        /// Seed for the workload and victim selection
        #[arg(long)]
        seed: Option<u64>,

        /// Most files alive at once
        #[arg(long, default_value = "16")]
        max_files: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).with_context(|| format!("failed to parse {}", args.config))?
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    let flash = &mut config.flash;
    if let Some(kind) = args.kind {
        flash.kind = kind;
    }
    if let Some(erase_size) = args.erase_size {
        flash.erase_size = erase_size;
    }
    if let Some(page_size) = args.page_size {
        flash.page_size = page_size;
    }
    if let Some(pebs) = args.pebs {
        flash.peb_count = pebs;
    }
    let log_level = if args.log_level == "warn" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    match args.command {
        Commands::Format => format(&args.image, &config),
        Commands::Info => show_info(&args.image, &config),
        Commands::Dump { leb } => dump(&args.image, &config, Lnr::new(leb)),
        Commands::Exercise {
            ops,
            seed,
            max_files,
        } => exercise(&args.image, config, ops, seed, max_files),
    }
}

fn open_image(path: &str, geometry: &FlashConfig, read_only: bool) -> Result<Arc<dyn FlashDevice>> {
    let flash = FileFlash::open(path, geometry, read_only)
        .with_context(|| format!("failed to open image {path}"))?;
    Ok(Arc::new(flash))
}

/// Eraseblock handler without the erase worker, for inspection
fn open_ebh(path: &str, config: &Config) -> Result<Ebh> {
    let flash = open_image(path, &config.flash, true)?;
    let mut ebh_config = config.ebh.clone();
    ebh_config.background_erase = false;
    Ok(Ebh::open(flash, &ebh_config)?)
}

fn format(path: &str, config: &Config) -> Result<()> {
    let flash = FileFlash::create(path, &config.flash)?;
    let flash: Arc<dyn FlashDevice> = Arc::new(flash);
    let mut ebh_config = config.ebh.clone();
    ebh_config.background_erase = false;

    // first open gives every block an erase counter header
    let ebh = Ebh::open(Arc::clone(&flash), &ebh_config)?;
    ebh.flush_erase_queue()?;
    ebh.close();

    let g = &config.flash;
    println!(
        "Formatted {path}: {} flash, {} blocks of {} bytes, page {} bytes",
        g.kind, g.peb_count, g.erase_size, g.page_size
    );
    Ok(())
}

fn show_info(path: &str, config: &Config) -> Result<()> {
    let ebh = open_ebh(path, config)?;
    let pool = ebh.pool_snapshot();
    let mapped = (0..ebh.leb_count())
        .filter(|&n| ebh.is_mapped(Lnr::new(n)))
        .count();

    println!("Image:        {path}");
    println!("Media:        {}", ebh.geometry().kind);
    println!("LEB size:     {} bytes", ebh.eb_size());
    println!("Page size:    {} bytes", ebh.page_size());
    println!("LEBs:         {} ({mapped} mapped)", ebh.leb_count());
    println!("Good PEBs:    {}", ebh.peb_count());
    println!("Bad PEBs:     {}", ebh.stats().bad_blocks.load(Ordering::Relaxed));
    println!("Free:         {}", pool.free.len());
    println!("In use:       {}", pool.in_use.len());
    println!("To erase:     {}", pool.to_erase.len() + pool.fully_erased.len());
    println!("EC spread:    {}", pool.erase_spread());
    if let (Some(lo), Some(hi)) = (pool.free.first(), pool.free.last()) {
        println!("Free EC:      {} .. {}", lo.erase_cnt, hi.erase_cnt);
    }
    ebh.close();
    Ok(())
}

fn dump(path: &str, config: &Config, lnr: Lnr) -> Result<()> {
    let ebh = open_ebh(path, config)?;
    if lnr.get() >= ebh.leb_count() {
        bail!("{lnr} out of range (image has {} LEBs)", ebh.leb_count());
    }
    let Some(peb) = ebh.peb_of(lnr) else {
        println!("{lnr} is not mapped");
        ebh.close();
        return Ok(());
    };

    let mut buf = vec![0u8; ebh.eb_size() as usize];
    ebh.read_leb(lnr, 0, &mut buf)?;
    println!("{lnr} on PEB {} (EC {:?})", peb.get(), ebh.erase_cnt(peb));
    println!("{:>8} {:>6}  RECORD", "OFFSET", "LENGTH");

    let mut end = 0u32;
    for item in RecordScanner::new(&buf) {
        match item {
            ScanItem::Node {
                offset,
                length,
                node,
            } => {
                end = offset + length;
                println!("{offset:>8} {length:>6}  {}", describe(&node));
            }
            ScanItem::Corrupt {
                offset,
                length,
                reason,
            } => {
                end = offset + length;
                println!("{offset:>8} {length:>6}  CORRUPT: {reason}");
            }
        }
    }
    println!("{} bytes written, {} erased", end, ebh.eb_size() - end);
    ebh.close();
    Ok(())
}

fn describe(node: &Node) -> String {
    match node {
        Node::Vnode(v) => format!(
            "vnode {} v{} mode {:o} nlink {} size {}",
            v.vno, v.version, v.mode, v.nlink, v.size
        ),
        Node::Data(d) => format!(
            "data {} v{} offset {} len {} [{}]",
            d.vno,
            d.version,
            d.offset,
            d.data.len(),
            hex::encode(&d.data[..d.data.len().min(8)])
        ),
        Node::Dirent(d) if d.vno.is_none() => format!(
            "dirent {} v{} {:?} deleted",
            d.pvno,
            d.version,
            String::from_utf8_lossy(&d.name)
        ),
        Node::Dirent(d) => format!(
            "dirent {} v{} {:?} -> {}",
            d.pvno,
            d.version,
            String::from_utf8_lossy(&d.name),
            d.vno
        ),
        Node::Padding { length } => format!("padding {length}"),
    }
}

struct TestFile {
    name: Vec<u8>,
    content: Vec<u8>,
    /// A failed write may have landed partly; the content is unknown
    tainted: bool,
}

fn exercise(path: &str, mut config: Config, ops: u32, seed: Option<u64>, max_files: usize) -> Result<()> {
    let seed = seed.unwrap_or_else(|| rand::thread_rng().r#gen());
    config.gc.victim_seed = Some(seed);
    let mut rng = StdRng::seed_from_u64(seed);
    let flash = open_image(path, &config.flash, false)?;
    let fs = Chfs::mount(flash, config)?;
    info!(seed, ops, "starting workload");

    let mut files: BTreeMap<Vno, TestFile> = BTreeMap::new();
    for (name, vno) in fs.readdir(Vno::ROOT)? {
        // files from an earlier run are verified against themselves
        let size = fs.stat(vno)?.size;
        let content = fs.read(vno, 0, size as usize)?;
        files.insert(
            vno,
            TestFile {
                name,
                content,
                tainted: false,
            },
        );
    }

    let max_write = (fs.eb_size() / 4) as usize;
    let mut serial = 0u32;
    let mut nospc = 0u32;
    for _ in 0..ops {
        let op = rng.gen_range(0..100);
        let res = if op < 15 || files.is_empty() {
            if files.len() >= max_files {
                remove_one(&fs, &mut files, &mut rng)
            } else {
                serial += 1;
                create(&fs, &mut files, format!("file-{seed:x}-{serial}").into_bytes())
            }
        } else if op < 75 {
            write_random(&fs, &mut files, &mut rng, max_write)
        } else if op < 85 {
            truncate_random(&fs, &mut files, &mut rng)
        } else if op < 95 {
            remove_one(&fs, &mut files, &mut rng)
        } else {
            fs.gc_pass().or_else(|e| if e.is_no_space() { Ok(()) } else { Err(e) })
        };
        match res {
            Ok(()) => {}
            Err(Error::NoSpace) => {
                nospc += 1;
                remove_one(&fs, &mut files, &mut rng)?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for (&vno, file) in files.iter().filter(|(_, f)| !f.tainted) {
        let got = fs.read(vno, 0, file.content.len() + 1)?;
        if got != file.content {
            bail!(
                "content mismatch in {:?} ({vno}): {} bytes on flash, {} expected",
                String::from_utf8_lossy(&file.name),
                got.len(),
                file.content.len()
            );
        }
    }
    fs.check_consistency();
    fs.sync()?;

    let stats = fs.stats();
    println!("Workload finished with seed {seed}");
    println!("Files:          {}", files.len());
    println!("Out of space:   {nospc}");
    println!("Sizes:          {}", fs.sizes());
    println!("GC passes:      {}", stats.gc_passes.load(Ordering::Relaxed));
    println!("Records:        {}", stats.nodes_written.load(Ordering::Relaxed));
    println!("Relocated:      {}", stats.nodes_relocated.load(Ordering::Relaxed));
    println!("Recycled:       {}", stats.blocks_recycled.load(Ordering::Relaxed));
    println!("EC spread:      {}", fs.ebh().pool_snapshot().erase_spread());
    fs.close()?;
    Ok(())
}

fn create(fs: &Chfs, files: &mut BTreeMap<Vno, TestFile>, name: Vec<u8>) -> chfs_common::Result<()> {
    let vno = fs.create_vnode(0o100_644)?;
    if let Err(e) = fs.link(Vno::ROOT, &name, vno, 1) {
        fs.delete_vnode(vno)?;
        return Err(e);
    }
    files.insert(
        vno,
        TestFile {
            name,
            content: Vec::new(),
            tainted: false,
        },
    );
    Ok(())
}

fn pick(files: &BTreeMap<Vno, TestFile>, rng: &mut StdRng) -> Option<Vno> {
    if files.is_empty() {
        return None;
    }
    files.keys().nth(rng.gen_range(0..files.len())).copied()
}

fn write_random(
    fs: &Chfs,
    files: &mut BTreeMap<Vno, TestFile>,
    rng: &mut StdRng,
    max_write: usize,
) -> chfs_common::Result<()> {
    let Some(vno) = pick(files, rng) else {
        return Ok(());
    };
    let Some(file) = files.get_mut(&vno) else {
        return Ok(());
    };
    let offset = rng.gen_range(0..=file.content.len());
    let len = rng.gen_range(1..=max_write);
    let data: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
    if let Err(e) = fs.write(vno, offset as u64, &data) {
        file.tainted = true;
        return Err(e);
    }

    if file.content.len() < offset + len {
        file.content.resize(offset + len, 0);
    }
    file.content[offset..offset + len].copy_from_slice(&data);
    Ok(())
}

fn truncate_random(fs: &Chfs, files: &mut BTreeMap<Vno, TestFile>, rng: &mut StdRng) -> chfs_common::Result<()> {
    let Some(vno) = pick(files, rng) else {
        return Ok(());
    };
    let Some(file) = files.get_mut(&vno) else {
        return Ok(());
    };
    let size = rng.gen_range(0..=file.content.len());
    if let Err(e) = fs.truncate(vno, size as u64) {
        file.tainted = true;
        return Err(e);
    }
    file.content.truncate(size);
    Ok(())
}

fn remove_one(fs: &Chfs, files: &mut BTreeMap<Vno, TestFile>, rng: &mut StdRng) -> chfs_common::Result<()> {
    let Some(vno) = pick(files, rng) else {
        warn!("out of space with nothing left to delete");
        return Err(Error::NoSpace);
    };
    let Some(file) = files.remove(&vno) else {
        return Ok(());
    };
    fs.unlink(Vno::ROOT, &file.name)?;
    fs.delete_vnode(vno)
}

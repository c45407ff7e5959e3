//! Mounting existing media: scanning, unchecked adoption and pristine records

use chfs_common::config::FlashConfig;
use chfs_common::{Config, Error, Lnr, MediaKind, Vno};
use chfs_flash::{
    BlockQueue, Chfs, FileFlash, MemFlash, Node, NodeType, NrefState, scan_leb,
};
use std::collections::HashSet;
use std::sync::Arc;

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.ebh.background_erase = false;
    cfg.gc.background = false;
    cfg.gc.victim_seed = Some(3);
    cfg
}

fn nor(pebs: u32) -> Arc<MemFlash> {
    Arc::new(MemFlash::new(MediaKind::Nor, 4096, 256, pebs))
}

/// A small tree: two files with data, one file created then removed
fn populate(fs: &Chfs) -> (Vno, Vno) {
    let a = fs.create_vnode(0o100_644).unwrap();
    fs.link(Vno::ROOT, b"alpha", a, 1).unwrap();
    fs.write(a, 0, b"hello flash").unwrap();

    let b = fs.create_vnode(0o100_600).unwrap();
    fs.link(Vno::ROOT, b"beta", b, 1).unwrap();
    let big: Vec<u8> = (0..6000u32).map(|i| (i % 241) as u8).collect();
    fs.write(b, 0, &big).unwrap();
    fs.write(b, 100, b"patched").unwrap();

    let gone = fs.create_vnode(0o100_644).unwrap();
    fs.link(Vno::ROOT, b"gone", gone, 1).unwrap();
    fs.write(gone, 0, b"short-lived").unwrap();
    fs.unlink(Vno::ROOT, b"gone").unwrap();
    fs.delete_vnode(gone).unwrap();
    (a, b)
}

fn expected_beta() -> Vec<u8> {
    let mut big: Vec<u8> = (0..6000u32).map(|i| (i % 241) as u8).collect();
    big[100..107].copy_from_slice(b"patched");
    big
}

fn check_tree(fs: &Chfs, a: Vno, b: Vno) {
    assert_eq!(fs.read(a, 0, 100).unwrap(), b"hello flash");
    assert_eq!(fs.read(b, 0, 6000).unwrap(), expected_beta());
    assert_eq!(fs.stat(b).unwrap().mode, 0o100_600);
    let mut names = fs.readdir(Vno::ROOT).unwrap();
    names.sort();
    assert_eq!(
        names,
        vec![(b"alpha".to_vec(), a), (b"beta".to_vec(), b)]
    );
}

#[test]
fn test_remount_restores_tree() {
    let flash = nor(16);
    let (a, b) = {
        let fs = Chfs::mount(flash.clone(), config()).unwrap();
        let ids = populate(&fs);
        fs.close().unwrap();
        ids
    };

    let fs = Chfs::mount(flash, config()).unwrap();
    assert!(fs.sizes().unchecked > 0);
    assert!(fs.gc_thread_should_wake());
    check_tree(&fs, a, b);

    // new vnodes never collide with adopted ones
    let c = fs.create_vnode(0o100_644).unwrap();
    assert!(c > b);
    fs.check_consistency();
}

#[test]
fn test_gc_validates_unchecked_records() {
    let flash = nor(16);
    let (a, b) = {
        let fs = Chfs::mount(flash.clone(), config()).unwrap();
        let ids = populate(&fs);
        fs.close().unwrap();
        ids
    };

    let fs = Chfs::mount(flash, config()).unwrap();
    let mut passes = 0;
    while fs.sizes().unchecked > 0 {
        fs.gc_pass().unwrap();
        passes += 1;
        assert!(passes < 100, "unchecked space never drained");
    }
    for vno in [Vno::ROOT, a, b] {
        assert!(
            fs.node_refs(vno)
                .iter()
                .all(|(_, r)| r.state != NrefState::Unchecked)
        );
    }
    check_tree(&fs, a, b);
    fs.check_consistency();
}

#[test]
fn test_remount_survives_gc_churn() {
    let flash = nor(16);
    let mut cfg = config();
    cfg.reserve.write_blocks = Some(4);
    let vno = {
        let fs = Chfs::mount(flash.clone(), cfg.clone()).unwrap();
        let vno = fs.create_vnode(0o100_644).unwrap();
        fs.link(Vno::ROOT, b"log", vno, 1).unwrap();
        for i in 0..60u32 {
            fs.write(vno, u64::from(i % 5) * 500, &[i as u8; 500]).unwrap();
        }
        fs.close().unwrap();
        vno
    };

    let fs = Chfs::mount(flash, cfg).unwrap();
    let got = fs.read(vno, 0, 2500).unwrap();
    for (slot, chunk) in got.chunks(500).enumerate() {
        let last = (55 + slot) as u8;
        assert!(chunk.iter().all(|&x| x == last), "slot {slot}");
    }
    fs.check_consistency();
}

#[test]
fn test_file_backed_image_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flash.img");
    let geometry = FlashConfig {
        kind: MediaKind::Nor,
        erase_size: 4096,
        page_size: 256,
        peb_count: 16,
    };

    let (a, b) = {
        let flash = Arc::new(FileFlash::create(&path, &geometry).unwrap());
        let fs = Chfs::mount(flash, config()).unwrap();
        let ids = populate(&fs);
        fs.close().unwrap();
        ids
    };

    let flash = Arc::new(FileFlash::open(&path, &geometry, false).unwrap());
    let fs = Chfs::mount(flash, config()).unwrap();
    check_tree(&fs, a, b);
    fs.check_consistency();
}

#[test]
fn test_unadopted_blocks_are_discarded() {
    let flash = nor(16);
    {
        let fs = Chfs::mount(flash.clone(), config()).unwrap();
        populate(&fs);
        fs.close().unwrap();
    }

    let fs = Chfs::open(flash, config()).unwrap();
    let unscanned = fs.queue_members(BlockQueue::Unscanned);
    assert!(!unscanned.is_empty());
    fs.start().unwrap();

    assert_eq!(fs.queue_len(BlockQueue::Unscanned), 0);
    for lnr in unscanned {
        assert_eq!(fs.block_queue(lnr), BlockQueue::ErasePending);
    }
    assert_eq!(fs.readdir(Vno::ROOT).unwrap(), Vec::new());
    fs.check_consistency();
}

#[test]
fn test_adopt_rejects_bad_input() {
    let flash = nor(8);
    {
        let fs = Chfs::mount(flash.clone(), config()).unwrap();
        populate(&fs);
        fs.close().unwrap();
    }
    let fs = Chfs::open(flash, config()).unwrap();
    let lnr = fs.queue_members(BlockQueue::Unscanned)[0];
    let mut nodes = scan_leb(fs.ebh(), lnr).unwrap();
    assert!(!nodes.is_empty());

    // a free block was never handed to the build step
    let free = fs.queue_members(BlockQueue::Free)[0];
    assert!(fs.adopt_block(free, &nodes).is_err());
    assert!(fs.adopt_block(Lnr::new(99), &nodes).is_err());

    // overlapping records
    if nodes.len() > 1 {
        let mut bad = nodes.clone();
        bad[1].offset = bad[0].offset;
        assert!(fs.adopt_block(lnr, &bad).is_err());
    }
    nodes[0].owner = Vno::NONE;
    assert!(fs.adopt_block(lnr, &nodes).is_err());
    assert_eq!(fs.block_queue(lnr), BlockQueue::Unscanned);
}

#[test]
fn test_pristine_records_move_verbatim() {
    let flash = nor(16);
    {
        let fs = Chfs::mount(flash.clone(), config()).unwrap();
        populate(&fs);
        fs.close().unwrap();
    }

    let fs = Chfs::open(flash, config()).unwrap();
    let lebs = fs.queue_members(BlockQueue::Unscanned);
    let mut originals = Vec::new();
    for &lnr in &lebs {
        let mut nodes = scan_leb(fs.ebh(), lnr).unwrap();
        for n in &mut nodes {
            n.pristine = true;
            let mut buf = vec![0u8; n.len as usize];
            fs.ebh().read_leb(lnr, n.offset, &mut buf).unwrap();
            originals.push(Node::decode(&buf).unwrap());
        }
        fs.adopt_block(lnr, &nodes).unwrap();
    }
    fs.start().unwrap();
    assert_eq!(fs.sizes().unchecked, 0);
    fs.check_consistency();

    let adopted: HashSet<Lnr> = lebs.iter().copied().collect();
    let mut passes = 0;
    while lebs.iter().any(|&l| fs.block_queue(l) != BlockQueue::Free) {
        fs.gc_pass().unwrap();
        passes += 1;
        assert!(passes < 1000, "adopted blocks were never recycled");
    }
    fs.sync().unwrap();

    // every record now lives elsewhere, byte for byte
    let mut moved = Vec::new();
    let owners: HashSet<Vno> = fs.vnodes().into_iter().collect();
    for vno in owners {
        for (id, r) in fs.node_refs(vno) {
            if r.is_obsolete() {
                continue;
            }
            assert_eq!(r.state, NrefState::Pristine, "{id:?}");
            assert!(!adopted.contains(&r.lnr));
            let mut buf = vec![0u8; r.len as usize];
            fs.ebh().read_leb(r.lnr, r.offset, &mut buf).unwrap();
            moved.push(Node::decode(&buf).unwrap());
        }
    }
    assert_eq!(moved.len(), originals.len());
    for node in &moved {
        assert!(originals.contains(node));
    }
    fs.check_consistency();
}

fn remount(flash: &Arc<MemFlash>, fs: Chfs) -> Chfs {
    fs.close().unwrap();
    drop(fs);
    Chfs::mount(flash.clone(), config()).unwrap()
}

#[test]
fn test_truncated_data_stays_gone_after_remount() {
    let flash = nor(16);
    let fs = Chfs::mount(flash.clone(), config()).unwrap();
    let vno = fs.create_vnode(0o100_644).unwrap();
    fs.write(vno, 0, &[0xAB; 100]).unwrap();
    fs.truncate(vno, 0).unwrap();

    let fs = remount(&flash, fs);
    assert_eq!(fs.stat(vno).unwrap().size, 0);
    fs.truncate(vno, 100).unwrap();
    assert_eq!(fs.read(vno, 0, 100).unwrap(), vec![0; 100]);
    fs.check_consistency();
}

#[test]
fn test_regrown_file_reads_zeros_after_remount() {
    let flash = nor(16);
    let fs = Chfs::mount(flash.clone(), config()).unwrap();
    let a = fs.create_vnode(0o100_644).unwrap();
    fs.write(a, 0, &[0xAB; 300]).unwrap();
    fs.truncate(a, 100).unwrap();
    fs.truncate(a, 300).unwrap();

    let b = fs.create_vnode(0o100_644).unwrap();
    fs.write(b, 0, &[0xCD; 300]).unwrap();
    fs.truncate(b, 50).unwrap();
    fs.write(b, 250, b"end").unwrap();

    let fs = remount(&flash, fs);
    let mut expect_a = vec![0xAB; 100];
    expect_a.resize(300, 0);
    assert_eq!(fs.read(a, 0, 300).unwrap(), expect_a);

    let mut expect_b = vec![0xCD; 50];
    expect_b.resize(250, 0);
    expect_b.extend_from_slice(b"end");
    assert_eq!(fs.read(b, 0, 300).unwrap(), expect_b);
    fs.check_consistency();
}

#[test]
fn test_deleted_vnode_stays_deleted_after_remount() {
    let flash = nor(16);
    let fs = Chfs::mount(flash.clone(), config()).unwrap();
    let keep = fs.create_vnode(0o100_644).unwrap();
    fs.write(keep, 0, b"still here").unwrap();
    let gone = fs.create_vnode(0o100_644).unwrap();
    fs.write(gone, 0, &[7; 2000]).unwrap();
    fs.delete_vnode(gone).unwrap();
    let dir = fs.create_vnode(0o040_755).unwrap();
    fs.link(dir, b"inner", keep, 1).unwrap();
    fs.delete_vnode(dir).unwrap();

    let fs = remount(&flash, fs);
    while fs.sizes().unchecked > 0 {
        fs.gc_pass().unwrap();
    }
    assert!(matches!(fs.stat(gone), Err(Error::VnodeNotFound(_))));
    assert!(fs.read(gone, 0, 10).is_err());
    assert!(
        fs.node_refs(gone)
            .iter()
            .all(|(_, r)| r.is_obsolete() || r.node_type == NodeType::Vnode)
    );
    assert_eq!(fs.read(keep, 0, 100).unwrap(), b"still here");
    assert!(matches!(fs.stat(dir), Err(Error::VnodeNotFound(_))));
    assert_eq!(fs.readdir(dir).unwrap(), Vec::new());

    // numbers of deleted vnodes are not handed out again
    assert!(fs.create_vnode(0o100_644).unwrap() > gone);
    fs.check_consistency();
}

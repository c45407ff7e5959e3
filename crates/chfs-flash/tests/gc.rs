//! Garbage collector behavior under sustained overwrites

use chfs_common::{Config, MediaKind, Vno};
use chfs_flash::{BlockQueue, Chfs, MemFlash, NrefState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.ebh.background_erase = false;
    cfg.gc.background = false;
    cfg.gc.victim_seed = Some(7);
    // leave the GC a block of headroom beyond the default
    cfg.reserve.write_blocks = Some(4);
    cfg
}

fn nor(pebs: u32) -> Arc<MemFlash> {
    Arc::new(MemFlash::new(MediaKind::Nor, 4096, 256, pebs))
}

struct Model {
    vno: Vno,
    content: Vec<u8>,
}

fn verify(fs: &Chfs, files: &[Model]) {
    for f in files {
        let got = fs.read(f.vno, 0, f.content.len() + 10).unwrap();
        assert_eq!(got, f.content, "content of {} diverged", f.vno);
    }
}

#[test]
fn test_overwrite_churn_preserves_content() {
    let flash = nor(24);
    let fs = Chfs::mount(flash.clone(), config()).unwrap();
    let mut rng = StdRng::seed_from_u64(1);

    let mut files: Vec<Model> = (0..4)
        .map(|i| {
            let vno = fs.create_vnode(0o100_644).unwrap();
            fs.link(Vno::ROOT, format!("file{i}").as_bytes(), vno, 1)
                .unwrap();
            Model {
                vno,
                content: Vec::new(),
            }
        })
        .collect();

    for round in 0..400 {
        let f = &mut files[round % 4];
        let offset = rng.gen_range(0..=f.content.len().min(2500));
        let len = rng.gen_range(1..=1500).min(3000 - offset);
        let fill: u8 = rng.r#gen();
        let data = vec![fill; len];
        fs.write(f.vno, offset as u64, &data).unwrap();

        let end = offset + len;
        if f.content.len() < end {
            f.content.resize(end, 0);
        }
        f.content[offset..end].copy_from_slice(&data);

        if round % 50 == 49 {
            verify(&fs, &files);
            fs.check_consistency();
        }
    }

    verify(&fs, &files);
    fs.check_consistency();
    let stats = fs.stats();
    assert!(stats.gc_passes.load(Ordering::Relaxed) > 0);
    assert!(stats.blocks_recycled.load(Ordering::Relaxed) > 0);
    assert!(fs.ebh().stats().erases.load(Ordering::Relaxed) > 0);

    // everything is still there after a remount
    fs.close().unwrap();
    drop(fs);
    let fs = Chfs::mount(flash, config()).unwrap();
    verify(&fs, &files);
    for (i, f) in files.iter().enumerate() {
        assert_eq!(
            fs.lookup(Vno::ROOT, format!("file{i}").as_bytes()).unwrap(),
            Some(f.vno)
        );
    }
    fs.check_consistency();
}

#[test]
fn test_victim_is_never_the_open_block() {
    let flash = nor(16);
    let fs = Chfs::mount(flash, config()).unwrap();
    let vno = fs.create_vnode(0o100_644).unwrap();
    for i in 0..40u8 {
        fs.write(vno, 0, &[i; 700]).unwrap();
    }

    for _ in 0..200 {
        fs.gc_pass().unwrap();
        if let (Some(gc), Some(next)) = (fs.gcblock(), fs.nextblock()) {
            assert_ne!(gc, next);
        }
        if let Some(gc) = fs.gcblock() {
            assert_eq!(fs.block_queue(gc), BlockQueue::Gc);
        }
    }
    assert_eq!(fs.read(vno, 0, 700).unwrap(), vec![39; 700]);
    fs.check_consistency();
}

#[test]
fn test_gc_passes_empty_dirty_blocks() {
    let flash = nor(16);
    let fs = Chfs::mount(flash, config()).unwrap();
    let vno = fs.create_vnode(0o100_644).unwrap();
    for i in 0..30u8 {
        fs.write(vno, 0, &[i; 1000]).unwrap();
    }
    let dirty_blocks = fs.queue_len(BlockQueue::Dirty)
        + fs.queue_len(BlockQueue::VeryDirty)
        + fs.queue_len(BlockQueue::ErasePending);
    assert!(dirty_blocks > 0);

    for _ in 0..500 {
        fs.gc_pass().unwrap();
    }
    assert_eq!(fs.queue_len(BlockQueue::ErasePending), 0);
    assert_eq!(fs.queue_len(BlockQueue::VeryDirty), 0);
    assert_eq!(fs.queue_len(BlockQueue::Dirty), 0);
    assert_eq!(fs.read(vno, 0, 1000).unwrap(), vec![29; 1000]);
    fs.check_consistency();
}

#[test]
fn test_deletion_survives_collection_and_remount() {
    let flash = nor(16);
    let fs = Chfs::mount(flash.clone(), config()).unwrap();

    let doomed = fs.create_vnode(0o100_644).unwrap();
    fs.link(Vno::ROOT, b"doomed", doomed, 1).unwrap();
    let keep = fs.create_vnode(0o100_644).unwrap();
    fs.link(Vno::ROOT, b"keep", keep, 1).unwrap();
    // push the tombstone into a later block than the entry it deletes
    for i in 0..4u8 {
        fs.write(keep, 0, &[i; 3000]).unwrap();
    }
    fs.unlink(Vno::ROOT, b"doomed").unwrap();
    fs.delete_vnode(doomed).unwrap();

    for _ in 0..300 {
        fs.gc_pass().unwrap();
    }
    assert_eq!(fs.lookup(Vno::ROOT, b"doomed").unwrap(), None);
    fs.check_consistency();

    fs.close().unwrap();
    drop(fs);
    let fs = Chfs::mount(flash, config()).unwrap();
    assert_eq!(fs.lookup(Vno::ROOT, b"doomed").unwrap(), None);
    assert_eq!(fs.readdir(Vno::ROOT).unwrap(), vec![(b"keep".to_vec(), keep)]);
    assert_eq!(fs.read(keep, 0, 3000).unwrap(), vec![3; 3000]);
    fs.check_consistency();
}

#[test]
fn test_gc_moves_only_live_records() {
    let flash = nor(16);
    let fs = Chfs::mount(flash, config()).unwrap();
    let vno = fs.create_vnode(0o100_644).unwrap();
    for i in 0..12u8 {
        fs.write(vno, 0, &[i; 1500]).unwrap();
    }
    for _ in 0..200 {
        fs.gc_pass().unwrap();
    }

    let live: Vec<_> = fs
        .node_refs(vno)
        .into_iter()
        .filter(|(_, r)| r.state != NrefState::Obsolete)
        .collect();
    // one vnode record and one data record
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|(_, r)| r.state == NrefState::Normal));
    assert_eq!(fs.read(vno, 0, 1500).unwrap(), vec![11; 1500]);
    fs.check_consistency();
}

//! End-to-end tests of the node log, the ledger and space reservation

use chfs_common::{AllocPriority, Config, Error, Lnr, MediaKind, Vno};
use chfs_flash::{BlockQueue, Chfs, FlashDevice, MemFlash, NodeType, NrefState};
use std::sync::Arc;

const ERASE_SIZE: u32 = 4096;
/// NOR data area per LEB: erase size minus EC and LEB headers
const EB_SIZE: u32 = ERASE_SIZE - 20;
/// Payload that makes two files fill an eraseblock up to its last 4 bytes:
/// vnode (80) + dirent "fNN" (60) + data (48 + 1768) + vnode (80) = 2036
const HALF_BLOCK_PAYLOAD: usize = 1768;
/// What two such files leave free in their block
const TAIL: u32 = EB_SIZE - 2 * 2036;

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.ebh.background_erase = false;
    cfg.gc.background = false;
    cfg.gc.victim_seed = Some(42);
    cfg
}

fn nor(pebs: u32) -> Arc<MemFlash> {
    Arc::new(MemFlash::new(MediaKind::Nor, ERASE_SIZE, 256, pebs))
}

fn mount(flash: &Arc<MemFlash>, cfg: Config) -> Chfs {
    Chfs::mount(flash.clone(), cfg).unwrap()
}

/// Create, link and fill file `i`; two of them fill an eraseblock
fn half_block_file(fs: &Chfs, i: usize) -> chfs_common::Result<Vno> {
    let vno = fs.create_vnode(0o100_644)?;
    fs.link(Vno::ROOT, format!("f{i:02}").as_bytes(), vno, 1)?;
    fs.write(vno, 0, &[i as u8; HALF_BLOCK_PAYLOAD])?;
    Ok(vno)
}

fn live_refs(fs: &Chfs, lnr: Lnr) -> Vec<chfs_flash::NrefId> {
    fs.block_refs(lnr)
        .into_iter()
        .filter(|(_, r)| !r.is_obsolete())
        .map(|(id, _)| id)
        .collect()
}

#[test]
fn test_write_read_roundtrip() {
    let flash = nor(16);
    let fs = mount(&flash, config());

    let vno = fs.create_vnode(0o100_644).unwrap();
    fs.link(Vno::ROOT, b"data.bin", vno, 1).unwrap();
    let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();
    fs.write(vno, 0, &data).unwrap();

    assert_eq!(fs.read(vno, 0, data.len()).unwrap(), data);
    assert_eq!(fs.read(vno, 5000, 100).unwrap(), &data[5000..5100]);
    assert_eq!(fs.stat(vno).unwrap().size, 10_000);
    assert_eq!(fs.lookup(Vno::ROOT, b"data.bin").unwrap(), Some(vno));
    assert_eq!(
        fs.readdir(Vno::ROOT).unwrap(),
        vec![(b"data.bin".to_vec(), vno)]
    );
    // reads stop at the end of the file
    assert_eq!(fs.read(vno, 9990, 100).unwrap().len(), 10);
    fs.check_consistency();
}

#[test]
fn test_holes_read_as_zeros() {
    let flash = nor(8);
    let fs = mount(&flash, config());
    let vno = fs.create_vnode(0o100_644).unwrap();
    fs.write(vno, 1000, b"tail").unwrap();

    let got = fs.read(vno, 0, 2000).unwrap();
    assert_eq!(got.len(), 1004);
    assert!(got[..1000].iter().all(|&b| b == 0));
    assert_eq!(&got[1000..], b"tail");
}

#[test]
fn test_overwrite_obsoletes_old_record() {
    let flash = nor(8);
    let fs = mount(&flash, config());
    let vno = fs.create_vnode(0o100_644).unwrap();
    fs.write(vno, 0, &[1; 500]).unwrap();
    let dirty_before = fs.sizes().dirty;

    fs.write(vno, 0, &[2; 500]).unwrap();
    assert_eq!(fs.read(vno, 0, 500).unwrap(), vec![2; 500]);

    let data_refs: Vec<_> = fs
        .node_refs(vno)
        .into_iter()
        .filter(|(_, r)| r.node_type == NodeType::Data)
        .collect();
    assert_eq!(data_refs.len(), 2);
    assert_eq!(data_refs[0].1.state, NrefState::Obsolete);
    assert_eq!(data_refs[1].1.state, NrefState::Normal);
    // old data record plus the superseded vnode record
    assert_eq!(fs.sizes().dirty - dirty_before, 548 + 80);
    fs.check_consistency();
}

#[test]
fn test_partial_overwrite_keeps_both_records() {
    let flash = nor(8);
    let fs = mount(&flash, config());
    let vno = fs.create_vnode(0o100_644).unwrap();
    fs.write(vno, 0, &[1; 400]).unwrap();
    fs.write(vno, 100, &[2; 100]).unwrap();

    let mut expect = vec![1; 400];
    expect[100..200].fill(2);
    assert_eq!(fs.read(vno, 0, 400).unwrap(), expect);
    let live_data = fs
        .node_refs(vno)
        .into_iter()
        .filter(|(_, r)| r.node_type == NodeType::Data && !r.is_obsolete())
        .count();
    assert_eq!(live_data, 2);
}

#[test]
fn test_truncate_drops_data() {
    let flash = nor(8);
    let fs = mount(&flash, config());
    let vno = fs.create_vnode(0o100_644).unwrap();
    fs.write(vno, 0, &[1; 300]).unwrap();
    fs.write(vno, 300, &[2; 300]).unwrap();

    fs.truncate(vno, 200).unwrap();
    assert_eq!(fs.stat(vno).unwrap().size, 200);
    assert_eq!(fs.read(vno, 0, 1000).unwrap(), vec![1; 200]);
    // the second record no longer serves any byte
    let states: Vec<_> = fs
        .node_refs(vno)
        .into_iter()
        .filter(|(_, r)| r.node_type == NodeType::Data)
        .map(|(_, r)| r.state)
        .collect();
    assert_eq!(states, vec![NrefState::Normal, NrefState::Obsolete]);

    // growing again exposes zeros, not the old bytes
    fs.truncate(vno, 400).unwrap();
    let got = fs.read(vno, 0, 400).unwrap();
    assert!(got[200..].iter().all(|&b| b == 0));
    fs.check_consistency();
}

#[test]
fn test_directory_operations() {
    let flash = nor(8);
    let fs = mount(&flash, config());
    let a = fs.create_vnode(0o100_644).unwrap();
    let b = fs.create_vnode(0o100_644).unwrap();
    fs.link(Vno::ROOT, b"a", a, 1).unwrap();
    fs.link(Vno::ROOT, b"b", b, 1).unwrap();

    assert!(matches!(
        fs.link(Vno::ROOT, b"a", b, 1),
        Err(Error::InvalidArgument(_))
    ));
    assert!(fs.link(Vno::ROOT, b"", b, 1).is_err());
    assert!(fs.link(Vno::ROOT, &[b'x'; 256], b, 1).is_err());
    assert!(matches!(
        fs.link(Vno::ROOT, b"c", Vno::new(999), 1),
        Err(Error::VnodeNotFound(_))
    ));

    fs.unlink(Vno::ROOT, b"a").unwrap();
    assert_eq!(fs.lookup(Vno::ROOT, b"a").unwrap(), None);
    assert!(matches!(
        fs.unlink(Vno::ROOT, b"a"),
        Err(Error::NotFound(_))
    ));
    assert_eq!(fs.readdir(Vno::ROOT).unwrap(), vec![(b"b".to_vec(), b)]);

    // the name can be bound again after a deletion
    fs.link(Vno::ROOT, b"a", b, 1).unwrap();
    assert_eq!(fs.lookup(Vno::ROOT, b"a").unwrap(), Some(b));

    fs.delete_vnode(a).unwrap();
    assert!(matches!(fs.stat(a), Err(Error::VnodeNotFound(_))));
    assert!(matches!(fs.read(a, 0, 10), Err(Error::VnodeNotFound(_))));
    assert!(matches!(fs.delete_vnode(a), Err(Error::VnodeNotFound(_))));
    // only the record marking the deletion is left
    let live: Vec<_> = fs
        .node_refs(a)
        .into_iter()
        .filter(|(_, r)| !r.is_obsolete())
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].1.node_type, NodeType::Vnode);
    fs.check_consistency();
}

#[test]
fn test_full_block_closes_and_next_write_starts_fresh() {
    let flash = nor(16);
    let fs = mount(&flash, config());
    half_block_file(&fs, 0).unwrap();
    half_block_file(&fs, 1).unwrap();

    let first = fs.nextblock().unwrap();
    assert_eq!(TAIL, 4);
    assert_eq!(fs.eb_sizes(first).free, TAIL);

    let vno = fs.create_vnode(0o100_644).unwrap();
    let refs = fs.node_refs(vno);
    assert_eq!(refs.len(), 1);
    let (_, r) = refs[0];
    assert_ne!(r.lnr, first);
    assert_eq!(r.offset, 0);
    assert_eq!(fs.nextblock(), Some(r.lnr));

    // the full block was sealed, its tail turned dirty, and filed by its dirt
    assert_eq!(fs.block_queue(first), BlockQueue::Clean);
    let eb = fs.eb_sizes(first);
    assert_eq!(eb.free, 0);
    assert_eq!(eb.dirty, 160 + TAIL);
    assert_eq!(eb.used + eb.dirty, EB_SIZE);
    fs.check_consistency();
}

#[test]
fn test_closing_early_turns_free_space_dirty() {
    let flash = nor(16);
    let fs = mount(&flash, config());
    let vno = fs.create_vnode(0o100_644).unwrap();
    let first = fs.nextblock().unwrap();

    // a record too big for what is left forces the block closed
    fs.write(vno, 0, &[5; 4000]).unwrap();
    let eb = fs.eb_sizes(first);
    assert_eq!(eb.free, 0);
    assert_eq!(eb.used, 0);
    assert_eq!(eb.dirty + eb.wasted, EB_SIZE);
    assert_eq!(fs.read(vno, 0, 4000).unwrap(), vec![5; 4000]);
    fs.check_consistency();
}

#[test]
fn test_obsoleting_last_record_queues_block_for_erase() {
    let flash = nor(16);
    let fs = mount(&flash, config());
    half_block_file(&fs, 0).unwrap();
    half_block_file(&fs, 1).unwrap();
    let block = fs.nextblock().unwrap();
    fs.create_vnode(0o100_644).unwrap();
    assert_ne!(fs.nextblock(), Some(block));

    let live = live_refs(&fs, block);
    assert_eq!(live.len(), 6);
    let (last, rest) = live.split_last().unwrap();
    for &id in rest {
        fs.mark_node_obsolete(id);
        assert_ne!(fs.block_queue(block), BlockQueue::ErasePending);
    }
    fs.mark_node_obsolete(*last);
    assert_eq!(fs.block_queue(block), BlockQueue::ErasePending);
    let eb = fs.eb_sizes(block);
    assert_eq!(eb.used + eb.unchecked, 0);
    assert_eq!(eb.dirty + eb.wasted, EB_SIZE);
    fs.check_consistency();
}

#[test]
#[should_panic(expected = "obsoleted twice")]
fn test_double_obsolete_panics() {
    let flash = nor(8);
    let fs = mount(&flash, config());
    let vno = fs.create_vnode(0o100_644).unwrap();
    let (id, _) = fs.node_refs(vno)[0];
    fs.mark_node_obsolete(id);
    fs.mark_node_obsolete(id);
}

#[test]
fn test_deletion_reserve_outlasts_normal_writes() {
    let mut cfg = config();
    cfg.reserve.deletion_blocks = Some(1);
    cfg.reserve.write_blocks = Some(3);
    let flash = nor(8);
    let fs = mount(&flash, cfg);

    let mut files = Vec::new();
    let err = loop {
        match half_block_file(&fs, files.len()) {
            Ok(vno) => files.push(vno),
            Err(e) => break e,
        }
    };
    assert!(err.is_no_space(), "unexpected {err}");
    assert_eq!(fs.queue_len(BlockQueue::Free), 2);
    assert!(files.len() >= 4);

    // same size, different outcome
    assert!(
        fs.reserve_space_normal(64, AllocPriority::Normal)
            .unwrap_err()
            .is_no_space()
    );
    fs.reserve_space_normal(64, AllocPriority::Deletion).unwrap();

    // deleting keeps working while ordinary writes are refused
    fs.unlink(Vno::ROOT, b"f00").unwrap();
    fs.delete_vnode(files[0]).unwrap();
    assert!(fs.create_vnode(0o100_644).unwrap_err().is_no_space());

    // the second file empties the first block, which gives room again
    fs.unlink(Vno::ROOT, b"f01").unwrap();
    fs.delete_vnode(files[1]).unwrap();
    assert_eq!(fs.queue_len(BlockQueue::ErasePending), 1);
    let vno = fs.create_vnode(0o100_644).unwrap();
    assert!(fs.stat(vno).is_ok());
    for (i, &vno) in files.iter().enumerate().skip(2) {
        assert_eq!(
            fs.read(vno, 0, HALF_BLOCK_PAYLOAD).unwrap(),
            vec![i as u8; HALF_BLOCK_PAYLOAD]
        );
    }
    fs.check_consistency();
}

#[test]
fn test_gc_recycles_obsolete_block_on_full_device() {
    let mut cfg = config();
    cfg.reserve.deletion_blocks = Some(0);
    cfg.reserve.write_blocks = Some(1);
    // always prefer the erase-pending queue
    cfg.gc.weights.erase_pending = cfg.gc.weights.total;
    cfg.gc.weights.very_dirty = cfg.gc.weights.total;
    cfg.gc.weights.dirty = cfg.gc.weights.total;
    let flash = nor(8);
    let fs = mount(&flash, cfg);

    let mut n = 0;
    while half_block_file(&fs, n).is_ok() {
        n += 1;
    }
    assert_eq!(fs.queue_len(BlockQueue::Free), 0);
    assert!(fs.create_vnode(0o100_644).unwrap_err().is_no_space());

    // leave one closed block with nothing live in it
    let block = fs.queue_members(BlockQueue::Clean)[0];
    for id in live_refs(&fs, block) {
        fs.mark_node_obsolete(id);
    }
    assert_eq!(fs.block_queue(block), BlockQueue::ErasePending);

    fs.gc_pass().unwrap();
    assert_eq!(fs.block_queue(block), BlockQueue::Free);
    assert_eq!(fs.queue_len(BlockQueue::ErasePending), 0);
    assert_eq!(fs.eb_sizes(block).free, EB_SIZE);
    assert!(!fs.ebh().is_mapped(block));

    let vno = fs.create_vnode(0o100_644).unwrap();
    assert!(fs.stat(vno).is_ok());
    fs.check_consistency();
}

#[test]
fn test_oversized_reservation_rejected() {
    let flash = nor(8);
    let fs = mount(&flash, config());
    assert!(matches!(
        fs.reserve_space(EB_SIZE + 1),
        Err(Error::InvalidArgument(_))
    ));
    fs.reserve_space(EB_SIZE).unwrap();
    assert_eq!(fs.eb_sizes(fs.nextblock().unwrap()).free, EB_SIZE);
}

#[test]
fn test_failed_page_write_relocates_buffered_records() {
    let flash = Arc::new(MemFlash::new(MediaKind::Nand, 16 * 1024, 512, 16));
    let fs = Chfs::mount(flash.clone(), config()).unwrap();

    let vno = fs.create_vnode(0o100_644).unwrap();
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 253) as u8).collect();
    fs.write(vno, 0, &data).unwrap();
    let lnr = fs.nextblock().unwrap();
    // the first two pages reached flash, the tail is still buffered
    let peb = fs.ebh().peb_of(lnr).unwrap();
    flash.fail_writes(peb, 1);

    fs.sync().unwrap();
    assert_ne!(fs.nextblock(), Some(lnr));
    assert_eq!(fs.block_queue(lnr), BlockQueue::ErasePending);
    assert_eq!(fs.read(vno, 0, 1000).unwrap(), data);
    assert_eq!(fs.stat(vno).unwrap().size, 1000);
    for (_, r) in fs.node_refs(vno) {
        assert!(r.is_obsolete() || r.lnr != lnr);
    }
    fs.check_consistency();

    // the relocated copies are what a remount finds
    fs.close().unwrap();
    drop(fs);
    let fs = Chfs::mount(flash, config()).unwrap();
    assert_eq!(fs.read(vno, 0, 1000).unwrap(), data);
    fs.check_consistency();
}

#[test]
fn test_every_block_is_accounted() {
    let flash = nor(8);
    let fs = mount(&flash, config());
    let total: usize = [
        BlockQueue::Free,
        BlockQueue::Clean,
        BlockQueue::Dirty,
        BlockQueue::VeryDirty,
        BlockQueue::ErasePending,
        BlockQueue::Next,
        BlockQueue::Gc,
    ]
    .into_iter()
    .map(|q| fs.queue_len(q))
    .sum();
    assert_eq!(total, 8);
    assert_eq!(fs.sizes().free, u64::from(EB_SIZE) * 8);
    let dev: &dyn FlashDevice = flash.as_ref();
    assert_eq!(dev.peb_count(), 8);
}

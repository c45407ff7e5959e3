//! Eraseblock handler driven through the public API only

use chfs_common::config::EbhConfig;
use chfs_common::{Lnr, MediaKind};
use chfs_flash::{Ebh, MemFlash};
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn manual() -> EbhConfig {
    EbhConfig {
        background_erase: false,
        ..Default::default()
    }
}

#[test]
fn test_rewrite_cycles_spread_wear_evenly() {
    let flash = Arc::new(MemFlash::new(MediaKind::Nor, 4096, 256, 8));
    let ebh = Ebh::open(flash.clone(), &manual()).unwrap();
    ebh.flush_erase_queue().unwrap();

    let lnr = Lnr::new(0);
    for i in 0..80u32 {
        ebh.write_leb(lnr, 0, &i.to_le_bytes()).unwrap();
        ebh.unmap_leb(lnr).unwrap();
        ebh.flush_erase_queue().unwrap();
        assert!(ebh.pool_snapshot().erase_spread() <= 1, "cycle {i}");
    }
    let snap = ebh.pool_snapshot();
    assert_eq!(snap.free.len(), 8);
    assert!(snap.free.iter().all(|p| p.erase_cnt == 10));
    assert_eq!(ebh.stats().erases.load(Ordering::Relaxed), 80);
}

#[test]
fn test_contents_survive_reopen_across_media() {
    for kind in [MediaKind::Nor, MediaKind::Nand] {
        let flash = Arc::new(MemFlash::new(kind, 16 * 1024, 512, 8));
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 199) as u8).collect();
        {
            let ebh = Ebh::open(flash.clone(), &manual()).unwrap();
            ebh.write_leb(Lnr::new(3), 0, &payload).unwrap();
            ebh.write_leb(Lnr::new(6), 512, &payload).unwrap();
            ebh.close();
        }

        let ebh = Ebh::open(flash, &manual()).unwrap();
        assert!(ebh.is_mapped(Lnr::new(3)));
        assert!(ebh.is_mapped(Lnr::new(6)));
        assert!(!ebh.is_mapped(Lnr::new(0)));
        let mut buf = vec![0u8; 2048];
        ebh.read_leb(Lnr::new(3), 0, &mut buf).unwrap();
        assert_eq!(buf, payload, "{kind:?}");
        ebh.read_leb(Lnr::new(6), 512, &mut buf).unwrap();
        assert_eq!(buf, payload, "{kind:?}");
    }
}

#[test]
fn test_bad_block_is_never_allocated() {
    let flash = Arc::new(MemFlash::new(MediaKind::Nand, 16 * 1024, 512, 6));
    let bad = chfs_common::Pebnr::new(2);
    flash.set_bad(bad);
    let ebh = Ebh::open(flash, &manual()).unwrap();
    ebh.flush_erase_queue().unwrap();
    assert_eq!(ebh.pool_snapshot().total(), 5);

    for n in 0..5 {
        ebh.map_leb(Lnr::new(n)).unwrap();
        assert_ne!(ebh.peb_of(Lnr::new(n)), Some(bad));
    }
    assert!(ebh.map_leb(Lnr::new(5)).unwrap_err().is_no_space());
}

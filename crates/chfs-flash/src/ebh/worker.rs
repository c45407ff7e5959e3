//! Background erase worker
//!
//! Sleeps on the wake channel with a periodic timeout so queued erase work
//! also makes progress when nobody signals. Errors are logged and never
//! stop the loop; only the shutdown flag does.

use super::EbhCore;
use chfs_common::Result;
use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

pub(crate) fn spawn(core: Arc<EbhCore>, interval: Duration) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("chfs-erase".into())
        .spawn(move || run(&core, interval))?;
    Ok(handle)
}

fn run(core: &EbhCore, interval: Duration) {
    info!("erase worker started");

    while !core.shutdown.load(Ordering::Relaxed) {
        match core.free_peb() {
            // more may be queued; check shutdown and go again
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => error!("erase worker: {e}"),
        }

        match core.wake_rx.recv_timeout(interval) {
            Ok(()) => debug!("erase worker woken"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("erase worker stopped");
}

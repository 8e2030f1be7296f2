//! Owns the process-wide session for this test binary; nothing else may open it.

#![cfg(not(target_arch = "wasm32"))]

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{ensure, Result};
use apptrace_adapters::{MembufConfig, MembufLink, MEMBUF, RAW};
use apptrace_fabric::{global, Deadline, InitState, SessionParams};
use parking_lot::Mutex;

use crate::init_tracing;

#[test]
fn panic_hook_drains_the_global_session() -> Result<()> {
    init_tracing();
    assert_eq!(global::state(), InitState::Uninitialized);

    let link = MembufLink::new(MembufConfig::default())?;
    let host = link.host();
    host.attach();

    let session = global::open(SessionParams::new(RAW, MEMBUF).with_transport_cfg(&link))?;
    let again = global::open(SessionParams::new(RAW, "ignored once ready"))?;
    ensure!(std::ptr::eq(session, again), "second open built a new session");
    assert_eq!(global::state(), InitState::Ready);

    global::install_panic_hook();

    let seen = Mutex::new(Vec::new());
    let stop = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                if let Ok(blocks) = host.drain_blocks() {
                    seen.lock().extend(blocks);
                }
                thread::yield_now();
            }
        });

        let crashed = scope
            .spawn(|| {
                let session = global::session().expect("global session");
                session
                    .write(b"last words", &mut Deadline::infinite())
                    .expect("staged");
                panic!("stack overflow in task `net`");
            })
            .join();
        assert!(crashed.is_err());
        // The hook returned only after the probe emptied the window.
        assert_eq!(host.staged().ok(), Some(0));
        stop.store(true, Ordering::Release);
    });
    let _ = panic::take_hook();

    let seen = seen.into_inner();
    assert!(seen.iter().any(|block| block.payload == b"last words"));
    Ok(())
}

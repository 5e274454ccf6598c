//! Teardown paths: flush, shutdown_all, and reentrant dispatch.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::vm::VmPort;

use super::helpers::{self, drive, GUEST_ENTRY};

#[test]
fn flush_drains_addressed_threads() {
    let s = helpers::sched();
    for name in ["a", "b", "c"] {
        let tid = s.register(name).unwrap();
        s.start(tid, |co| {
            co.wait()?;
            Ok(())
        });
    }
    assert_eq!(s.joinable(), 3);

    // Each attach saved the previous trap slot as its return point, so
    // cancelling the addressed thread uncovers the next one.
    let stalled = s.flush(|| drive(&s));

    assert_eq!(stalled, 0);
    assert_eq!(s.live(), 0);
    assert_eq!(s.vm().pc(), GUEST_ENTRY);
}

#[test]
fn flush_reports_threads_it_cannot_locate() {
    let s = helpers::sched();
    for name in ["a", "b", "c"] {
        let tid = s.register(name).unwrap();
        s.start(tid, |co| {
            co.wait()?;
            Ok(())
        });
    }

    // The guest wandered off the trap window, so no thread is addressable.
    s.vm().set_pc(GUEST_ENTRY);
    let stalled = s.flush(|| {});

    assert_eq!(stalled, 3);
    assert_eq!(s.live(), 3);
}

#[test]
fn shutdown_all_cancels_detached_threads() {
    let s = helpers::sched();
    for name in ["bg1", "bg2"] {
        let tid = s.register(name).unwrap();
        s.set_detached(tid);
        s.start(tid, |co| loop {
            co.sleep()?;
        });
    }
    assert_eq!(s.live(), 2);

    s.shutdown_all();
    assert_eq!(s.live(), 0);
}

#[test]
fn nested_attached_invocation_completes_inner_first() {
    let s = helpers::sched();
    let order: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));
    let outer = s.register("outer").unwrap();
    let inner = s.register("inner").unwrap();

    let nested = s.clone();
    let o = order.clone();
    s.start(outer, move |_| {
        let o_inner = o.clone();
        nested.start(inner, move |_| {
            o_inner.lock().push("inner");
            Ok(())
        });
        // Run the guest loop from inside the body, like a nested service
        // call, until the inner activation has been torn down.
        while nested.live() > 1 {
            if let Some(addr) = nested.vm().current_trap() {
                nested.dispatch_trap(addr);
            }
        }
        o.lock().push("outer");
        Ok(())
    });
    s.join(outer, || drive(&s));

    assert_eq!(*order.lock(), ["inner", "outer"]);
    assert_eq!(s.live(), 0);
    assert_eq!(s.joinable(), 0);
    assert_eq!(s.vm().pc(), GUEST_ENTRY);
}

//! Suspension-point tests: wait, attach/detach from inside a body, sched,
//! exit, latched sleep and user data.

use alloc::boxed::Box;
use alloc::sync::Arc;

use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::vm::VmPort;

use super::helpers::{self, drive};

#[test]
fn body_attach_then_detach() {
    let s = helpers::sched();
    let tid = s.register("xfer").unwrap();
    s.set_detached(tid);
    let pc0 = s.vm().pc();

    s.start(tid, |co| {
        co.attach();
        co.wait()?;
        co.detach();
        Ok(())
    });

    // The body attached itself during the initial dispatch.
    assert_eq!(s.joinable(), 1);
    assert!(s.vm().current_trap().is_some());

    drive(&s); // wait parks, guest idles
    drive(&s); // wait returns; detach requested
    drive(&s); // detach sequence restores the guest

    assert_eq!(s.joinable(), 0);
    assert_eq!(s.vm().pc(), pc0);
    assert_eq!(s.live(), 1);

    // Back under main-loop control as a plain detached body.
    s.run();
    assert_eq!(s.live(), 0);
}

#[test]
fn sched_hands_control_to_guest_code() {
    let s = helpers::sched();
    let tid = s.register("svc").unwrap();

    s.start(tid, |co| {
        // Pretend the body set up a guest call frame at 0x2000.
        co.scheduler().vm().set_pc(0x2000);
        co.sched();
        co.wait()?;
        Ok(())
    });
    let trap = s.vm().current_trap().unwrap();

    drive(&s); // body runs until sched()
    assert_eq!(s.vm().pc(), 0x2000);
    assert_eq!(s.live(), 1);
    assert_eq!(s.joinable(), 1);

    // The guest call returns to the trampoline.
    s.vm().enter_trap(trap);
    s.join(tid, || drive(&s));
    assert_eq!(s.live(), 0);
    assert_eq!(s.vm().pc(), helpers::GUEST_ENTRY);
}

#[test]
#[should_panic(expected = "context worker went away")]
fn sched_to_own_trampoline_is_fatal() {
    let s = helpers::sched();
    let tid = s.register("bad").unwrap();
    s.start(tid, |co| {
        co.sched();
        Ok(())
    });
    // The guest is still parked on this identity's own trap slot, so the
    // body's assertion fires and tears the context down.
    drive(&s);
}

#[test]
fn exit_skips_completion_and_cleanup_handlers() {
    let s = helpers::sched();
    let tid = s.register("quitter").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    let c = fired.clone();
    s.start(tid, move |co| {
        co.on_completion(move || {
            f.fetch_add(1, Ordering::AcqRel);
        });
        co.on_cancel_cleanup(move || {
            c.fetch_add(1, Ordering::AcqRel);
        });
        co.exit()
    });
    s.join(tid, || drive(&s));

    assert_eq!(fired.load(Ordering::Acquire), 0);
    assert_eq!(s.live(), 0);
    assert_eq!(s.joinable(), 0);
}

#[test]
fn sleep_hook_fires_once_on_next_suspension() {
    let s = helpers::sched();
    let tid = s.register("notify").unwrap();
    s.set_detached(tid);
    let notified = Arc::new(AtomicUsize::new(0));

    let n = notified.clone();
    s.start(tid, move |co| {
        let hook = n.clone();
        co.on_next_sleep(move || {
            hook.fetch_add(1, Ordering::AcqRel);
        });
        co.yield_now()?;
        co.yield_now()?;
        Ok(())
    });
    assert_eq!(notified.load(Ordering::Acquire), 1);

    s.run(); // second yield must not refire the one-shot hook
    s.run();
    assert_eq!(notified.load(Ordering::Acquire), 1);
    assert_eq!(s.live(), 0);
}

#[test]
fn async_sleep_is_latched_until_next_dispatch() {
    let s = helpers::sched();
    let tid = s.register("throttled").unwrap();
    s.set_detached(tid);
    let steps = Arc::new(AtomicUsize::new(0));

    let counter = steps.clone();
    s.start(tid, move |co| loop {
        counter.fetch_add(1, Ordering::AcqRel);
        co.yield_now()?;
    });
    assert_eq!(steps.load(Ordering::Acquire), 1);

    s.async_sleep(tid);
    s.run(); // dispatch observes the latch and parks without running the body
    assert_eq!(steps.load(Ordering::Acquire), 1);
    s.run();
    assert_eq!(steps.load(Ordering::Acquire), 1);

    s.wake(tid);
    s.run();
    assert_eq!(steps.load(Ordering::Acquire), 2);

    s.cancel(tid);
    assert_eq!(s.live(), 0);
}

#[test]
#[should_panic(expected = "async sleep on a non-detached thread")]
fn async_sleep_requires_a_detached_identity() {
    let s = helpers::sched();
    let tid = s.register("joined").unwrap();
    s.start(tid, |co| {
        co.wait()?;
        Ok(())
    });
    s.async_sleep(tid);
}

#[test]
fn user_data_is_reachable_from_outside() {
    let s = helpers::sched();
    let tid = s.register("carrier").unwrap();
    s.set_detached(tid);

    s.start(tid, |co| {
        co.sleep()?;
        Ok(())
    });

    s.push_user_data(tid, Box::new(5i32));
    let value = s.pop_user_data(tid).downcast::<i32>().unwrap();
    assert_eq!(*value, 5);

    s.cancel(tid);
    assert_eq!(s.live(), 0);
}

#[test]
fn user_data_is_scoped_to_the_running_body() {
    let s = helpers::sched();
    let tid = s.register("tagged").unwrap();
    s.set_detached(tid);
    let matched = Arc::new(AtomicBool::new(false));

    let m = matched.clone();
    s.start(tid, move |co| {
        co.push_user_data(Box::new("tag"));
        let value = co.pop_user_data().downcast::<&str>().unwrap();
        m.store(*value == "tag", Ordering::Release);
        Ok(())
    });

    assert!(matched.load(Ordering::Acquire));
    assert_eq!(s.live(), 0);
}

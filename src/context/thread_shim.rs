//! OS-thread-backed context for host builds.
//!
//! Each context is one parked OS thread and a pair of zero-capacity
//! rendezvous channels. `call` wakes the worker and blocks until it hands
//! control back; `resume` does the reverse. Only one side ever executes
//! scheduler code at a time, so the cooperative single-threaded model is
//! preserved even though real threads are involved.

use alloc::boxed::Box;
use alloc::sync::Arc;

use portable_atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

use super::{ContextEntry, Resumer, StackContext};
use crate::errors::ContextError;

/// Host-side [`StackContext`] implementation.
pub struct ThreadShimContext {
    go: SyncSender<()>,
    back: Receiver<()>,
    finished: Arc<AtomicBool>,
    worker: spin::Mutex<Option<thread::JoinHandle<()>>>,
}

struct ShimResumer {
    back: SyncSender<()>,
    go: Receiver<()>,
}

impl Resumer for ShimResumer {
    fn resume(&self) {
        self.back.send(()).expect("context caller went away");
        self.go.recv().expect("context caller went away");
    }
}

impl StackContext for ThreadShimContext {
    fn create(entry: ContextEntry, stack_size: usize) -> Result<Self, ContextError> {
        let (go_tx, go_rx) = sync_channel(0);
        let (back_tx, back_rx) = sync_channel(0);
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let worker = thread::Builder::new()
            .name("coop-context".into())
            .stack_size(stack_size)
            .spawn(move || {
                // Park until the first call. A context deleted before ever
                // being called just unwinds the worker.
                if go_rx.recv().is_err() {
                    return;
                }
                let final_back = back_tx.clone();
                let resumer = ShimResumer { back: back_tx, go: go_rx };
                entry(Box::new(resumer));
                done.store(true, Ordering::Release);
                // Hand control back one last time; the driving side observes
                // the entry's completion through the scheduler state.
                let _ = final_back.send(());
            })
            .map_err(|_| ContextError::CreateFailed)?;
        Ok(Self {
            go: go_tx,
            back: back_rx,
            finished,
            worker: spin::Mutex::new(Some(worker)),
        })
    }

    fn call(&self) {
        self.go.send(()).expect("calling a finished context");
        self.back.recv().expect("context worker went away");
    }

    fn delete(self) {
        let Self { go, back, finished, worker } = self;
        drop(go);
        drop(back);
        if finished.load(Ordering::Acquire) {
            if let Some(handle) = worker.lock().take() {
                let _ = handle.join();
            }
        } else {
            // The scheduler only deletes contexts whose entry has returned;
            // reaching this arm means bookkeeping diverged somewhere.
            log::error!("deleting a context that never finished");
        }
    }
}

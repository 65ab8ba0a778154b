//! Real-time signal plumbing.
//!
//! Submission scripts notify the driver that a job finished by firing one
//! real-time signal in `[SIGMIN, SIGMAX]` at the process. The whole range is
//! blocked in every thread (the mask is installed before any worker spawns
//! and inherited from there), and a dedicated listener thread drains the
//! pending queue with `sigwait`, forwarding each arrival to at most one
//! registered waiter.
//!
//! Signal numbers are reused once more evaluations are in flight than the
//! window holds, so a wake is opportunistic: the woken evaluation probes its
//! own output file and goes back to waiting if the signal belonged to a
//! sibling. The timeout on [`Ticket::wait`] keeps everything live when a
//! signal is lost outright.

use super::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::trace;

/// First real-time signal used for completion pings.
pub const SIGMIN: i32 = 35;
/// Last real-time signal used for completion pings.
pub const SIGMAX: i32 = 64;

/// Number of distinct completion signals.
#[must_use]
pub const fn window() -> usize {
    (SIGMAX - SIGMIN + 1) as usize
}

type Registry = Mutex<HashMap<i32, VecDeque<(u64, Sender<()>)>>>;

/// Routes incoming completion signals to per-evaluation one-shot receivers.
pub struct Hub {
    waiters: Registry,
    tokens: AtomicU64,
}

impl Hub {
    /// Blocks the completion-signal range in the calling thread and starts
    /// the listener. Must run before any worker thread spawns so the mask is
    /// inherited everywhere.
    pub fn install() -> Result<Arc<Self>> {
        let hub = Arc::new(Self {
            waiters: Mutex::new(HashMap::new()),
            tokens: AtomicU64::new(0),
        });

        // SAFETY: plain libc sigset manipulation on a zeroed, exclusively
        // owned set; sigwait in the listener below reads the same set.
        let set = unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            for sig in SIGMIN..=SIGMAX {
                libc::sigaddset(&mut set, sig);
            }
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
            if rc != 0 {
                return Err(Error::SignalSetup(rc));
            }
            set
        };

        let listener = Arc::clone(&hub);
        // the listener runs for the life of the process; its handle is
        // dropped to detach it
        let _detached = thread::Builder::new()
            .name("sigwait".into())
            .spawn(move || {
                loop {
                    let mut sig: libc::c_int = 0;
                    // SAFETY: set is a valid, initialized signal set and sig
                    // is a valid out-pointer.
                    let rc = unsafe { libc::sigwait(&set, &mut sig) };
                    if rc == 0 {
                        listener.notify(sig);
                    }
                }
            })?;

        Ok(hub)
    }

    /// A hub with no listener attached, for exercising the registry alone.
    #[cfg(test)]
    pub(crate) fn dummy() -> Arc<Self> {
        Arc::new(Self {
            waiters: Mutex::new(HashMap::new()),
            tokens: AtomicU64::new(0),
        })
    }

    /// Registers a one-shot receiver for `sig`. Dropping the ticket without
    /// a wake deregisters it.
    pub fn subscribe(self: &Arc<Self>, sig: i32) -> Ticket {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.waiters
            .lock()
            .unwrap()
            .entry(sig)
            .or_default()
            .push_back((token, tx));
        Ticket {
            hub: Arc::clone(self),
            sig,
            token,
            rx,
        }
    }

    /// Wakes the next waiter registered for `sig`, if any.
    fn notify(&self, sig: i32) {
        trace!(sig, "signal received");
        let waiter = self
            .waiters
            .lock()
            .unwrap()
            .get_mut(&sig)
            .and_then(VecDeque::pop_front);
        if let Some((_, tx)) = waiter {
            // the receiver may have timed out and gone; that is fine
            drop(tx.send(()));
        }
    }

    fn unsubscribe(&self, sig: i32, token: u64) {
        if let Some(queue) = self.waiters.lock().unwrap().get_mut(&sig) {
            queue.retain(|(t, _)| *t != token);
        }
    }
}

/// A registered one-shot wait for a single completion signal.
pub struct Ticket {
    hub: Arc<Hub>,
    sig: i32,
    token: u64,
    rx: Receiver<()>,
}

impl Ticket {
    /// Waits for the signal or the timeout, whichever comes first. Returns
    /// `true` on a signal wake.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.sig, self.token);
    }
}

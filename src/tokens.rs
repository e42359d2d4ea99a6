//! Capacity token pool.
//!
//! A token is permission to serve one client. The pool is a bounded
//! semaphore: `acquire` suspends until a slot frees, and the returned
//! [`Token`] releases its slot exactly once when dropped, on every exit
//! path. A capacity of 0 means unlimited.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Handle to the token pool. Cheap to clone.
#[derive(Clone)]
pub struct Tokens {
    sem: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
}

/// An outstanding capacity reservation. Dropping it returns the slot.
pub struct Token {
    _permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Token {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Tokens {
    /// Create a pool with the given capacity. 0 = unlimited.
    pub fn new(capacity: usize) -> Self {
        let sem = match capacity {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            sem,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a slot, suspending until one frees. With unlimited
    /// capacity this returns immediately.
    pub async fn acquire(&self) -> Token {
        let permit = match &self.sem {
            None => None,
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    // The pool never closes its semaphore.
                    .expect("token semaphore closed"),
            ),
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Token {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Number of tokens currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Client count as reported to the broker: the in-flight count rounded
    /// down to a multiple of 8, to limit fingerprinting of exact load.
    pub fn num_clients(&self) -> usize {
        (self.in_flight() / 8) * 8
    }
}

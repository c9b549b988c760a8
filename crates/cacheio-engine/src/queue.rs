//! Per-queue request FIFO
//!
//! Worker threads drain requests from these queues. A push transfers
//! ownership: the pusher must not dereference the request afterwards, the
//! next owner is whichever worker pops it.

use crate::request::Request;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Wakes whatever drains the queue.
///
/// `kick` must be safe to call from any context; `kick_sync` may process the
/// queue on the calling thread when the caller allows it.
pub trait QueueKicker: Send + Sync {
    fn kick(&self);

    fn kick_sync(&self) {
        self.kick();
    }
}

/// Kicker that signals a worker through a crossbeam channel.
pub struct ChannelKicker {
    tx: Sender<()>,
}

impl ChannelKicker {
    #[must_use]
    pub fn new() -> (Self, Receiver<()>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl QueueKicker for ChannelKicker {
    fn kick(&self) {
        // A worker that already exited just drops the signal.
        let _ = self.tx.send(());
    }
}

struct NullKicker;

impl QueueKicker for NullKicker {
    fn kick(&self) {}
}

pub struct RequestQueue {
    fifo: Mutex<VecDeque<Arc<Request>>>,
    occupancy: AtomicU64,
    kicker: Box<dyn QueueKicker>,
}

impl RequestQueue {
    pub fn new(kicker: Box<dyn QueueKicker>) -> Self {
        Self {
            fifo: Mutex::new(VecDeque::new()),
            occupancy: AtomicU64::new(0),
            kicker,
        }
    }

    /// Queue without a wakeup mechanism; pops are driven explicitly.
    #[must_use]
    pub fn unkicked() -> Self {
        Self::new(Box::new(NullKicker))
    }

    /// Append a request and kick the worker.
    pub fn push_back(&self, req: Arc<Request>, allow_sync: bool) {
        self.fifo.lock().push_back(req);
        self.occupancy.fetch_add(1, Ordering::Relaxed);
        if allow_sync {
            self.kicker.kick_sync();
        } else {
            self.kicker.kick();
        }
    }

    /// Prepend a request (continuations that must run before queued work)
    /// and kick the worker.
    pub fn push_front(&self, req: Arc<Request>, allow_sync: bool) {
        self.fifo.lock().push_front(req);
        self.occupancy.fetch_add(1, Ordering::Relaxed);
        if allow_sync {
            self.kicker.kick_sync();
        } else {
            self.kicker.kick();
        }
    }

    /// Take the oldest request.
    pub fn pop(&self) -> Option<Arc<Request>> {
        let req = self.fifo.lock().pop_front();
        if req.is_some() {
            self.occupancy.fetch_sub(1, Ordering::Relaxed);
        }
        req
    }

    /// Requests currently queued.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.occupancy.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NullIo;
    use cacheio_common::IoDir;

    fn request(queue: &Arc<RequestQueue>, addr: u64) -> Arc<Request> {
        Request::new(
            0,
            0,
            IoDir::Read,
            addr,
            512,
            4096,
            8,
            queue.clone(),
            Arc::new(NullIo),
            Box::new(|_| {}),
        )
        .unwrap()
    }

    #[test]
    fn test_fifo_order_and_front_override() {
        let queue = Arc::new(RequestQueue::unkicked());
        let a = request(&queue, 0);
        let b = request(&queue, 4096);
        let c = request(&queue, 8192);

        queue.push_back(a.clone(), false);
        queue.push_back(b, false);
        queue.push_front(c.clone(), false);
        assert_eq!(queue.len(), 3);

        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &c));
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &a));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_channel_kicker_signals() {
        let (kicker, rx) = ChannelKicker::new();
        let queue = Arc::new(RequestQueue::new(Box::new(kicker)));
        let req = request(&queue, 0);
        queue.push_back(req, false);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_pop_empty() {
        let queue = RequestQueue::unkicked();
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }
}

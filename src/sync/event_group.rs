//! Bitfield signaling primitive used by the control plane to wake the
//! single engine task.
//!
//! `set` may be called from a task other than the one calling `wait` (e.g. a
//! `queue_work` caller waking the engine), so the bitmask is an `AtomicU32`
//! even though everything else in the engine is single-threaded. Waiting is
//! built on [`tokio::sync::Notify`]: `wait` registers for a notification,
//! re-checks the mask, and loops, racing the whole thing against an optional
//! timeout.
//!
//! Unlike the POSIX reference this is ported from, a non-zero timeout is
//! honored rather than treated as "wait forever" — see
//! [`wait`](EventGroup::wait).

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct EventGroup {
    bits: AtomicU32,
    notify: Notify,
}

impl EventGroup {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            notify: Notify::new(),
        }
    }

    /// ORs `bits_to_set` into the current mask and wakes every waiter.
    /// Returns the mask after the update.
    #[inline]
    pub(crate) fn set(&self, bits_to_set: u32) -> u32 {
        let updated = self.bits.fetch_or(bits_to_set, Ordering::SeqCst) | bits_to_set;
        self.notify.notify_waiters();
        updated
    }

    /// Waits until `bits_to_wait_for` is satisfied (any bit if `all == false`,
    /// every bit if `all == true`), or `timeout` elapses.
    ///
    /// Returns the mask observed at the moment the wait ended. If
    /// `clear_on_exit` is set and the condition was actually met (not just a
    /// timeout), those bits are cleared before returning.
    ///
    /// A `None` timeout waits indefinitely.
    pub(crate) async fn wait(
        &self,
        bits_to_wait_for: u32,
        clear_on_exit: bool,
        all: bool,
        timeout: Option<Duration>,
    ) -> u32 {
        let condition_met = |current: u32| match all {
            true => current & bits_to_wait_for == bits_to_wait_for,
            false => current & bits_to_wait_for != 0,
        };

        let wait_forever = async {
            loop {
                let current = self.bits.load(Ordering::SeqCst);
                if condition_met(current) {
                    if clear_on_exit {
                        self.bits.fetch_and(!bits_to_wait_for, Ordering::SeqCst);
                    }
                    return current;
                }

                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().await;
            }
        };

        match timeout {
            None => wait_forever.await,
            Some(time) => tokio::time::timeout(time, wait_forever)
                .await
                .unwrap_or_else(|_| self.bits.load(Ordering::SeqCst)),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> u32 {
        self.bits.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_wakes_a_pending_wait_any() {
        let group = Arc::new(EventGroup::new());
        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.wait(0b01, false, false, None).await })
        };

        tokio::task::yield_now().await;
        group.set(0b01);

        assert_eq!(waiter.await.unwrap(), 0b01);
    }

    #[tokio::test]
    async fn wait_for_all_requires_every_bit() {
        let group = EventGroup::new();
        group.set(0b01);

        let result = group.wait(0b11, false, true, Some(Duration::from_millis(20)));
        assert_eq!(result.await, 0b01);

        group.set(0b10);
        let result = group.wait(0b11, false, true, Some(Duration::from_millis(20)));
        assert_eq!(result.await, 0b11);
    }

    #[tokio::test]
    async fn clear_on_exit_clears_only_the_waited_bits() {
        let group = EventGroup::new();
        group.set(0b11);

        let seen = group.wait(0b01, true, false, None).await;
        assert_eq!(seen, 0b11);
        assert_eq!(group.get(), 0b10);
    }

    #[tokio::test]
    async fn timeout_returns_current_bits_without_clearing() {
        let group = EventGroup::new();
        let seen = group
            .wait(0b01, true, false, Some(Duration::from_millis(10)))
            .await;
        assert_eq!(seen, 0);
        assert_eq!(group.get(), 0);
    }
}

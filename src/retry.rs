//! QoS 1 retransmission scheduler.
//!
//! Every unacknowledged QoS 1 delivery, broker wide, is tracked here under
//! (client id, packet id). A single sweeper task walks the table and
//! re-sends overdue messages through the owning session's mailbox with the
//! DUP flag set, doubling the delay after each attempt:
//! `base_retry_timeout * 2^(n-1)` before the nth retransmission.

use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::packet::Publish;
use crate::types::{ClientId, DashMap, DeliveryKey, Id, Message, Tx};

#[derive(Clone)]
pub struct PendingDelivery {
    /// The session this delivery belongs to.
    pub to: Id,
    pub from: Id,
    pub publish: Publish,
    /// Retransmissions performed so far.
    pub attempts: u32,
    next_retry_at: Instant,
    tx: Tx,
}

#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<RetrySchedulerInner>,
}

struct RetrySchedulerInner {
    pending: DashMap<DeliveryKey, PendingDelivery>,
    base_retry_timeout: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    pub fn new(base_retry_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(RetrySchedulerInner {
                pending: DashMap::default(),
                base_retry_timeout,
                sweep_interval,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Registers a delivery awaiting PUBACK. The first retransmission is
    /// due one base timeout from now.
    pub fn track(&self, to: Id, packet_id: NonZeroU16, from: Id, publish: Publish, tx: Tx) {
        let next_retry_at = Instant::now() + self.inner.base_retry_timeout;
        self.inner.pending.insert(
            (to.client_id.clone(), packet_id),
            PendingDelivery { to, from, publish, attempts: 0, next_retry_at, tx },
        );
    }

    /// Settles a delivery on PUBACK. Unknown ids yield None and are
    /// ignored by callers.
    pub fn acknowledge(&self, client_id: &ClientId, packet_id: NonZeroU16) -> Option<PendingDelivery> {
        self.inner.pending.remove(&(client_id.clone(), packet_id)).map(|(_, p)| p)
    }

    /// Drops every pending delivery of one session. Called on teardown.
    /// Entries held by a newer session of the same client id are left
    /// alone, so a superseded session's late teardown cannot end its
    /// replacement's redelivery.
    pub fn cancel_all(&self, id: &Id) -> usize {
        let mut removed = 0;
        self.inner.pending.retain(|_, delivery| {
            if delivery.to == *id {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Spawns the sweeper task. Idempotent.
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let this = self.clone();
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.inner.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                this.sweep();
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut dead = Vec::new();
        for mut entry in self.inner.pending.iter_mut() {
            let key = entry.key().clone();
            let delivery = entry.value_mut();
            if delivery.next_retry_at > now {
                continue;
            }
            delivery.attempts += 1;
            delivery.publish.dup = true;
            delivery.next_retry_at = now + self.backoff(delivery.attempts);
            log::debug!(
                "resend unacked publish to {:?}, packet_id: {}, attempts: {}",
                key.0,
                key.1,
                delivery.attempts
            );
            if delivery.tx.unbounded_send(Message::Retry(delivery.publish.clone())).is_err() {
                // session is gone, teardown will have cancelled the rest
                dead.push(key);
            }
        }
        for key in dead {
            self.inner.pending.remove(&key);
        }
    }

    /// Delay until the next retransmission after `attempts` of them.
    fn backoff(&self, attempts: u32) -> Duration {
        self.inner.base_retry_timeout.saturating_mul(1u32 << attempts.min(16))
    }
}

impl Drop for RetrySchedulerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use shared::domain::{CounterField, CounterRecord, SubscriptionId, UserId};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::Result;

/// A realtime document store holding one counter record per user.
///
/// Both subscriptions deliver an initial snapshot and then a fresh one after every change
/// they can observe. They never end on their own unless the backing connection is lost
/// for good.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Watches the record keyed by `user_id`; `None` while it does not exist.
    async fn subscribe_record(&self, user_id: UserId)
        -> Result<Subscription<Option<CounterRecord>>>;

    /// Watches every record, ordered by `order_by` descending.
    async fn subscribe_collection(
        &self,
        order_by: &CounterField,
    ) -> Result<Subscription<Vec<CounterRecord>>>;

    /// Atomically applies `field += delta`, creating the record or field if absent.
    /// Returns the stored value after the change.
    async fn atomic_increment(
        &self,
        user_id: UserId,
        field: &CounterField,
        delta: i64,
    ) -> Result<i64>;
}

/// Store-side hook run once when a subscription is cancelled.
pub trait Canceller: Send + Sync {
    fn cancel(&self, id: SubscriptionId);
}

#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    cancelled: Arc<AtomicBool>,
    canceller: Arc<dyn Canceller>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Stops delivery. Items already buffered are discarded too. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.canceller.cancel(self.id);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A cancellable stream of snapshots. Dropping it cancels it.
pub struct Subscription<T> {
    inner: BoxStream<'static, T>,
    handle: SubscriptionHandle,
    cancel_on_drop: bool,
}

impl<T: Send + 'static> Subscription<T> {
    pub fn from_receiver(
        id: SubscriptionId,
        receiver: mpsc::UnboundedReceiver<T>,
        canceller: Arc<dyn Canceller>,
    ) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(receiver).boxed(),
            handle: SubscriptionHandle {
                id,
                cancelled: Arc::new(AtomicBool::new(false)),
                canceller,
            },
            cancel_on_drop: true,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.handle.id
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Splits into the stream and a handle that can cancel it from elsewhere.
    pub fn into_parts(self) -> (Self, SubscriptionHandle) {
        let handle = self.handle();
        (self, handle)
    }

    /// Transforms every item while keeping the same cancellation handle.
    pub fn map<U, F>(mut self, f: F) -> Subscription<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let inner = std::mem::replace(&mut self.inner, stream::empty().boxed());
        self.cancel_on_drop = false;
        Subscription {
            inner: inner.map(f).boxed(),
            handle: self.handle.clone(),
            cancel_on_drop: true,
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if self.handle.is_cancelled() {
            return Poll::Ready(None);
        }
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if self.cancel_on_drop {
            self.handle.cancel();
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

//! Stream-based subscriptions.
//!
//! A [`SubscriptionSource`] describes a long-lived source of values (a query
//! entry, a connection's event channel, a polled element rect) and can be turned
//! into a boxed stream on demand. Each source has a [`SubscriptionId`] so a
//! consumer that rebuilds its subscriptions on every tick can tell which ones
//! actually changed and restart only those.
//!
//! [`Subscription`] is the type-erased form, with [`map`](Subscription::map) for
//! adapting the output to the consumer's message type.

use std::any::TypeId;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;

/// Identity of a subscription: the source type plus a hash of its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    type_id: TypeId,
    hash: u64,
}

impl SubscriptionId {
    /// Builds an id for source type `T` with configuration hash `hash`.
    pub fn of<T: 'static>(hash: u64) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            hash,
        }
    }
}

/// A source of values that can be subscribed to.
pub trait SubscriptionSource: Send + Sync + 'static {
    type Output;

    /// Starts the source and returns its stream of values.
    fn stream(&self) -> BoxStream<'static, Self::Output>;

    /// The identity used to de-duplicate subscriptions.
    fn id(&self) -> SubscriptionId;
}

type Spawn<T> = Arc<dyn Fn() -> BoxStream<'static, T> + Send + Sync>;

/// A type-erased subscription.
pub struct Subscription<T> {
    pub(crate) id: SubscriptionId,
    pub(crate) spawn: Spawn<T>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            spawn: self.spawn.clone(),
        }
    }
}

impl<T: Send + 'static> Subscription<T> {
    /// Wraps a source.
    pub fn new<S>(source: S) -> Self
    where
        S: SubscriptionSource<Output = T>,
    {
        let id = source.id();
        let source = Arc::new(source);
        Self {
            id,
            spawn: Arc::new(move || source.stream()),
        }
    }

    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Starts a new stream from the underlying source.
    pub fn stream(&self) -> BoxStream<'static, T> {
        (self.spawn)()
    }

    /// Transforms every value.
    ///
    /// The id is kept, so a mapped subscription is still recognized as the same one.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> Subscription<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let spawn = self.spawn;
        let f = Arc::new(f);
        Subscription {
            id: self.id,
            spawn: Arc::new(move || {
                let f = f.clone();
                spawn().map(move |value| f(value)).boxed()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::hash::{DefaultHasher, Hash, Hasher};

    use futures::stream;

    use super::*;

    #[derive(Hash)]
    struct Counter {
        upto: u32,
    }

    impl SubscriptionSource for Counter {
        type Output = u32;

        fn stream(&self) -> BoxStream<'static, u32> {
            stream::iter(1..=self.upto).boxed()
        }

        fn id(&self) -> SubscriptionId {
            let mut hasher = DefaultHasher::new();
            self.hash(&mut hasher);
            SubscriptionId::of::<Self>(hasher.finish())
        }
    }

    #[tokio::test]
    async fn test_map_keeps_id_and_transforms_values() {
        let sub = Subscription::new(Counter { upto: 3 });
        let id = sub.id();

        let mapped = sub.map(|n| n * 10);
        assert_eq!(mapped.id(), id);

        let values: Vec<u32> = mapped.stream().collect().await;
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn test_id_depends_on_type_and_config() {
        let a = Subscription::new(Counter { upto: 3 });
        let b = Subscription::new(Counter { upto: 3 });
        let c = Subscription::new(Counter { upto: 4 });
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_ne!(a.id(), SubscriptionId::of::<u32>(0));
    }

    #[tokio::test]
    async fn test_each_stream_starts_fresh() {
        let sub = Subscription::new(Counter { upto: 2 });
        let first: Vec<u32> = sub.stream().collect().await;
        let second: Vec<u32> = sub.stream().collect().await;
        assert_eq!(first, second);
    }
}

//! Named references to UI elements and other ephemeral state.
//!
//! A [`RefStore`] maps a name to the current value registered under it; the
//! last write wins. Nothing here is persisted.
//!
//! [`RectObserver`] polls the [`Rect`] of a named ref at a fixed interval and
//! yields it whenever it changed, for layouts that follow another element.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use tokio::time::{MissedTickBehavior, interval};
use tokio_stream::wrappers::IntervalStream;

use crate::subscription::{SubscriptionId, SubscriptionSource};

/// Shared name→value registry. Clones share the same map.
#[derive(Debug)]
pub struct RefStore<T> {
    refs: Arc<DashMap<String, T>>,
}

impl<T> Clone for RefStore<T> {
    fn clone(&self) -> Self {
        Self {
            refs: self.refs.clone(),
        }
    }
}

impl<T> Default for RefStore<T> {
    fn default() -> Self {
        Self {
            refs: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Clone> RefStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<T> {
        self.refs.get(name).map(|r| r.value().clone())
    }

    /// Registers `value` under `name`, returning the value it replaced.
    pub fn set(&self, name: impl Into<String>, value: T) -> Option<T> {
        self.refs.insert(name.into(), value)
    }

    pub fn remove(&self, name: &str) -> Option<T> {
        self.refs.remove(name).map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.refs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Position and size of an element.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Something whose on-screen rect can be read.
pub trait Measure {
    /// `None` while the element is not laid out.
    fn rect(&self) -> Option<Rect>;
}

impl Measure for Rect {
    fn rect(&self) -> Option<Rect> {
        Some(*self)
    }
}

/// Polls the rect of one named ref.
///
/// The stream yields the first reading right away and afterwards only
/// readings that differ from the previous one. A missing ref reads as `None`.
pub struct RectObserver<T> {
    refs: RefStore<T>,
    name: String,
    interval_ms: u64,
}

impl<T> RectObserver<T> {
    pub fn new(refs: RefStore<T>, name: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            refs,
            name: name.into(),
            interval_ms,
        }
    }
}

impl<T> SubscriptionSource for RectObserver<T>
where
    T: Measure + Clone + Send + Sync + 'static,
{
    type Output = Option<Rect>;

    fn stream(&self) -> BoxStream<'static, Option<Rect>> {
        let mut ticks = interval(Duration::from_millis(self.interval_ms.max(1)));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let refs = self.refs.clone();
        let name = self.name.clone();
        let state = (IntervalStream::new(ticks), None::<Option<Rect>>);

        stream::unfold(state, move |(mut ticks, mut last)| {
            let refs = refs.clone();
            let name = name.clone();
            async move {
                loop {
                    ticks.next().await?;
                    let rect = refs.get(&name).and_then(|r| r.rect());
                    if last != Some(rect) {
                        last = Some(rect);
                        return Some((rect, (ticks, last)));
                    }
                }
            }
        })
        .boxed()
    }

    fn id(&self) -> SubscriptionId {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.interval_ms.hash(&mut hasher);
        SubscriptionId::of::<Self>(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let refs = RefStore::new();
        assert_eq!(refs.set("panel", 1), None);
        assert_eq!(refs.set("panel", 2), Some(1));
        assert_eq!(refs.get("panel"), Some(2));
        assert_eq!(refs.len(), 1);

        let shared = refs.clone();
        assert_eq!(shared.remove("panel"), Some(2));
        assert!(!refs.contains("panel"));
        assert!(refs.is_empty());
    }

    #[test]
    fn test_rect_observer_id() {
        let refs: RefStore<Rect> = RefStore::new();
        let a = RectObserver::new(refs.clone(), "panel", 100);
        let b = RectObserver::new(refs.clone(), "panel", 100);
        let c = RectObserver::new(refs, "sidebar", 100);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rect_observer_emits_changes_only() {
        let refs = RefStore::new();
        let first = Rect { x: 0.0, y: 0.0, width: 100.0, height: 50.0 };
        refs.set("panel", first);

        let mut stream = RectObserver::new(refs.clone(), "panel", 100).stream();
        assert_eq!(stream.next().await, Some(Some(first)));

        let moved = Rect { x: 10.0, ..first };
        refs.set("panel", moved);
        assert_eq!(stream.next().await, Some(Some(moved)));

        refs.remove("panel");
        assert_eq!(stream.next().await, Some(None));
    }
}

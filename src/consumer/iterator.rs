use std::iter::Cycle;
use std::sync::Arc;
use std::vec;

use super::Consumer;

/// Round-robin cursor over a point-in-time snapshot of a queue's consumers.
///
/// The sequence never ends on its own when the snapshot is non-empty;
/// callers decide when to stop.
pub struct CyclicConsumerIterator {
    inner: Cycle<vec::IntoIter<Arc<dyn Consumer>>>,
    len: usize,
}

impl CyclicConsumerIterator {
    pub fn new(snapshot: Vec<Arc<dyn Consumer>>) -> Self {
        let len = snapshot.len();
        Self {
            inner: snapshot.into_iter().cycle(),
            len,
        }
    }

    pub fn has_next(&self) -> bool {
        self.len > 0
    }

    /// Number of consumers in the snapshot.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Iterator for CyclicConsumerIterator {
    type Item = Arc<dyn Consumer>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ChannelConsumer;

    #[test]
    fn test_empty_snapshot_has_no_next() {
        let mut iterator = CyclicConsumerIterator::new(Vec::new());
        assert!(!iterator.has_next());
        assert!(iterator.next().is_none());
    }

    #[test]
    fn test_cycles_in_snapshot_order() {
        let (a, _rx_a) = ChannelConsumer::new("q", 1);
        let (b, _rx_b) = ChannelConsumer::new("q", 1);
        let a: Arc<dyn Consumer> = Arc::new(a);
        let b: Arc<dyn Consumer> = Arc::new(b);

        let iterator = CyclicConsumerIterator::new(vec![a.clone(), b.clone()]);
        assert!(iterator.has_next());
        assert_eq!(iterator.len(), 2);

        let ids: Vec<_> = iterator.take(5).map(|c| c.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id(), a.id(), b.id(), a.id()]);
    }
}

//! The ordered chain of live partitions, newest at the head.

use crate::partition::SharedPartition;
use crate::{Result, TidemarkError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Node {
    partition: SharedPartition,
    next: RwLock<Option<Arc<Node>>>,
}

/// Singly-linked list of partitions ordered newest to oldest.
///
/// Structural mutations serialize on a mutation lock; iterators snapshot the
/// head under a read lock and then walk without further locking. Nodes are
/// reference counted, so an in-flight iterator keeps any chain it already
/// reached alive even while `remove` unlinks nodes.
pub struct PartitionList {
    head: RwLock<Option<Arc<Node>>>,
    mutation: Mutex<()>,
    len: AtomicUsize,
}

impl PartitionList {
    pub fn new() -> Self {
        Self {
            head: RwLock::new(None),
            mutation: Mutex::new(()),
            len: AtomicUsize::new(0),
        }
    }

    /// Pushes a partition as the new head.
    pub fn insert(&self, partition: SharedPartition) {
        let _guard = self.mutation.lock();
        let node = Arc::new(Node {
            partition,
            next: RwLock::new(self.head.read().clone()),
        });
        *self.head.write() = Some(node);
        self.len.fetch_add(1, Ordering::SeqCst);
    }

    /// Unlinks `target` and calls its `clean()`. Partitions are matched by
    /// identity, so two partitions with equal bounds never alias.
    pub fn remove(&self, target: &SharedPartition) -> Result<()> {
        let _guard = self.mutation.lock();

        let mut head = self.head.write();
        if let Some(node) = head.clone() {
            if Arc::ptr_eq(&node.partition, target) {
                *head = node.next.read().clone();
                drop(head);
                self.len.fetch_sub(1, Ordering::SeqCst);
                return target.clean();
            }
        }
        drop(head);

        let mut prev = self.head.read().clone();
        while let Some(node) = prev {
            let next = node.next.read().clone();
            match next {
                Some(ref candidate) if Arc::ptr_eq(&candidate.partition, target) => {
                    *node.next.write() = candidate.next.read().clone();
                    self.len.fetch_sub(1, Ordering::SeqCst);
                    return target.clean();
                }
                _ => prev = next,
            }
        }

        Err(TidemarkError::PartitionNotFound {
            min_timestamp: target.min_timestamp(),
        })
    }

    /// Replaces `old` with `new` in place, preserving the chain around it.
    pub fn swap(&self, old: &SharedPartition, new: SharedPartition) -> Result<()> {
        let _guard = self.mutation.lock();

        let mut head = self.head.write();
        if let Some(node) = head.clone() {
            if Arc::ptr_eq(&node.partition, old) {
                *head = Some(Arc::new(Node {
                    partition: new,
                    next: RwLock::new(node.next.read().clone()),
                }));
                return Ok(());
            }
        }
        drop(head);

        let mut prev = self.head.read().clone();
        while let Some(node) = prev {
            let next = node.next.read().clone();
            match next {
                Some(ref candidate) if Arc::ptr_eq(&candidate.partition, old) => {
                    *node.next.write() = Some(Arc::new(Node {
                        partition: new,
                        next: RwLock::new(candidate.next.read().clone()),
                    }));
                    return Ok(());
                }
                _ => prev = next,
            }
        }

        Err(TidemarkError::PartitionNotFound {
            min_timestamp: old.min_timestamp(),
        })
    }

    /// The newest partition, if any.
    pub fn head(&self) -> Option<SharedPartition> {
        self.head.read().as_ref().map(|n| n.partition.clone())
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates newest to oldest over a snapshot taken at call time;
    /// partitions inserted afterwards are not observed.
    pub fn iter(&self) -> Iter {
        Iter {
            cursor: self.head.read().clone(),
        }
    }
}

impl Default for PartitionList {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter {
    cursor: Option<Arc<Node>>,
}

impl Iterator for Iter {
    type Item = SharedPartition;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor.take()?;
        self.cursor = node.next.read().clone();
        Some(node.partition.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;
    use crate::{DataPoint, Label, Row};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    struct FakePartition {
        min: i64,
        cleaned: AtomicBool,
    }

    impl FakePartition {
        fn shared(min: i64) -> (Arc<Self>, SharedPartition) {
            let inner = Arc::new(Self {
                min,
                cleaned: AtomicBool::new(false),
            });
            let shared: SharedPartition = inner.clone();
            (inner, shared)
        }
    }

    impl Partition for FakePartition {
        fn insert_rows(&self, _rows: &[Row]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        fn select_data_points(
            &self,
            _metric: &str,
            _labels: &[Label],
            _start: i64,
            _end: i64,
        ) -> Result<Vec<DataPoint>> {
            Ok(Vec::new())
        }

        fn min_timestamp(&self) -> i64 {
            self.min
        }

        fn max_timestamp(&self) -> i64 {
            self.min
        }

        fn size(&self) -> usize {
            1
        }

        fn active(&self) -> bool {
            false
        }

        fn expired(&self) -> bool {
            false
        }

        fn clean(&self) -> Result<()> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn insert_keeps_newest_first() {
        let list = PartitionList::new();
        let (_, oldest) = FakePartition::shared(1);
        let (_, middle) = FakePartition::shared(2);
        let (_, newest) = FakePartition::shared(3);

        list.insert(oldest);
        list.insert(middle);
        list.insert(newest);

        let mins: Vec<i64> = list.iter().map(|p| p.min_timestamp()).collect();
        assert_eq!(mins, vec![3, 2, 1]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.head().unwrap().min_timestamp(), 3);
    }

    #[test]
    fn remove_unlinks_and_cleans_exactly_the_target() {
        let list = PartitionList::new();
        let (first_inner, first) = FakePartition::shared(100);
        // Same min timestamp on purpose: identity matching must not alias.
        let (second_inner, second) = FakePartition::shared(100);

        list.insert(first.clone());
        list.insert(second.clone());

        list.remove(&first).unwrap();

        let remaining: Vec<_> = list.iter().collect();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &second));
        assert!(first_inner.cleaned.load(Ordering::SeqCst));
        assert!(!second_inner.cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn remove_missing_partition_errors() {
        let list = PartitionList::new();
        let (_, present) = FakePartition::shared(1);
        let (_, absent) = FakePartition::shared(2);
        list.insert(present);

        assert!(matches!(
            list.remove(&absent),
            Err(TidemarkError::PartitionNotFound { .. })
        ));
        assert!(matches!(
            PartitionList::new().remove(&absent),
            Err(TidemarkError::PartitionNotFound { .. })
        ));
    }

    #[test]
    fn swap_replaces_in_place() {
        let list = PartitionList::new();
        let (_, a) = FakePartition::shared(1);
        let (_, b) = FakePartition::shared(2);
        let (_, c) = FakePartition::shared(3);
        list.insert(a);
        list.insert(b.clone());
        list.insert(c);

        let (_, replacement) = FakePartition::shared(20);
        list.swap(&b, replacement).unwrap();

        let mins: Vec<i64> = list.iter().map(|p| p.min_timestamp()).collect();
        assert_eq!(mins, vec![3, 20, 1]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn iterator_snapshot_ignores_later_inserts() {
        let list = PartitionList::new();
        let (_, a) = FakePartition::shared(1);
        list.insert(a);

        let iter = list.iter();
        let (_, b) = FakePartition::shared(2);
        list.insert(b);

        assert_eq!(iter.count(), 1);
        assert_eq!(list.iter().count(), 2);
    }

    #[test]
    fn iterator_survives_concurrent_removal() {
        let list = PartitionList::new();
        let (_, a) = FakePartition::shared(1);
        let (_, b) = FakePartition::shared(2);
        list.insert(a.clone());
        list.insert(b);

        let mut iter = list.iter();
        iter.next(); // positioned past the head
        list.remove(&a).unwrap();

        // The unlinked node is still reachable from the snapshot.
        assert_eq!(iter.next().unwrap().min_timestamp(), 1);
        assert!(iter.next().is_none());
    }

    #[test]
    fn concurrent_inserts_keep_count_consistent() {
        let list = Arc::new(PartitionList::new());
        let threads = 8;
        let per_thread = 16;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let (_, p) = FakePartition::shared((t * per_thread + i) as i64);
                        list.insert(p);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(list.len(), threads * per_thread);
        assert_eq!(list.iter().count(), threads * per_thread);
    }
}

use std::fmt::Debug;

/// Items that are handed out a bounded number of times.
///
/// Every [`pop`](RedundantQueue::pop) returns all live items and spends one unit of each item's
/// redundancy; an item pushed with redundancy `r` is returned by exactly the next `r` pops. This is
/// how messages survive a lossy transport without acknowledgements: each is simply sent `r` times.
///
/// With the redundancy read as "refresh cycles left", the same queue doubles as a TTL cache, in
/// which case [`expire`](RedundantQueue::expire) ages it without collecting the values.
#[derive(Debug, Clone)]
pub struct RedundantQueue<T> {
  items: Vec<(T, usize)>,
}
impl<T> Default for RedundantQueue<T> {
  fn default() -> Self {
    RedundantQueue { items: Vec::new() }
  }
}
impl<T: Clone + Debug> RedundantQueue<T> {
  /// An empty queue.
  pub fn new() -> RedundantQueue<T> {
    Self::default()
  }

  /// A redundancy of zero drops `value`.
  pub fn push(&mut self, value: T, redundancy: usize) {
    if redundancy > 0 {
      self.items.push((value, redundancy));
    }
  }

  /// All live items, oldest first. Items that used up their redundancy are removed.
  pub fn pop(&mut self) -> Vec<T> {
    let values = self.peek();
    self.expire();
    values
  }

  /// Same as [`pop`](RedundantQueue::pop), without spending anything.
  pub fn peek(&self) -> Vec<T> {
    self.iter().cloned().collect()
  }

  /// Spends one unit of every item's redundancy.
  pub fn expire(&mut self) {
    self.items.retain_mut(|(_, r)| {
      *r -= 1;
      *r > 0
    });
  }

  /// The live items, oldest first.
  pub fn iter(&self) -> impl Iterator<Item = &T> {
    self.items.iter().map(|(v, _)| v)
  }

  /// Drops every item.
  pub fn clear(&mut self) {
    self.items.clear();
  }

  /// Number of live items, regardless of redundancy left.
  pub fn len(&self) -> usize {
    self.items.len()
  }

  /// Whether no item is live.
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}
impl<T: Clone + Debug + PartialEq> RedundantQueue<T> {
  /// Whether `value` is live.
  pub fn contains(&self, value: &T) -> bool {
    self.iter().any(|v| v == value)
  }
}

#[test]
fn test_redundant_queue_pops() {
  let mut queue = RedundantQueue::new();
  queue.push("a", 3);
  queue.push("b", 1);
  assert_eq!(queue.pop(), vec!["a", "b"]);
  queue.push("c", 2);
  assert_eq!(queue.pop(), vec!["a", "c"]);
  assert_eq!(queue.pop(), vec!["a", "c"]);
  assert!(queue.pop().is_empty());
  assert!(queue.is_empty());
}

#[test]
fn test_redundant_queue_peek_and_zero() {
  let mut queue = RedundantQueue::new();
  queue.push(7u32, 0);
  assert!(queue.is_empty());
  queue.push(7, 2);
  for _ in 0..5 {
    assert_eq!(queue.peek(), vec![7]);
  }
  assert_eq!(queue.len(), 1);
  assert!(queue.contains(&7));
  queue.expire();
  assert_eq!(queue.pop(), vec![7]);
  assert!(!queue.contains(&7));
  queue.push(8, 10);
  queue.clear();
  assert!(queue.pop().is_empty());
}

use std::time::Duration;
use tokio::time::Instant;

struct IdleEntry<T> {
    item: T,
    idle_since: Instant,
}

/// Outcome of taking the most recently freed entry.
#[derive(Debug)]
pub enum Popped<T> {
    Empty,
    Fresh(T),
    /// Idle longer than allowed; the caller must close it.
    Expired(T),
}

/// Fixed-capacity circular buffer of idle connections, newest at `head`.
///
/// `head` indexes the most recent entry and `tail` the slot just before the
/// oldest one, so `head == tail` means empty and one slot always stays unused.
/// `limit` is the logical idle size; the physical array may be larger.
pub struct IdleRing<T> {
    slots: Box<[Option<IdleEntry<T>>]>,
    head: usize,
    tail: usize,
    limit: usize,
}

impl<T> IdleRing<T> {
    pub fn new(capacity: usize, limit: usize) -> Self {
        let capacity = capacity.max(2);
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>();

        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            tail: 0,
            limit: limit.min(capacity - 1),
        }
    }

    pub fn len(&self) -> usize {
        let cap = self.slots.len();
        (self.head + cap - self.tail) % cap
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Insert at the head. Hands the item back when the logical limit is reached.
    pub fn push(&mut self, item: T, idle_since: Instant) -> Result<(), T> {
        if self.len() >= self.limit {
            return Err(item);
        }

        self.head = (self.head + 1) % self.slots.len();
        self.slots[self.head] = Some(IdleEntry { item, idle_since });
        Ok(())
    }

    /// Take the most recently freed entry.
    pub fn pop_newest(&mut self, now: Instant, max_idle: Duration) -> Popped<T> {
        if self.is_empty() {
            return Popped::Empty;
        }

        let cap = self.slots.len();
        let entry = self.slots[self.head].take();
        self.head = (self.head + cap - 1) % cap;

        match entry {
            Some(entry) if is_expired(entry.idle_since, now, max_idle) => {
                Popped::Expired(entry.item)
            }
            Some(entry) => Popped::Fresh(entry.item),
            None => Popped::Empty,
        }
    }

    /// Remove entries from the oldest end while they have been idle at least
    /// `max_idle`.
    pub fn evict_expired(&mut self, now: Instant, max_idle: Duration) -> Vec<T> {
        let cap = self.slots.len();
        let mut evicted = Vec::new();

        while !self.is_empty() {
            let next_tail = (self.tail + 1) % cap;
            let expired = match &self.slots[next_tail] {
                Some(entry) => is_expired(entry.idle_since, now, max_idle),
                None => true,
            };

            if !expired {
                break;
            }

            if let Some(entry) = self.slots[next_tail].take() {
                evicted.push(entry.item);
            }
            self.tail = next_tail;
        }

        evicted
    }

    /// Remove everything.
    pub fn drain(&mut self) -> Vec<T> {
        self.head = 0;
        self.tail = 0;
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.take())
            .map(|entry| entry.item)
            .collect()
    }

    /// Idle start of the oldest entry.
    pub fn oldest_idle_since(&self) -> Option<Instant> {
        if self.is_empty() {
            return None;
        }
        let next_tail = (self.tail + 1) % self.slots.len();
        self.slots[next_tail].as_ref().map(|entry| entry.idle_since)
    }
}

fn is_expired(idle_since: Instant, now: Instant, max_idle: Duration) -> bool {
    now.saturating_duration_since(idle_since) >= max_idle
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(10);

    #[test]
    fn pops_most_recent_first() {
        let now = Instant::now();
        let mut ring = IdleRing::new(8, 4);
        ring.push(1, now).unwrap();
        ring.push(2, now).unwrap();
        ring.push(3, now).unwrap();
        assert_eq!(ring.len(), 3);

        assert!(matches!(ring.pop_newest(now, IDLE), Popped::Fresh(3)));
        assert!(matches!(ring.pop_newest(now, IDLE), Popped::Fresh(2)));
        assert!(matches!(ring.pop_newest(now, IDLE), Popped::Fresh(1)));
        assert!(matches!(ring.pop_newest(now, IDLE), Popped::Empty));
        assert!(ring.is_empty());
    }

    #[test]
    fn push_refuses_beyond_logical_limit() {
        let now = Instant::now();
        let mut ring = IdleRing::new(64, 2);
        ring.push("a", now).unwrap();
        ring.push("b", now).unwrap();
        assert_eq!(ring.push("c", now), Err("c"));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn limit_is_clamped_to_physical_capacity() {
        let ring: IdleRing<u8> = IdleRing::new(4, 16);
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.limit(), 3);
    }

    #[test]
    fn wraps_around_the_array() {
        let now = Instant::now();
        let mut ring = IdleRing::new(4, 3);
        for round in 0..10 {
            ring.push(round, now).unwrap();
            ring.push(round + 100, now).unwrap();
            assert_eq!(ring.len(), 2);
            assert!(matches!(ring.pop_newest(now, IDLE), Popped::Fresh(v) if v == round + 100));
            assert!(matches!(ring.pop_newest(now, IDLE), Popped::Fresh(v) if v == round));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn expired_head_is_handed_back_for_closing() {
        let start = Instant::now();
        let mut ring = IdleRing::new(8, 4);
        ring.push(7, start).unwrap();

        let later = start + Duration::from_secs(11);
        assert!(matches!(ring.pop_newest(later, IDLE), Popped::Expired(7)));
        assert!(ring.is_empty());
    }

    #[test]
    fn evicts_only_expired_tail_entries() {
        let start = Instant::now();
        let mut ring = IdleRing::new(8, 6);
        ring.push(1, start).unwrap();
        ring.push(2, start + Duration::from_secs(2)).unwrap();
        ring.push(3, start + Duration::from_secs(8)).unwrap();

        let evicted = ring.evict_expired(start + Duration::from_secs(12), IDLE);
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.oldest_idle_since(), Some(start + Duration::from_secs(8)));
    }

    #[test]
    fn drain_empties_everything() {
        let now = Instant::now();
        let mut ring = IdleRing::new(4, 3);
        ring.push(1, now).unwrap();
        ring.push(2, now).unwrap();
        ring.pop_newest(now, IDLE);
        ring.push(3, now).unwrap();

        let mut drained = ring.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 3]);
        assert!(ring.is_empty());
        assert_eq!(ring.oldest_idle_since(), None);
    }
}

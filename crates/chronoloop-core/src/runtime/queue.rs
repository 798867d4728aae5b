//! Deadline-ordered event queue.

use std::collections::VecDeque;

use crate::message::Message;

/// A message waiting for its deadline (monotonic microseconds).
#[derive(Debug)]
pub(crate) struct Event {
    pub when_us: i64,
    pub message: Message,
}

/// Events sorted by ascending deadline. Equal deadlines keep insertion order.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert before the first event with a later deadline.
    ///
    /// Returns `true` when the new event became the head of the queue.
    pub fn insert(&mut self, when_us: i64, message: Message) -> bool {
        let index = self
            .events
            .iter()
            .position(|event| event.when_us > when_us)
            .unwrap_or(self.events.len());
        self.events.insert(index, Event { when_us, message });
        index == 0
    }

    pub fn front_deadline(&self) -> Option<i64> {
        self.events.front().map(|event| event.when_us)
    }

    pub fn pop_front(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: i32) -> Message {
        let mut msg = Message::with_what(1);
        msg.set_int32("tag", tag).unwrap();
        msg
    }

    #[test]
    fn test_drains_in_deadline_order_with_stable_ties() {
        let mut queue = EventQueue::new();
        let deadlines = [50, 10, 30, 10, 50, 0, 30, 10];
        for (tag, when) in deadlines.iter().enumerate() {
            queue.insert(*when, tagged(tag as i32));
        }

        let mut drained = Vec::new();
        while let Some(event) = queue.pop_front() {
            drained.push((event.when_us, event.message.find_int32("tag").unwrap()));
        }

        assert_eq!(
            drained,
            vec![
                (0, 5),
                (10, 1),
                (10, 3),
                (10, 7),
                (30, 2),
                (30, 6),
                (50, 0),
                (50, 4),
            ]
        );
    }

    #[test]
    fn test_insert_reports_new_head() {
        let mut queue = EventQueue::new();
        assert!(queue.insert(100, tagged(0)));
        assert!(!queue.insert(200, tagged(1)));
        assert!(!queue.insert(100, tagged(2)));
        assert!(queue.insert(50, tagged(3)));
        assert_eq!(queue.front_deadline(), Some(50));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_extreme_deadlines() {
        let mut queue = EventQueue::new();
        queue.insert(i64::MAX, tagged(0));
        queue.insert(i64::MIN, tagged(1));
        queue.insert(0, tagged(2));
        let order: Vec<i64> = std::iter::from_fn(|| queue.pop_front().map(|e| e.when_us)).collect();
        assert_eq!(order, vec![i64::MIN, 0, i64::MAX]);
        assert!(queue.is_empty());
    }
}

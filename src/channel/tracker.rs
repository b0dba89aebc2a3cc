//! In-flight and deferred message tracking.
//!
//! Both trackers sit on a [`DeadlineQueue`]: a map from message id to entry
//! plus an ordered index of `(deadline, id)`, so insert, remove-by-id and
//! pop-earliest are all O(log n).

use crate::error::{Error, Result};
use crate::message::{Message, MessageId};
use crate::ClientId;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

pub(crate) struct DeadlineQueue<T> {
    entries: HashMap<MessageId, (Instant, T)>,
    order: BTreeSet<(Instant, MessageId)>,
}

impl<T> DeadlineQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeSet::new(),
        }
    }

    /// Hands the value back if `id` is already queued.
    pub(crate) fn insert(&mut self, id: MessageId, at: Instant, value: T) -> std::result::Result<(), T> {
        if self.entries.contains_key(&id) {
            return Err(value);
        }
        self.order.insert((at, id));
        self.entries.insert(id, (at, value));
        Ok(())
    }

    pub(crate) fn get(&self, id: &MessageId) -> Option<&(Instant, T)> {
        self.entries.get(id)
    }

    pub(crate) fn remove(&mut self, id: &MessageId) -> Option<(Instant, T)> {
        let (at, value) = self.entries.remove(id)?;
        self.order.remove(&(at, *id));
        Some((at, value))
    }

    pub(crate) fn reschedule(&mut self, id: &MessageId, at: Instant) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                self.order.remove(&(entry.0, *id));
                self.order.insert((at, *id));
                entry.0 = at;
                true
            }
            None => false,
        }
    }

    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.order.iter().next().map(|(at, _)| *at)
    }

    /// Remove the earliest entry if its deadline is at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<T> {
        let (at, id) = *self.order.iter().next()?;
        if at > now {
            return None;
        }
        self.order.remove(&(at, id));
        self.entries.remove(&id).map(|(_, value)| value)
    }

    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.order.clear();
        self.entries.drain().map(|(_, (_, value))| value).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) struct InFlight {
    pub(crate) message: Message,
    pub(crate) client: ClientId,
    pub(crate) delivered_at: Instant,
}

/// Messages out for delivery, ordered by expiry.
pub(crate) struct InFlightTracker {
    queue: DeadlineQueue<InFlight>,
}

impl InFlightTracker {
    pub(crate) fn new() -> Self {
        Self {
            queue: DeadlineQueue::new(),
        }
    }

    pub(crate) fn start(&mut self, entry: InFlight, deadline: Instant) -> Result<()> {
        let id = entry.message.id;
        self.queue
            .insert(id, deadline, entry)
            .map_err(|_| Error::AlreadyInFlight(id))
    }

    /// Remove `id` if `client` owns it, returning its deadline and entry.
    pub(crate) fn remove_owned(&mut self, client: &ClientId, id: &MessageId) -> Result<(Instant, InFlight)> {
        self.check_owner(client, id)?;
        self.queue.remove(id).ok_or(Error::NotInFlight(*id))
    }

    /// Move the deadline of an owned entry; `extend` gets the delivery time
    /// and returns the new deadline.
    pub(crate) fn touch(
        &mut self,
        client: &ClientId,
        id: &MessageId,
        extend: impl FnOnce(Instant) -> Instant,
    ) -> Result<Instant> {
        self.check_owner(client, id)?;
        let delivered_at = match self.queue.get(id) {
            Some((_, entry)) => entry.delivered_at,
            None => return Err(Error::NotInFlight(*id)),
        };
        let deadline = extend(delivered_at);
        self.queue.reschedule(id, deadline);
        Ok(deadline)
    }

    fn check_owner(&self, client: &ClientId, id: &MessageId) -> Result<()> {
        match self.queue.get(id) {
            None => Err(Error::NotInFlight(*id)),
            Some((_, entry)) if &entry.client != client => Err(Error::WrongClient(*id)),
            Some(_) => Ok(()),
        }
    }

    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<InFlight> {
        self.queue.pop_due(now)
    }

    /// Every entry, oldest message first.
    pub(crate) fn drain(&mut self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.queue.drain().into_iter().map(|e| e.message).collect();
        messages.sort_by_key(|m| m.id);
        messages
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Messages waiting for a future delivery time.
pub(crate) struct DeferredTracker {
    queue: DeadlineQueue<Message>,
}

impl DeferredTracker {
    pub(crate) fn new() -> Self {
        Self {
            queue: DeadlineQueue::new(),
        }
    }

    pub(crate) fn defer(&mut self, message: Message, at: Instant) -> Result<()> {
        let id = message.id;
        self.queue
            .insert(id, at, message)
            .map_err(|_| Error::AlreadyInFlight(id))
    }

    pub(crate) fn pop_ready(&mut self, now: Instant) -> Option<Message> {
        self.queue.pop_due(now)
    }

    pub(crate) fn next_ready_at(&self) -> Option<Instant> {
        self.queue.peek_deadline()
    }

    pub(crate) fn drain(&mut self) -> Vec<Message> {
        let mut messages = self.queue.drain();
        messages.sort_by_key(|m| m.id);
        messages
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(id: u64) -> Message {
        Message::new(MessageId::from_u64(id), &b"x"[..])
    }

    fn entry(id: u64, client: &ClientId, at: Instant) -> InFlight {
        InFlight {
            message: msg(id),
            client: client.clone(),
            delivered_at: at,
        }
    }

    #[test]
    fn test_pops_in_deadline_order() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.insert(MessageId::from_u64(1), now + Duration::from_secs(3), "c").unwrap();
        queue.insert(MessageId::from_u64(2), now + Duration::from_secs(1), "a").unwrap();
        queue.insert(MessageId::from_u64(3), now + Duration::from_secs(2), "b").unwrap();
        assert_eq!(queue.insert(MessageId::from_u64(3), now, "dup"), Err("dup"));

        assert_eq!(queue.pop_due(now), None);
        let later = now + Duration::from_secs(5);
        assert_eq!(queue.pop_due(later), Some("a"));
        assert_eq!(queue.pop_due(later), Some("b"));
        assert_eq!(queue.pop_due(later), Some("c"));
        assert_eq!(queue.pop_due(later), None);
    }

    #[test]
    fn test_reschedule_moves_entry() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        let id = MessageId::from_u64(1);
        queue.insert(id, now, ()).unwrap();
        assert!(queue.reschedule(&id, now + Duration::from_secs(10)));
        assert_eq!(queue.pop_due(now + Duration::from_secs(1)), None);
        assert_eq!(queue.peek_deadline(), Some(now + Duration::from_secs(10)));
        assert!(!queue.reschedule(&MessageId::from_u64(2), now));
    }

    #[test]
    fn test_in_flight_ownership() {
        let owner = ClientId::new();
        let other = ClientId::new();
        let now = Instant::now();
        let mut tracker = InFlightTracker::new();
        let id = MessageId::from_u64(9);

        tracker.start(entry(9, &owner, now), now + Duration::from_secs(1)).unwrap();
        assert!(matches!(
            tracker.start(entry(9, &owner, now), now + Duration::from_secs(1)),
            Err(Error::AlreadyInFlight(_))
        ));
        assert!(matches!(tracker.remove_owned(&other, &id), Err(Error::WrongClient(_))));
        assert!(matches!(
            tracker.touch(&other, &id, |t| t),
            Err(Error::WrongClient(_))
        ));

        let (deadline, removed) = tracker.remove_owned(&owner, &id).unwrap();
        assert_eq!(deadline, now + Duration::from_secs(1));
        assert_eq!(removed.message.id, id);
        assert!(matches!(tracker.remove_owned(&owner, &id), Err(Error::NotInFlight(_))));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_touch_extends_from_delivery_time() {
        let client = ClientId::new();
        let now = Instant::now();
        let mut tracker = InFlightTracker::new();
        let id = MessageId::from_u64(1);
        tracker.start(entry(1, &client, now), now + Duration::from_millis(10)).unwrap();

        let deadline = tracker
            .touch(&client, &id, |delivered| delivered + Duration::from_secs(30))
            .unwrap();
        assert_eq!(deadline, now + Duration::from_secs(30));
        assert!(tracker.pop_expired(now + Duration::from_secs(1)).is_none());
        assert!(tracker.pop_expired(now + Duration::from_secs(31)).is_some());
    }

    #[test]
    fn test_drain_returns_oldest_first() {
        let client = ClientId::new();
        let now = Instant::now();
        let mut tracker = InFlightTracker::new();
        for id in [5, 1, 3] {
            tracker.start(entry(id, &client, now), now).unwrap();
        }
        let ids: Vec<u64> = tracker.drain().iter().map(|m| m.id.as_u64()).collect();
        assert_eq!(ids, vec![1, 3, 5]);

        let mut deferred = DeferredTracker::new();
        deferred.defer(msg(2), now + Duration::from_secs(1)).unwrap();
        deferred.defer(msg(1), now + Duration::from_secs(2)).unwrap();
        assert_eq!(deferred.next_ready_at(), Some(now + Duration::from_secs(1)));
        assert!(deferred.pop_ready(now).is_none());
        assert_eq!(deferred.drain().len(), 2);
        assert_eq!(deferred.len(), 0);
    }
}

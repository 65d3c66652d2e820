//! Typed callback lists.
//!
//! An [Event] holds two kinds of subscribers: permanent ones, which stay until they're unsubscribed,
//! and one-shot ones, which are dropped after the next fire. Handlers return whether they handled
//! the event, and [Event::fire] returns true if any of them did.

use parking_lot::Mutex;

pub type SubscriberId = u64;

type Handler<P> = Box<dyn FnMut(&P) -> bool + Send>;

struct Subscribers<P> {
	next_id: SubscriberId,
	permanent: Vec<(SubscriberId, Handler<P>)>,
	once: Vec<(SubscriberId, Handler<P>)>,
	/// Set while the lists are taken out for a fire.
	firing: bool,
	/// Ids unsubscribed while their list was taken out for a fire.
	removed_during_fire: Vec<SubscriberId>,
}

pub struct Event<P> {
	subscribers: Mutex<Subscribers<P>>,
	/// Held for the whole of a fire, so fires from different threads run one after another.
	fire_lock: Mutex<()>,
}

impl<P: 'static> Event<P> {
	pub fn new() -> Self {
		Event {
			subscribers: Mutex::new(Subscribers {
				next_id: 0,
				permanent: Vec::new(),
				once: Vec::new(),
				firing: false,
				removed_during_fire: Vec::new(),
			}),
			fire_lock: Mutex::new(()),
		}
	}

	pub fn subscribe<F>(&self, handler: F) -> SubscriberId
	where
		F: FnMut(&P) -> bool + Send + 'static,
	{
		let mut subscribers = self.subscribers.lock();
		subscribers.next_id += 1;
		let id = subscribers.next_id;
		subscribers.permanent.push((id, Box::new(handler)));
		id
	}

	/// Subscribes a handler that runs on the next fire only.
	pub fn subscribe_once<F>(&self, handler: F) -> SubscriberId
	where
		F: FnOnce(&P) -> bool + Send + 'static,
	{
		let mut handler = Some(handler);
		let mut subscribers = self.subscribers.lock();
		subscribers.next_id += 1;
		let id = subscribers.next_id;
		subscribers.once.push((id, Box::new(move |payload: &P| handler.take().map_or(false, |h| h(payload)))));
		id
	}

	pub fn unsubscribe(&self, id: SubscriberId) {
		let mut subscribers = self.subscribers.lock();
		let before = subscribers.permanent.len() + subscribers.once.len();
		subscribers.permanent.retain(|(sub, _)| *sub != id);
		subscribers.once.retain(|(sub, _)| *sub != id);
		if subscribers.firing && subscribers.permanent.len() + subscribers.once.len() == before {
			subscribers.removed_during_fire.push(id);
		}
	}

	pub fn subscriber_count(&self) -> usize {
		let subscribers = self.subscribers.lock();
		subscribers.permanent.len() + subscribers.once.len()
	}

	/// Calls every permanent subscriber, then every one-shot subscriber, then drops the one-shots.
	///
	/// Handlers may subscribe or unsubscribe on this same event while it fires. New subscribers are
	/// first called on the next fire. A handler that fires the same event deadlocks.
	pub fn fire(&self, payload: &P) -> bool {
		let _firing = self.fire_lock.lock();
		let (mut permanent, once) = {
			let mut subscribers = self.subscribers.lock();
			subscribers.firing = true;
			subscribers.removed_during_fire.clear();
			(
				std::mem::take(&mut subscribers.permanent),
				std::mem::take(&mut subscribers.once),
			)
		};

		let mut handled = false;
		for (_, handler) in permanent.iter_mut() {
			handled |= handler(payload);
		}
		for (_, mut handler) in once {
			handled |= handler(payload);
		}

		let mut subscribers = self.subscribers.lock();
		subscribers.firing = false;
		let removed = std::mem::take(&mut subscribers.removed_during_fire);
		permanent.retain(|(id, _)| !removed.contains(id));
		// Anything subscribed during the fire goes after the existing subscribers.
		permanent.append(&mut subscribers.permanent);
		subscribers.permanent = permanent;
		handled
	}
}

impl<P: 'static> Default for Event<P> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::{mpsc, Arc};
	use std::thread;
	use std::time::Duration;

	use super::*;

	#[test]
	fn fires_permanent_then_once() {
		let event: Event<u32> = Event::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let a = log.clone();
		event.subscribe_once(move |v| {
			a.lock().push(("once", *v));
			true
		});
		let b = log.clone();
		event.subscribe(move |v| {
			b.lock().push(("permanent", *v));
			false
		});

		assert!(event.fire(&1));
		assert!(!event.fire(&2));
		assert_eq!(*log.lock(), vec![("permanent", 1), ("once", 1), ("permanent", 2)]);
		assert_eq!(event.subscriber_count(), 1);
	}

	#[test]
	fn unsubscribe_stops_delivery() {
		let event: Event<()> = Event::new();
		let hits = Arc::new(AtomicUsize::new(0));
		let counter = hits.clone();
		let id = event.subscribe(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
			true
		});
		event.fire(&());
		event.unsubscribe(id);
		assert!(!event.fire(&()));
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn handlers_can_touch_the_event_while_firing() {
		let event: Arc<Event<()>> = Arc::new(Event::new());
		let inner = event.clone();
		let id = Arc::new(Mutex::new(None));
		let own_id = id.clone();
		let subscribed = event.subscribe(move |_| {
			// Unsubscribe ourselves and leave a one-shot behind for the next fire.
			if let Some(id) = *own_id.lock() {
				inner.unsubscribe(id);
			}
			inner.subscribe_once(|_| true);
			false
		});
		*id.lock() = Some(subscribed);

		assert!(!event.fire(&()));
		assert_eq!(event.subscriber_count(), 1);
		assert!(event.fire(&()));
		assert_eq!(event.subscriber_count(), 0);
	}

	#[test]
	fn unknown_ids_are_not_remembered_outside_a_fire() {
		let event: Event<()> = Event::new();
		event.subscribe(|_| true);
		event.unsubscribe(42);
		assert!(event.subscribers.lock().removed_during_fire.is_empty());
		assert!(event.fire(&()));
		assert_eq!(event.subscriber_count(), 1);
	}

	#[test]
	fn concurrent_fires_reach_every_subscriber() {
		let event: Arc<Event<u32>> = Arc::new(Event::new());
		let hits = Arc::new(AtomicUsize::new(0));
		let (entered_tx, entered_rx) = mpsc::channel();
		let (release_tx, release_rx) = mpsc::channel::<()>();
		let counter = hits.clone();
		event.subscribe(move |v| {
			counter.fetch_add(1, Ordering::SeqCst);
			if *v == 1 {
				entered_tx.send(()).unwrap();
				release_rx.recv().unwrap();
			}
			true
		});

		let first = {
			let event = event.clone();
			thread::spawn(move || event.fire(&1))
		};
		entered_rx.recv().unwrap();
		let second = {
			let event = event.clone();
			thread::spawn(move || event.fire(&2))
		};
		// Let the second fire reach the event while the first is still inside its handler.
		thread::sleep(Duration::from_millis(20));
		release_tx.send(()).unwrap();

		assert!(first.join().unwrap());
		assert!(second.join().unwrap());
		assert_eq!(hits.load(Ordering::SeqCst), 2);
		assert_eq!(event.subscriber_count(), 1);
	}
}

//! Ordered listener list with pending/attached slots.
//!
//! A slot registered while its channel is disconnected stays pending and is
//! attached on connect; unsubscribing removes it in either state. Dispatch
//! snapshots the attached callbacks first and re-checks each slot before
//! invoking it, so a handler may unsubscribe itself (or others) mid-dispatch.
//! A [`ListenerSnapshot`] taken at send time is delivered to even if the
//! slots are detached in between; unsubscribed slots are still skipped.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

type Callback<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct Slot<T: ?Sized> {
    id: u64,
    attached: bool,
    callback: Callback<T>,
}

struct ListenerList<T: ?Sized> {
    next_id: u64,
    slots: Vec<Slot<T>>,
}

pub struct Listeners<T: ?Sized> {
    list: Rc<RefCell<ListenerList<T>>>,
}

impl<T: ?Sized> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            list: self.list.clone(),
        }
    }
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            list: Rc::new(RefCell::new(ListenerList {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }
}

impl<T: ?Sized + 'static> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("registered", &self.len())
            .field("attached", &self.attached_len())
            .finish()
    }
}

impl<T: ?Sized + 'static> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: impl FnMut(&T) + 'static, attached: bool) -> Subscription {
        let id = {
            let mut list = self.list.borrow_mut();
            list.next_id += 1;
            let id = list.next_id;
            list.slots.push(Slot {
                id,
                attached,
                callback: Rc::new(RefCell::new(callback)),
            });
            id
        };

        let weak: Weak<RefCell<ListenerList<T>>> = Rc::downgrade(&self.list);
        Subscription::new(move || {
            if let Some(list) = weak.upgrade() {
                list.borrow_mut().slots.retain(|s| s.id != id);
            }
        })
    }

    pub fn attach_all(&self) {
        for slot in self.list.borrow_mut().slots.iter_mut() {
            slot.attached = true;
        }
    }

    pub fn detach_all(&self) {
        for slot in self.list.borrow_mut().slots.iter_mut() {
            slot.attached = false;
        }
    }

    pub fn len(&self) -> usize {
        self.list.borrow().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attached_len(&self) -> usize {
        self.list.borrow().slots.iter().filter(|s| s.attached).count()
    }

    /// Invoke every attached callback, in registration order.
    pub fn dispatch(&self, value: &T) {
        let snapshot = self.snapshot();
        for (id, callback) in snapshot.callbacks {
            if !self.is_live(id, true) {
                continue;
            }
            invoke(id, &callback, value);
        }
    }

    /// Callbacks attached right now, for delivery after a later detach.
    pub fn snapshot(&self) -> ListenerSnapshot<T> {
        let callbacks = self
            .list
            .borrow()
            .slots
            .iter()
            .filter(|s| s.attached)
            .map(|s| (s.id, s.callback.clone()))
            .collect();
        ListenerSnapshot { callbacks }
    }

    /// Invoke the callbacks in `snapshot` that are still registered,
    /// attached or not.
    pub fn deliver(&self, snapshot: ListenerSnapshot<T>, value: &T) {
        for (id, callback) in snapshot.callbacks {
            if !self.is_live(id, false) {
                continue;
            }
            invoke(id, &callback, value);
        }
    }

    fn is_live(&self, id: u64, require_attached: bool) -> bool {
        self.list
            .borrow()
            .slots
            .iter()
            .any(|s| s.id == id && (s.attached || !require_attached))
    }
}

fn invoke<T: ?Sized>(id: u64, callback: &Callback<T>, value: &T) {
    match callback.try_borrow_mut() {
        Ok(mut f) => (&mut *f)(value),
        Err(_) => tracing::warn!(listener = id, "re-entrant dispatch skipped"),
    }
}

/// Attached callbacks captured by [`Listeners::snapshot`].
pub struct ListenerSnapshot<T: ?Sized> {
    callbacks: Vec<(u64, Callback<T>)>,
}

impl<T: ?Sized> fmt::Debug for ListenerSnapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSnapshot")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Handle returned by `on_message`/`subscribe`; call
/// [`Subscription::unsubscribe`] to remove the listener.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;

    #[test]
    fn pending_slots_fire_only_once_attached() {
        let listeners: Listeners<u32> = Listeners::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let _sub = listeners.add(move |v| h.set(h.get() + *v), false);

        listeners.dispatch(&1);
        assert_eq!(hits.get(), 0);

        listeners.attach_all();
        listeners.dispatch(&2);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn unsubscribe_removes_pending_and_attached_slots() {
        let listeners: Listeners<u32> = Listeners::new();
        let pending = listeners.add(|_| {}, false);
        let attached = listeners.add(|_| {}, true);
        assert_eq!(listeners.len(), 2);

        pending.unsubscribe();
        attached.unsubscribe();
        assert!(listeners.is_empty());
    }

    #[test]
    fn handler_can_unsubscribe_a_later_handler_mid_dispatch() {
        let listeners: Listeners<u32> = Listeners::new();
        let later_hits = Rc::new(Cell::new(0));
        let victim: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));

        let v = victim.clone();
        let _first = listeners.add(
            move |_| {
                if let Some(sub) = v.borrow_mut().take() {
                    sub.unsubscribe();
                }
            },
            true,
        );
        let h = later_hits.clone();
        *victim.borrow_mut() = Some(listeners.add(move |_| h.set(h.get() + 1), true));

        listeners.dispatch(&0);
        assert_eq!(later_hits.get(), 0);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn snapshot_outlives_detach_but_not_unsubscribe() {
        let listeners: Listeners<u32> = Listeners::new();
        let kept = Rc::new(Cell::new(0));
        let dropped = Rc::new(Cell::new(0));
        let k = kept.clone();
        let _kept = listeners.add(move |v| k.set(k.get() + *v), true);
        let d = dropped.clone();
        let gone = listeners.add(move |v| d.set(d.get() + *v), true);

        let snapshot = listeners.snapshot();
        listeners.detach_all();
        gone.unsubscribe();
        listeners.deliver(snapshot, &5);

        assert_eq!(kept.get(), 5);
        assert_eq!(dropped.get(), 0);
        listeners.dispatch(&1);
        assert_eq!(kept.get(), 5);
    }

    #[test]
    fn debug_reports_registered_and_attached_counts() {
        let listeners: Listeners<str> = Listeners::new();
        let _a = listeners.add(|_| {}, true);
        let _b = listeners.add(|_| {}, false);
        assert_eq!(
            format!("{:?}", listeners),
            "Listeners { registered: 2, attached: 1 }"
        );
    }
}

use std::{cell::RefCell, rc::Rc};

use futures::channel::oneshot;

/// One-shot meeting point for racing signals.
///
/// Whoever reaches [`signal`](Self::signal) or [`cancel`](Self::cancel) first
/// takes the only sender; every later attempt finds the slot empty. The waiter
/// holds the receiver and sees either the value or a cancellation.
pub(crate) struct Rendezvous<T> {
    slot: RefCell<Option<oneshot::Sender<T>>>,
}

impl<T> Rendezvous<T> {
    pub(crate) fn new() -> (Rc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Rc::new(Self {
                slot: RefCell::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Deliver `value`, handing it back if the slot was already spent or the
    /// waiter is gone.
    pub(crate) fn signal(&self, value: T) -> Result<(), T> {
        let Some(tx) = self.slot.borrow_mut().take() else {
            return Err(value);
        };
        tx.send(value)
    }

    /// Spend the slot without a value. Returns whether this call spent it.
    pub(crate) fn cancel(&self) -> bool {
        self.slot.borrow_mut().take().is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_spent(&self) -> bool {
        self.slot.borrow().is_none()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    #[test]
    fn second_signal_is_refused() {
        let (rendezvous, mut rx) = Rendezvous::new();
        assert!(rendezvous.signal(1).is_ok());
        assert_eq!(rendezvous.signal(2), Err(2));
        assert!(!rendezvous.cancel());
        assert_eq!(rx.try_recv().unwrap(), Some(1));
    }

    #[test]
    fn cancel_wakes_waiter_with_nothing() {
        let (rendezvous, rx) = Rendezvous::<u8>::new();
        assert!(rendezvous.cancel());
        assert!(rendezvous.is_spent());
        assert_eq!(rendezvous.signal(7), Err(7));
        assert!(rx.now_or_never().unwrap().is_err());
    }

    #[test]
    fn signal_after_waiter_left_returns_value() {
        let (rendezvous, rx) = Rendezvous::new();
        drop(rx);
        assert_eq!(rendezvous.signal("late"), Err("late"));
        assert!(rendezvous.is_spent());
    }

    #[test]
    fn racing_sides_spend_once() {
        for hook_first in [true, false] {
            let (rendezvous, rx) = Rendezvous::new();
            let hook = rendezvous.clone();
            let timer = rendezvous.clone();
            let (hooked, cancelled) = if hook_first {
                let hooked = hook.signal(()).is_ok();
                (hooked, timer.cancel())
            } else {
                let cancelled = timer.cancel();
                (hook.signal(()).is_ok(), cancelled)
            };
            assert!(hooked ^ cancelled);
            assert_eq!(rx.now_or_never().unwrap().is_ok(), hooked);
        }
    }
}

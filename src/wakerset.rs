use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

/// Identifies one placeholder's entry in a [`WakerSet`]. Not `Clone`, so
/// that each id stays tied to the single placeholder that registered it.
#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct WaiterId(NonZeroUsize);

impl WaiterId {
    fn duplicate(&self) -> WaiterId {
        WaiterId(self.0)
    }
}

/// The wakers of every placeholder waiting on one batch.
///
/// Only one task needs to drive a batch (poll its window and then its fetch),
/// but every task needs to hear about the result. The set therefore tracks a
/// "driving waker": whichever waker most recently registered, on the
/// assumption that it is about to poll the shared work. If the driver goes
/// away before the batch completes, another waker is picked and woken so the
/// batch always has a path forward.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<WaiterId, Waker>,
    driving_waker: Option<WaiterId>,

    // Batches are short lived, so a plain counter never realistically
    // overflows.
    next_id: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            driving_waker: None,
            next_id: NonZeroUsize::MIN,
        }
    }
}

impl WakerSet {
    /// Insert or refresh the waker for the placeholder owning `slot`, and
    /// make it the driving waker. A fresh id is written into `slot` on first
    /// registration.
    pub(crate) fn register(&mut self, slot: &mut Option<WaiterId>, waker: &Waker) {
        let id = match slot {
            Some(id) => {
                match self.wakers.get_mut(id) {
                    Some(existing) if existing.will_wake(waker) => {}
                    Some(existing) => existing.clone_from(waker),
                    None => {
                        self.wakers.insert(id.duplicate(), waker.clone());
                    }
                }
                id.duplicate()
            }
            None => {
                let id = WaiterId(self.next_id);
                self.next_id = self
                    .next_id
                    .checked_add(1)
                    .expect("Overflow when creating waiter id");
                self.wakers.insert(id.duplicate(), waker.clone());
                *slot = Some(id.duplicate());
                id
            }
        };

        self.driving_waker = Some(id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }

    /// Remove a waker whose placeholder is giving up early. If it was the
    /// driver (or there is no driver), another waker is promoted and woken.
    pub(crate) fn discard_and_wake(&mut self, id: WaiterId) {
        self.wakers.remove(&id);
        if self.driving_waker.as_ref() == Some(&id) || self.driving_waker.is_none() {
            match self.wakers.iter().next() {
                None => self.driving_waker = None,
                Some((next, waker)) => {
                    self.driving_waker = Some(next.duplicate());
                    waker.wake_by_ref();
                }
            }
        }
    }

    /// Wake the driving waker (or any waker, if there is no driver) so that
    /// the shared batch makes progress.
    pub(crate) fn wake_driver(&self) {
        let driver = self
            .driving_waker
            .as_ref()
            .and_then(|id| self.wakers.get(id))
            .or_else(|| self.wakers.values().next());

        if let Some(waker) = driver {
            waker.wake_by_ref();
        }
    }

    /// Wake every registered waker except `skip`, which belongs to the
    /// placeholder that is about to take its result in the current poll.
    pub(crate) fn wake_all_except(self, skip: Option<&WaiterId>) {
        self.wakers
            .into_iter()
            .filter(|(id, _waker)| Some(id) != skip)
            .for_each(|(_id, waker)| waker.wake());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cooked_waker::{IntoWaker, Wake, WakeRef};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Debug, Clone, Default, IntoWaker)]
    struct CountingWaker {
        count: Arc<AtomicUsize>,
    }

    impl WakeRef for CountingWaker {
        fn wake_by_ref(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Wake for CountingWaker {}

    impl CountingWaker {
        fn wakes(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_register_reuses_slot() {
        let mut set = WakerSet::default();
        let signal = CountingWaker::default();
        let waker = signal.clone().into_waker();

        let mut slot = None;
        set.register(&mut slot, &waker);
        let first = slot.as_ref().map(|id| id.duplicate());
        set.register(&mut slot, &waker);

        assert_eq!(slot, first);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_dropping_driver_wakes_exactly_one() {
        let mut set = WakerSet::default();
        let signals: Vec<CountingWaker> = (0..3).map(|_| CountingWaker::default()).collect();
        let mut slots: Vec<Option<WaiterId>> = (0..3).map(|_| None).collect();

        for (signal, slot) in signals.iter().zip(slots.iter_mut()) {
            set.register(slot, &signal.clone().into_waker());
        }

        // The last registration is the driver.
        let driver = slots[2].take().unwrap();
        set.discard_and_wake(driver);

        let woken: usize = signals[..2].iter().map(|signal| signal.wakes()).sum();
        assert_eq!(woken, 1);
        assert_eq!(signals[2].wakes(), 0);
    }

    #[test]
    fn test_dropping_passenger_wakes_nobody() {
        let mut set = WakerSet::default();
        let first = CountingWaker::default();
        let second = CountingWaker::default();
        let mut first_slot = None;
        let mut second_slot = None;

        set.register(&mut first_slot, &first.clone().into_waker());
        set.register(&mut second_slot, &second.clone().into_waker());

        set.discard_and_wake(first_slot.take().unwrap());

        assert_eq!(first.wakes(), 0);
        assert_eq!(second.wakes(), 0);
    }

    #[test]
    fn test_wake_all_except_skips_finisher() {
        let mut set = WakerSet::default();
        let finisher = CountingWaker::default();
        let other = CountingWaker::default();
        let mut finisher_slot = None;
        let mut other_slot = None;

        set.register(&mut other_slot, &other.clone().into_waker());
        set.register(&mut finisher_slot, &finisher.clone().into_waker());

        set.wake_all_except(finisher_slot.as_ref());

        assert_eq!(finisher.wakes(), 0);
        assert_eq!(other.wakes(), 1);
    }
}

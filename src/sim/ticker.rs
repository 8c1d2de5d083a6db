//! Per-frame observers and the lap-target completion
//!
//! Observers run once per frame after lap detection, in subscription order.
//! Returning `TickerStatus::Done` unsubscribes them. `LapTarget` is the
//! observer behind `play_for_laps`; its `LapsCompletion` is a single-threaded
//! future resolved from inside a later frame.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use super::lap::BoundaryWrap;
use crate::consts::{LAP_THROTTLE_MS, WRAP_GUARD_MS};

/// Read-only view of the frame just simulated
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub now_ms: f64,
    pub dt: f64,
    pub total_length: f64,
    /// User position along the primary path
    pub user_traveled: f64,
    /// User position at the start boundary
    pub start_traveled: f64,
    pub user_absolute: f64,
    pub lap_counter: u32,
    /// Lap events fired during this frame
    pub laps_this_frame: u32,
    pub gate_halted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerStatus {
    Continue,
    Done,
    /// Hold the user, then settle
    HaltThenDone,
}

/// Something that wants to see every frame
pub trait TickObserver {
    fn on_tick(&mut self, frame: &FrameInfo) -> TickerStatus;

    /// Called after `Done`/`HaltThenDone` has been acted on
    fn settle(&mut self, _frame: &FrameInfo) {}

    /// The engine resumed playing
    fn on_play(&mut self) {}

    /// The observer is being dropped without finishing
    fn cancel(&mut self) {}
}

/// Handle for removing an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// An observer that returned a non-`Continue` status this frame
pub struct Finished {
    pub id: SubscriptionId,
    pub status: TickerStatus,
    pub observer: Box<dyn TickObserver>,
}

/// Ordered collection of observers
#[derive(Default)]
pub struct Tickers {
    entries: Vec<(SubscriptionId, Box<dyn TickObserver>)>,
    next_id: u64,
}

impl std::fmt::Debug for Tickers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tickers")
            .field("count", &self.entries.len())
            .finish()
    }
}

impl Tickers {
    pub fn subscribe(&mut self, observer: Box<dyn TickObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    /// Remove and cancel an observer; false if it was already gone
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.entries.iter().position(|(sid, _)| *sid == id) {
            Some(i) => {
                let (_, mut observer) = self.entries.remove(i);
                observer.cancel();
                true
            }
            None => false,
        }
    }

    /// Run every observer; finished ones are removed and returned in order
    /// so the engine can act on them before they settle
    pub fn run(&mut self, frame: &FrameInfo) -> Vec<Finished> {
        let mut finished = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for (id, mut observer) in self.entries.drain(..) {
            match observer.on_tick(frame) {
                TickerStatus::Continue => kept.push((id, observer)),
                status => finished.push(Finished {
                    id,
                    status,
                    observer,
                }),
            }
        }
        self.entries = kept;
        finished
    }

    pub fn notify_play(&mut self) {
        for (_, observer) in &mut self.entries {
            observer.on_play();
        }
    }

    /// Cancel and drop everything
    pub fn clear(&mut self) {
        for (_, mut observer) in self.entries.drain(..) {
            observer.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a lap request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapsOutcome {
    /// `laps` were counted; `halted` if the user was held at the finish
    Completed { laps: u32, halted: bool },
    Cancelled,
}

#[derive(Default)]
struct Shared {
    outcome: Option<LapsOutcome>,
    waker: Option<Waker>,
}

/// Future returned by `play_for_laps`
#[derive(Clone)]
pub struct LapsCompletion {
    shared: Rc<RefCell<Shared>>,
}

impl LapsCompletion {
    /// Completion that is already resolved
    pub fn ready(outcome: LapsOutcome) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                outcome: Some(outcome),
                waker: None,
            })),
        }
    }

    /// Outcome without awaiting, if already resolved
    pub fn try_outcome(&self) -> Option<LapsOutcome> {
        self.shared.borrow().outcome
    }

    pub fn is_resolved(&self) -> bool {
        self.try_outcome().is_some()
    }
}

impl Future for LapsCompletion {
    type Output = LapsOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        match shared.outcome {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

fn resolve(shared: &Rc<RefCell<Shared>>, outcome: LapsOutcome) {
    let waker = {
        let mut s = shared.borrow_mut();
        if s.outcome.is_some() {
            return;
        }
        s.outcome = Some(outcome);
        s.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// Counts user laps toward a target
pub struct LapTarget {
    target: u32,
    counted: u32,
    halt_at_finish: bool,
    /// User absolute distance when the request was made
    start_absolute: f64,
    wrap: BoundaryWrap,
    guard_until_ms: Option<f64>,
    last_count_ms: Option<f64>,
    shared: Rc<RefCell<Shared>>,
}

impl LapTarget {
    pub fn new(target: u32, halt_at_finish: bool, start_absolute: f64) -> (Self, LapsCompletion) {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let observer = Self {
            target,
            counted: 0,
            halt_at_finish,
            start_absolute,
            wrap: BoundaryWrap::default(),
            guard_until_ms: None,
            last_count_ms: None,
            shared: shared.clone(),
        };
        (observer, LapsCompletion { shared })
    }

    pub fn counted(&self) -> u32 {
        self.counted
    }
}

impl TickObserver for LapTarget {
    fn on_tick(&mut self, frame: &FrameInfo) -> TickerStatus {
        let guard_until = *self
            .guard_until_ms
            .get_or_insert(frame.now_ms + WRAP_GUARD_MS);

        let wrapped = self
            .wrap
            .update(frame.user_traveled, frame.start_traveled, frame.total_length);
        let signal = (wrapped || frame.laps_this_frame > 0) && frame.now_ms >= guard_until;

        // A proximity event and a wrap for the same crossing count once
        if signal
            && !self
                .last_count_ms
                .is_some_and(|last| frame.now_ms - last < LAP_THROTTLE_MS)
        {
            self.counted += 1;
            self.last_count_ms = Some(frame.now_ms);
            log::debug!("Lap target {}/{}", self.counted, self.target);
        }

        // Distance fallback in case a geometric signal was missed
        let driven = frame.user_absolute - self.start_absolute;
        let by_distance = frame.total_length > 0.0
            && driven >= self.target as f64 * frame.total_length - 1e-9;

        if self.counted >= self.target || by_distance {
            if by_distance && self.counted < self.target {
                log::debug!("Lap target reached by distance ({:.1} px)", driven);
                self.counted = self.target;
            }
            if self.halt_at_finish {
                TickerStatus::HaltThenDone
            } else {
                TickerStatus::Done
            }
        } else {
            TickerStatus::Continue
        }
    }

    fn settle(&mut self, frame: &FrameInfo) {
        log::debug!(
            "Lap target of {} settled at lap {}",
            self.target,
            frame.lap_counter
        );
        resolve(
            &self.shared,
            LapsOutcome::Completed {
                laps: self.counted,
                halted: self.halt_at_finish,
            },
        );
    }

    fn on_play(&mut self) {
        self.guard_until_ms = None;
    }

    fn cancel(&mut self) {
        resolve(&self.shared, LapsOutcome::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(now_ms: f64, traveled: f64, absolute: f64, laps: u32) -> FrameInfo {
        FrameInfo {
            now_ms,
            dt: 0.1,
            total_length: 1000.0,
            user_traveled: traveled,
            start_traveled: 0.0,
            user_absolute: absolute,
            lap_counter: 0,
            laps_this_frame: laps,
            gate_halted: false,
        }
    }

    #[test]
    fn test_wrap_during_guard_is_ignored() {
        let (mut t, _done) = LapTarget::new(1, false, 0.0);
        assert_eq!(t.on_tick(&frame(0.0, 0.0, 0.0, 0)), TickerStatus::Continue);
        // Leaving the start wraps the shifted position immediately
        assert_eq!(t.on_tick(&frame(16.0, 998.0, 2.0, 0)), TickerStatus::Continue);
        assert_eq!(t.counted(), 0);
    }

    #[test]
    fn test_pulling_away_from_start_after_guard_is_not_a_lap() {
        let (mut t, done) = LapTarget::new(2, true, 0.0);
        // Held on the line well past the guard, then released
        t.on_tick(&frame(0.0, 0.0, 0.0, 0));
        t.on_tick(&frame(2000.0, 0.0, 0.0, 0));
        assert_eq!(t.on_tick(&frame(2125.0, 987.5, 12.5, 0)), TickerStatus::Continue);
        assert_eq!(t.counted(), 0);
        assert!(!done.is_resolved());
    }

    #[test]
    fn test_wrap_and_lap_event_count_once() {
        let (mut t, done) = LapTarget::new(2, false, 0.0);
        t.on_tick(&frame(0.0, 0.0, 0.0, 0));
        t.on_tick(&frame(16.0, 998.0, 2.0, 0));
        t.on_tick(&frame(600.0, 500.0, 500.0, 0));
        // Proximity event a frame before the wrap
        t.on_tick(&frame(1000.0, 0.2, 999.8, 1));
        t.on_tick(&frame(1016.0, 998.0, 1002.0, 0));
        assert_eq!(t.counted(), 1);
        assert!(!done.is_resolved());
    }

    #[test]
    fn test_completes_and_resolves() {
        let (mut t, mut done) = LapTarget::new(1, false, 0.0);
        t.on_tick(&frame(0.0, 0.0, 0.0, 0));
        t.on_tick(&frame(16.0, 998.0, 2.0, 0));
        t.on_tick(&frame(600.0, 400.0, 600.0, 0));
        let last = frame(1000.0, 999.0, 1001.0, 0);
        assert_eq!(t.on_tick(&last), TickerStatus::Done);
        t.settle(&last);

        let mut cx = Context::from_waker(Waker::noop());
        assert_eq!(
            Pin::new(&mut done).poll(&mut cx),
            Poll::Ready(LapsOutcome::Completed {
                laps: 1,
                halted: false
            })
        );
    }

    #[test]
    fn test_distance_fallback() {
        let (mut t, _done) = LapTarget::new(2, true, 100.0);
        t.on_tick(&frame(0.0, 0.0, 100.0, 0));
        // No geometric signal, but two laps of distance driven
        let status = t.on_tick(&frame(20_000.0, 500.0, 2100.0, 0));
        assert_eq!(status, TickerStatus::HaltThenDone);
        assert_eq!(t.counted(), 2);
    }

    #[test]
    fn test_cancel_resolves_cancelled() {
        let mut tickers = Tickers::default();
        let (t, done) = LapTarget::new(3, false, 0.0);
        let id = tickers.subscribe(Box::new(t));
        assert_eq!(tickers.len(), 1);
        assert!(tickers.unsubscribe(id));
        assert!(!tickers.unsubscribe(id));
        assert_eq!(done.try_outcome(), Some(LapsOutcome::Cancelled));
    }

    #[test]
    fn test_tickers_run_in_order_and_drop_finished() {
        struct Countdown(u32);
        impl TickObserver for Countdown {
            fn on_tick(&mut self, _: &FrameInfo) -> TickerStatus {
                self.0 -= 1;
                if self.0 == 0 {
                    TickerStatus::Done
                } else {
                    TickerStatus::Continue
                }
            }
        }

        let mut tickers = Tickers::default();
        tickers.subscribe(Box::new(Countdown(1)));
        tickers.subscribe(Box::new(Countdown(2)));
        let f = frame(0.0, 0.0, 0.0, 0);
        assert_eq!(tickers.run(&f).len(), 1);
        assert_eq!(tickers.len(), 1);
        assert_eq!(tickers.run(&f).len(), 1);
        assert!(tickers.is_empty());
    }
}

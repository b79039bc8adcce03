// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A cancellable, first-come-first-served gate around a single value.

The gate grants at most one holder at a time.  Waiters queue in FIFO order.  Releasing with
waiters queued hands the gate straight to the front waiter, so the gate is never observably free
while someone is waiting, and nobody can barge in ahead of the queue.

# Cancellation

[AsyncGate::acquire] takes a [CancellationToken].  If the token fires before the grant, the waiter
leaves the queue and the acquisition fails with [Cancelled].  A grant that raced the cancellation,
or that was handed to a future which was then dropped, is passed on to the next waiter.  Grants
are never lost.

# Release

Release is scoped: [GateGuard] releases when dropped, whether the body finished, failed or was
cancelled.  There is no way to release twice.

```
use texture_streaming::CancellationToken;
use texture_streaming::gate::AsyncGate;

let gate = AsyncGate::new(0u32);
let token = CancellationToken::new();
test_executors::sleep_on(async {
    let mut guard = gate.acquire(&token).await.unwrap();
    *guard += 1;
});
assert_eq!(gate.into_inner(), 1);
```
*/

use crate::error::Cancelled;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    waker: Waker,
}

#[derive(Debug, Default)]
struct State {
    held: bool,
    next_ticket: u64,
    waiters: VecDeque<Waiter>,
    //ticket that has been granted the gate but has not observed it yet
    handoff: Option<u64>,
}

impl State {
    /// Releases the current hold.  Returns the waker of the new holder, to be woken after unlocking.
    fn release(&mut self) -> Option<Waker> {
        assert!(self.held, "released a gate that was not held");
        debug_assert!(self.handoff.is_none());
        match self.waiters.pop_front() {
            Some(next) => {
                self.handoff = Some(next.ticket);
                Some(next.waker)
            }
            None => {
                self.held = false;
                None
            }
        }
    }

    /// Takes `ticket` out of contention, passing on a grant it may already have received.
    fn withdraw(&mut self, ticket: u64) -> Option<Waker> {
        if self.handoff == Some(ticket) {
            self.handoff = None;
            self.release()
        } else {
            self.waiters.retain(|w| w.ticket != ticket);
            None
        }
    }
}

/// Mutual exclusion with cancellable FIFO waits.  See the [module documentation](self).
pub struct AsyncGate<T> {
    state: Mutex<State>,
    value: UnsafeCell<T>,
}

//the value is only reachable through a GateGuard, and the state machine guarantees one guard at a time
unsafe impl<T: Send> Send for AsyncGate<T> {}
unsafe impl<T: Send> Sync for AsyncGate<T> {}

impl<T> AsyncGate<T> {
    pub fn new(value: T) -> Self {
        AsyncGate {
            state: Mutex::new(State::default()),
            value: UnsafeCell::new(value),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        //the state is consistent at every unlock, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /**
    Waits for exclusive access.

    Fails with [Cancelled] if `token` is cancelled before access is granted.  Once granted, the
    guard is returned even if the token fires afterwards; check the token again if that matters.
    */
    pub fn acquire(&self, token: &CancellationToken) -> Acquire<'_, T> {
        Acquire {
            gate: self,
            token: token.clone(),
            cancelled: Box::pin(token.clone().cancelled_owned()),
            ticket: None,
            finished: false,
        }
    }

    /// Takes the gate if nobody holds it and nobody is waiting.
    pub fn try_acquire(&self) -> Option<GateGuard<'_, T>> {
        let mut state = self.lock_state();
        if state.held {
            None
        } else {
            state.held = true;
            Some(GateGuard { gate: self })
        }
    }

    /// Number of queued waiters.
    pub fn waiting(&self) -> usize {
        self.lock_state().waiters.len()
    }

    pub fn is_held(&self) -> bool {
        self.lock_state().held
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    fn release(&self) {
        let wake = self.lock_state().release();
        if let Some(waker) = wake {
            waker.wake();
        }
    }
}

impl<T> Debug for AsyncGate<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("AsyncGate")
            .field("held", &state.held)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// Exclusive access to the gate's value.  Releases the gate on drop.
pub struct GateGuard<'a, T> {
    gate: &'a AsyncGate<T>,
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        //safe: we hold the gate
        unsafe { &*self.gate.value.get() }
    }
}

impl<T> DerefMut for GateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        //safe: we hold the gate, and &mut self prevents aliasing through this guard
        unsafe { &mut *self.gate.value.get() }
    }
}

impl<T> Drop for GateGuard<'_, T> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl<T: Debug> Debug for GateGuard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateGuard").field("value", &**self).finish()
    }
}

/// Future returned by [AsyncGate::acquire].
///
/// Dropping it before completion withdraws from the queue.
#[must_use = "futures do nothing unless awaited"]
pub struct Acquire<'a, T> {
    gate: &'a AsyncGate<T>,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    ticket: Option<u64>,
    finished: bool,
}

impl<'a, T> Future for Acquire<'a, T> {
    type Output = Result<GateGuard<'a, T>, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.finished, "Acquire polled after completion");
        loop {
            let mut state = this.gate.lock_state();
            match this.ticket {
                Some(ticket) if state.handoff == Some(ticket) => {
                    state.handoff = None;
                    this.ticket = None;
                    this.finished = true;
                    return Poll::Ready(Ok(GateGuard { gate: this.gate }));
                }
                None if !state.held && !this.token.is_cancelled() => {
                    state.held = true;
                    this.finished = true;
                    return Poll::Ready(Ok(GateGuard { gate: this.gate }));
                }
                _ => {}
            }

            if this.token.is_cancelled() {
                let wake = this.ticket.take().and_then(|t| state.withdraw(t));
                drop(state);
                if let Some(waker) = wake {
                    waker.wake();
                }
                this.finished = true;
                logwise::trace_sync!("gate acquisition cancelled before grant");
                return Poll::Ready(Err(Cancelled));
            }

            match this.ticket {
                Some(ticket) => {
                    if let Some(w) = state.waiters.iter_mut().find(|w| w.ticket == ticket) {
                        if !w.waker.will_wake(cx.waker()) {
                            w.waker = cx.waker().clone();
                        }
                    }
                }
                None => {
                    let ticket = state.next_ticket;
                    state.next_ticket += 1;
                    state.waiters.push_back(Waiter {
                        ticket,
                        waker: cx.waker().clone(),
                    });
                    this.ticket = Some(ticket);
                }
            }
            drop(state);

            //registers our waker with the token
            if this.cancelled.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            //cancelled while we were registering; go around to withdraw
        }
    }
}

impl<T> Drop for Acquire<'_, T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(ticket) = self.ticket.take() {
            let wake = self.gate.lock_state().withdraw(ticket);
            if let Some(waker) = wake {
                waker.wake();
            }
        }
    }
}

impl<T> Debug for Acquire<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquire")
            .field("ticket", &self.ticket)
            .field("finished", &self.finished)
            .finish()
    }
}

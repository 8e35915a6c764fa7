use super::Error;
use futures::channel::oneshot;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

/// A one-shot cancellation token.
///
/// Once set, it stays set.
#[derive(Debug, Default)]
pub struct Interrupt(AtomicBool);

impl Interrupt {
    /// Returns true if the token was never set.
    pub fn not_interrupted(&self) -> bool {
        !self.0.load(Ordering::Acquire)
    }

    /// Fail with [Error::Interrupted] if the token was set.
    pub fn check(&self) -> Result<(), Error> {
        if self.not_interrupted() {
            Ok(())
        } else {
            Err(Error::Interrupted)
        }
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct State {
    paused: usize,
    active: usize,

    /// Compactors waiting for the gate to open.
    entering: Vec<oneshot::Sender<()>>,

    /// Pausers waiting for active compactors to leave.
    pausing: Vec<oneshot::Sender<()>>,
}

fn wake(waiters: &mut Vec<oneshot::Sender<()>>) {
    for waiter in waiters.drain(..) {
        let _ = waiter.send(());
    }
}

/// Lets snapshots exclude compactors from the part of their work that rewrites index entries
/// and removes files.
#[derive(Default)]
pub struct Gate {
    state: Mutex<State>,
}

/// Held by a compactor while it is inside the [Gate].
pub struct Guard<'a> {
    gate: &'a Gate,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        state.active -= 1;
        if state.active == 0 {
            wake(&mut state.pausing);
        }
    }
}

impl Gate {
    /// Close the gate, waiting for every compactor inside to leave.
    ///
    /// Pauses nest: the gate only reopens once every pause is matched by [Gate::resume].
    pub async fn pause(&self) {
        let mut registered = false;
        loop {
            let receiver = {
                let mut state = self.state.lock().unwrap();
                if !registered {
                    state.paused += 1;
                    registered = true;
                }
                if state.active == 0 {
                    return;
                }
                let (sender, receiver) = oneshot::channel();
                state.pausing.push(sender);
                receiver
            };
            let _ = receiver.await;
        }
    }

    /// Reopen the gate (if no other pause is outstanding).
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused = state.paused.saturating_sub(1);
        if state.paused == 0 {
            wake(&mut state.entering);
        }
    }

    /// Returns true if the gate is closed.
    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused > 0
    }

    /// Enter the gate, waiting while it is closed.
    ///
    /// Fails with [Error::Interrupted] as soon as `interrupt` is set, even while waiting.
    pub async fn enter(&self, interrupt: &Interrupt) -> Result<Guard<'_>, Error> {
        loop {
            let receiver = {
                let mut state = self.state.lock().unwrap();
                interrupt.check()?;
                if state.paused == 0 {
                    state.active += 1;
                    return Ok(Guard { gate: self });
                }
                let (sender, receiver) = oneshot::channel();
                state.entering.push(sender);
                receiver
            };
            let _ = receiver.await;
        }
    }

    /// Set `interrupt` and wake every compactor waiting to enter.
    ///
    /// The flag is set before the lock is taken and checked under it, so a waiter either
    /// observes it or is registered in time to be woken.
    pub fn interrupt(&self, interrupt: &Interrupt) {
        interrupt.set();
        let mut state = self.state.lock().unwrap();
        wake(&mut state.entering);
    }
}

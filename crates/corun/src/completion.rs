// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot completion signal crossing from the scheduler thread to a
//! blocked caller.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Done,
    /// The signalling task was dropped before it finished (shutdown).
    Abandoned,
}

pub(crate) struct Completion {
    outcome: Mutex<Option<Outcome>>,
    cvar: Condvar,
}

impl Completion {
    /// A completion plus the signal half that the scheduler-side task owns.
    pub fn pair() -> (Arc<Completion>, Signal) {
        let completion = Arc::new(Completion {
            outcome: Mutex::new(None),
            cvar: Condvar::new(),
        });
        let signal = Signal(Some(completion.clone()));
        (completion, signal)
    }

    fn set(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.cvar.notify_all();
        }
    }

    /// Block the calling OS thread until the signal fires or is dropped.
    pub fn wait(&self) -> Outcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            self.cvar.wait(&mut slot);
        }
    }
}

/// Fires `Done` via [`Signal::complete`], or `Abandoned` when dropped.
pub(crate) struct Signal(Option<Arc<Completion>>);

impl Signal {
    pub fn complete(mut self) {
        if let Some(completion) = self.0.take() {
            completion.set(Outcome::Done);
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        if let Some(completion) = self.0.take() {
            completion.set(Outcome::Abandoned);
        }
    }
}

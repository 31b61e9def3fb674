// Library for event-driven network services built around channel pipelines.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Write-once result containers with listeners dispatched on a reactor.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::reactor::Reactor;
use crate::Error;

type ListenerFn<T> = Box<dyn FnOnce(&Future<T>) + Send>;

enum Inner<T> {
    Pending(Vec<ListenerFn<T>>),
    Success(T),
    Failure(Error),
    Cancelled,
}

struct Shared<T> {
    state: Mutex<Inner<T>>,
    done: Condvar,
    executor: Option<Reactor>,
    cancellable: bool,
}

/// Writable side of a write-once result container.
///
/// The state transitions from incomplete to success, failure or cancelled
/// exactly once; all later completion attempts are no-ops reported by the
/// `try_*` methods, while the `set_*` methods treat them as a caller bug.
pub struct Promise<T = ()>(Arc<Shared<T>>);

/// Readable side of a [`Promise`].
///
/// Listeners attached with [`Future::on_complete`] run on the executor the
/// promise was created with, in the order they were attached; when the promise
/// has no executor they run on the completing (or, once complete, attaching)
/// thread.
pub struct Future<T = ()>(Arc<Shared<T>>);

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self { Promise(self.0.clone()) }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self { Future(self.0.clone()) }
}

impl<T: Send + 'static> Promise<T> {
    /// Creates an incomplete promise whose listeners will run on `executor`.
    pub fn new(executor: Option<Reactor>) -> Self {
        Promise(Arc::new(Shared {
            state: Mutex::new(Inner::Pending(vec![])),
            done: Condvar::new(),
            executor,
            cancellable: false,
        }))
    }

    /// Creates an incomplete promise which additionally advertises
    /// cancellation support (see [`Future::cancel`]).
    pub fn cancellable(executor: Option<Reactor>) -> Self {
        Promise(Arc::new(Shared {
            state: Mutex::new(Inner::Pending(vec![])),
            done: Condvar::new(),
            executor,
            cancellable: true,
        }))
    }

    pub fn future(&self) -> Future<T> { Future(self.0.clone()) }

    /// Completes the promise successfully; returns `false` if it was already
    /// complete.
    pub fn try_success(&self, value: T) -> bool { complete(&self.0, Inner::Success(value)) }

    /// Completes the promise with a failure; returns `false` if it was
    /// already complete.
    pub fn try_failure(&self, err: Error) -> bool { complete(&self.0, Inner::Failure(err)) }

    /// Completes the promise successfully.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already complete; use [`Promise::try_success`]
    /// when racing completions are legal.
    pub fn set_success(&self, value: T) {
        if !self.try_success(value) {
            panic!("promise completed more than once");
        }
    }

    /// Completes the promise with a failure.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already complete; use [`Promise::try_failure`]
    /// when racing completions are legal.
    pub fn set_failure(&self, err: Error) {
        if !self.try_failure(err) {
            panic!("promise completed more than once");
        }
    }

    pub fn is_complete(&self) -> bool { self.future().is_complete() }
}

fn complete<T: Send + 'static>(shared: &Arc<Shared<T>>, outcome: Inner<T>) -> bool {
    let listeners = {
        let mut state = shared.state.lock().expect("promise mutex poisoned");
        match &mut *state {
            Inner::Pending(listeners) => {
                let listeners = std::mem::take(listeners);
                *state = outcome;
                listeners
            }
            _ => return false,
        }
    };
    shared.done.notify_all();
    dispatch(shared, listeners);
    true
}

fn dispatch<T: Send + 'static>(shared: &Arc<Shared<T>>, listeners: Vec<ListenerFn<T>>) {
    if listeners.is_empty() {
        return;
    }
    let future = Future(shared.clone());
    match &shared.executor {
        Some(reactor) => reactor.submit(move || {
            for listener in listeners {
                listener(&future);
            }
        }),
        None => {
            for listener in listeners {
                listener(&future);
            }
        }
    }
}

impl<T: Send + 'static> Future<T> {
    /// Attaches a completion listener.
    ///
    /// If the future is already complete the listener is scheduled
    /// immediately on the associated executor.
    pub fn on_complete(&self, listener: impl FnOnce(&Future<T>) + Send + 'static) {
        let mut state = self.0.state.lock().expect("promise mutex poisoned");
        if let Inner::Pending(listeners) = &mut *state {
            listeners.push(Box::new(listener));
            return;
        }
        drop(state);
        dispatch(&self.0, vec![Box::new(listener)]);
    }

    /// Requests cancellation. Succeeds only when the promise advertised
    /// cancellation support and is not yet complete.
    pub fn cancel(&self) -> bool {
        if !self.0.cancellable {
            return false;
        }
        complete(&self.0, Inner::Cancelled)
    }

    pub fn is_complete(&self) -> bool {
        !matches!(*self.0.state.lock().expect("promise mutex poisoned"), Inner::Pending(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(*self.0.state.lock().expect("promise mutex poisoned"), Inner::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.0.state.lock().expect("promise mutex poisoned"), Inner::Cancelled)
    }

    /// Returns the failure the future completed with, if any (cancellation
    /// reads as [`Error::Cancelled`]).
    pub fn cause(&self) -> Option<Error> {
        match &*self.0.state.lock().expect("promise mutex poisoned") {
            Inner::Failure(err) => Some(err.clone()),
            Inner::Cancelled => Some(Error::Cancelled),
            _ => None,
        }
    }

    /// Blocks the calling thread until completion.
    ///
    /// Must not be called from a reactor thread: the completion may itself be
    /// scheduled on that reactor and would deadlock.
    pub fn wait(&self) -> Result<T, Error>
    where T: Clone {
        let mut state = self.0.state.lock().expect("promise mutex poisoned");
        while matches!(*state, Inner::Pending(_)) {
            state = self.0.done.wait(state).expect("promise mutex poisoned");
        }
        outcome(&state)
    }

    /// Blocks until completion or until `timeout` elapses; returns whether
    /// the future completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.0.state.lock().expect("promise mutex poisoned");
        while matches!(*state, Inner::Pending(_)) {
            let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) else {
                return false;
            };
            let (guard, res) =
                self.0.done.wait_timeout(state, left).expect("promise mutex poisoned");
            state = guard;
            if res.timed_out() && matches!(*state, Inner::Pending(_)) {
                return false;
            }
        }
        true
    }

    /// Returns the completed value or failure; `None` while incomplete.
    pub fn result(&self) -> Option<Result<T, Error>>
    where T: Clone {
        let state = self.0.state.lock().expect("promise mutex poisoned");
        if matches!(*state, Inner::Pending(_)) {
            return None;
        }
        Some(outcome(&state))
    }
}

fn outcome<T: Clone>(state: &Inner<T>) -> Result<T, Error> {
    match state {
        Inner::Success(value) => Ok(value.clone()),
        Inner::Failure(err) => Err(err.clone()),
        Inner::Cancelled => Err(Error::Cancelled),
        Inner::Pending(_) => unreachable!("checked by the callers"),
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn write_once() {
        let promise = Promise::<u8>::new(None);
        assert!(promise.try_success(1));
        assert!(!promise.try_success(2));
        assert!(!promise.try_failure(Error::ChannelClosed));
        assert_eq!(promise.future().wait().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "promise completed more than once")]
    fn strict_double_completion() {
        let promise = Promise::<u8>::new(None);
        promise.set_success(1);
        promise.set_success(2);
    }

    #[test]
    fn listener_order_preserved() {
        let promise = Promise::<()>::new(None);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            promise.future().on_complete(move |_| order.lock().unwrap().push(i));
        }
        promise.set_success(());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn late_listener_runs_immediately() {
        let promise = Promise::<u8>::new(None);
        promise.set_success(7);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        promise.future().on_complete(move |f| {
            assert_eq!(f.result().unwrap().unwrap(), 7);
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_is_opt_in() {
        let plain = Promise::<()>::new(None);
        assert!(!plain.future().cancel());

        let cancellable = Promise::<()>::cancellable(None);
        let future = cancellable.future();
        assert!(future.cancel());
        assert!(future.is_cancelled());
        assert!(matches!(future.cause(), Some(Error::Cancelled)));
        assert!(!cancellable.try_success(()));
    }
}

//! Generic driver for small sync/async state graphs.
//!
//! States are singletons: each is a unit struct with a `&'static` instance
//! shared by every machine of that type. A synchronous state does its work in
//! `handle` and returns [`Step::Continue`]; the driver executes chains of
//! synchronous states in a tight loop rather than recursing. An asynchronous
//! state kicks off its work, hands the [`Resume`] to a completion callback,
//! and returns [`Step::Pending`]; the machine parks until `resume` fires,
//! possibly on another thread.
//!
//! A handler (or its completion callback) may override the statically declared
//! successor with [`Resume::set_next`]. `stop` and `await_stop` are guarded so
//! the finish callback runs exactly once.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// What a state handler tells the driver to do next.
pub enum Step {
    /// The state finished; advance (or finish, if the state is terminal).
    Continue,
    /// The state started asynchronous work; wait for its `Resume`.
    Pending,
}

pub type StateRef<M, E> = &'static dyn State<M, E>;

pub trait State<M, E>: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, instance: &mut M, resume: Resume<M, E>) -> Result<Step, E>;

    /// Statically declared successor. Ignored when the handler forced one.
    fn next(&self, instance: &M) -> StateRef<M, E>;

    /// Terminal states finish the machine after their handler completes.
    fn is_terminal(&self) -> bool {
        false
    }
}

type DoneCallback<E> = Box<dyn FnOnce(Result<(), E>) + Send>;

struct Control<M: 'static, E: 'static> {
    running: bool,
    finished: bool,
    current: StateRef<M, E>,
    forced_next: Option<StateRef<M, E>>,
    on_done: Option<DoneCallback<E>>,
}

struct Shared<M: 'static, E: 'static> {
    instance: Mutex<M>,
    control: Mutex<Control<M, E>>,
    stopped: Condvar,
}

pub struct Machine<M: 'static, E: 'static> {
    shared: Arc<Shared<M, E>>,
}

impl<M: 'static, E: 'static> Clone for Machine<M, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Handle passed to every state handler. Completion callbacks use it to touch
/// the machine instance, override the next state, and continue the machine.
pub struct Resume<M: 'static, E: 'static> {
    shared: Arc<Shared<M, E>>,
}

impl<M: Send + 'static, E: Send + 'static> Machine<M, E> {
    pub fn new(instance: M, initial: StateRef<M, E>) -> Self {
        Self {
            shared: Arc::new(Shared {
                instance: Mutex::new(instance),
                control: Mutex::new(Control {
                    running: false,
                    finished: false,
                    current: initial,
                    forced_next: None,
                    on_done: None,
                }),
                stopped: Condvar::new(),
            }),
        }
    }

    /// Runs the machine on the calling thread until it finishes or parks in
    /// an asynchronous state. `on_done` fires exactly once.
    pub fn start(&self, on_done: impl FnOnce(Result<(), E>) + Send + 'static) {
        {
            let mut control = self.shared.control.lock().expect("machine lock poisoned");
            if control.running || control.finished {
                return;
            }
            control.running = true;
            control.on_done = Some(Box::new(on_done));
        }
        run_loop(&self.shared);
    }

    /// Forces the machine to finish. Any parked asynchronous state is
    /// abandoned; cancel its underlying work separately.
    pub fn stop(&self) {
        finish(&self.shared, Ok(()));
    }

    /// Blocks the calling thread until the machine finishes.
    pub fn await_stop(&self) {
        let mut control = self.shared.control.lock().expect("machine lock poisoned");
        while control.running && !control.finished {
            control = self
                .shared
                .stopped
                .wait(control)
                .expect("machine lock poisoned");
        }
    }

    /// Consumes the machine and returns its instance, once finished.
    pub fn into_instance(self) -> Option<M> {
        let shared = Arc::try_unwrap(self.shared).ok()?;
        Some(shared.instance.into_inner().expect("machine lock poisoned"))
    }

    pub fn lock_instance(&self) -> MutexGuard<'_, M> {
        self.shared.instance.lock().expect("machine lock poisoned")
    }
}

impl<M: Send + 'static, E: Send + 'static> Resume<M, E> {
    /// Runs a closure against the machine instance. Must not be called from
    /// inside a state handler, which already holds the instance.
    pub fn with<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        let mut instance = self.shared.instance.lock().expect("machine lock poisoned");
        f(&mut instance)
    }

    /// Overrides the next state for the transition being completed.
    pub fn set_next(&self, state: StateRef<M, E>) {
        let mut control = self.shared.control.lock().expect("machine lock poisoned");
        control.forced_next = Some(state);
    }

    /// Completes the current asynchronous state and continues the machine on
    /// this thread. Consumes the handle, so it can fire at most once.
    pub fn resume(self, result: Result<(), E>) {
        match result {
            Err(err) => finish(&self.shared, Err(err)),
            Ok(()) => {
                let current = {
                    let control = self.shared.control.lock().expect("machine lock poisoned");
                    if !control.running || control.finished {
                        return;
                    }
                    control.current
                };
                if current.is_terminal() {
                    finish(&self.shared, Ok(()));
                } else {
                    advance(&self.shared, current);
                    run_loop(&self.shared);
                }
            }
        }
    }
}

fn run_loop<M: Send + 'static, E: Send + 'static>(shared: &Arc<Shared<M, E>>) {
    loop {
        let current = {
            let mut control = shared.control.lock().expect("machine lock poisoned");
            if !control.running || control.finished {
                return;
            }
            control.forced_next = None;
            control.current
        };

        tracing::trace!(state = current.name(), "running state");
        let step = {
            let mut instance = shared.instance.lock().expect("machine lock poisoned");
            current.handle(&mut instance, Resume {
                shared: Arc::clone(shared),
            })
        };

        match step {
            Err(err) => {
                finish(shared, Err(err));
                return;
            }
            Ok(Step::Pending) => return,
            Ok(Step::Continue) => {
                if current.is_terminal() {
                    finish(shared, Ok(()));
                    return;
                }
                advance(shared, current);
            }
        }
    }
}

fn advance<M: Send + 'static, E: Send + 'static>(
    shared: &Arc<Shared<M, E>>,
    current: StateRef<M, E>,
) {
    let forced = {
        let mut control = shared.control.lock().expect("machine lock poisoned");
        control.forced_next.take()
    };
    let next = forced.unwrap_or_else(|| {
        let instance = shared.instance.lock().expect("machine lock poisoned");
        current.next(&instance)
    });
    let mut control = shared.control.lock().expect("machine lock poisoned");
    control.current = next;
}

fn finish<M: 'static, E: 'static>(shared: &Arc<Shared<M, E>>, result: Result<(), E>) {
    let on_done = {
        let mut control = shared.control.lock().expect("machine lock poisoned");
        if control.finished {
            return;
        }
        control.finished = true;
        control.running = false;
        control.on_done.take()
    };
    if let Some(on_done) = on_done {
        on_done(result);
    }
    shared.stopped.notify_all();
}

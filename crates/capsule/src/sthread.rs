//! Sandboxed task spawning with an attached security context
//!
//! Every supervisor-owned task is created through this harness. A task may
//! carry a callee context (handed to the code running inside it) and an
//! exit callback that fires exactly once when the entry future finishes,
//! whether it returns or panics. Contexts live in a side table keyed by the
//! minted pid; the guest only ever sees what the runtime adapter hands it.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use futures::FutureExt;
use tracing::warn;

/// Task identifier minted by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

/// Reserved invalid pid; never minted.
pub const INVALID_PID: Pid = Pid(0);

type Callee = Arc<dyn Any + Send + Sync>;

/// Callback run exactly once after the task's entry future finishes.
pub type ExitCallback = Box<dyn FnOnce(Pid) + Send + 'static>;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static CONTEXTS: OnceLock<Mutex<HashMap<Pid, Callee>>> = OnceLock::new();

fn contexts() -> &'static Mutex<HashMap<Pid, Callee>> {
    CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()))
}

tokio::task_local! {
    static CURRENT_PID: Pid;
}

/// Spawn parameters; stack sizing is the host's business, priority is
/// advisory under a cooperative scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    pub name: &'static str,
    pub priority: u8,
}

/// Spawn a sandboxed task.
///
/// The callee context, if any, is retrievable from inside the task with
/// [`callee_context`]. `on_exit` runs exactly once after `entry` completes
/// or panics.
pub fn spawn<F, Fut>(
    options: SpawnOptions,
    callee: Option<Callee>,
    on_exit: Option<ExitCallback>,
    entry: F,
) -> Pid
where
    F: FnOnce(Pid) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let pid = Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed));
    if let Some(context) = callee {
        contexts()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, context);
    }

    let name = options.name;
    tokio::spawn(CURRENT_PID.scope(pid, async move {
        let outcome = AssertUnwindSafe(entry(pid)).catch_unwind().await;
        if outcome.is_err() {
            warn!(task = name, pid = pid.0, "sandboxed task panicked");
        }
        contexts()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
        if let Some(callback) = on_exit {
            callback(pid);
        }
    }));

    pid
}

/// The pid of the current sandboxed task, if any.
pub fn current_pid() -> Option<Pid> {
    CURRENT_PID.try_with(|pid| *pid).ok()
}

/// The callee context installed at spawn. Defined only from within a
/// sandboxed task whose context is a `T`.
pub fn callee_context<T: Send + Sync + 'static>() -> Option<Arc<T>> {
    let pid = current_pid()?;
    let context = contexts()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&pid)
        .cloned()?;
    context.downcast::<T>().ok()
}

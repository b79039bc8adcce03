// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The designated execution context for GPU work.

GPU backends often require you to call their APIs "in context".  This is typically, though not
always, a certain thread.  Callers of this crate, meanwhile, may be anywhere.

How we bridge the two:

* [MainContext] is the host's scheduler primitive.  It accepts a `Send` closure and runs it in the
  right place.
* [smuggle] ships a closure to the context and resumes the calling future with its result.
  If the caller is already in context, the closure runs inline.
* [yield_now] gives up one scheduling quantum, which is how long-running work stays polite.
*/

use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc::{self, Sender};
use std::task::{Context, Poll};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

/// Work submitted to a [MainContext].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler primitive that runs jobs on the one context allowed to touch GPU resources.
///
/// Implementations must accept jobs from any thread.
pub trait MainContext: Send + Sync + 'static {
    /// Schedules `job` to run on the context.  Must not block on the job completing.
    fn submit(&self, job: Job);
    /// True when the calling code is already running on the context.
    fn is_current(&self) -> bool;
}

/// A context that is wherever the caller happens to be.
///
/// Suitable for backends without threading requirements, such as the software backend or wgpu on
/// native platforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct Relaxed;

impl MainContext for Relaxed {
    fn submit(&self, job: Job) {
        job();
    }

    fn is_current(&self) -> bool {
        true
    }
}

/// A context backed by one dedicated thread.
///
/// Jobs run in submission order.  The thread exits when this value is dropped.
#[derive(Debug)]
pub struct DedicatedThread {
    sender: Option<Sender<Job>>,
    thread_id: ThreadId,
    thread: Option<JoinHandle<()>>,
}

impl DedicatedThread {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                //exits once every sender is gone
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })?;
        Ok(DedicatedThread {
            sender: Some(sender),
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }
}

impl MainContext for DedicatedThread {
    fn submit(&self, job: Job) {
        //the sender is only taken in drop
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        if sender.send(job).is_err() {
            logwise::error_sync!("DedicatedThread receiver is gone; job dropped");
        }
    }

    fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }
}

impl Drop for DedicatedThread {
    fn drop(&mut self) {
        drop(self.sender.take());
        //joining ourselves would deadlock
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/**
Runs `f` on `context` and resumes the caller with the result.

The closure must be `Send` because it may travel to another thread; the result travels back the
same way.
*/
pub async fn smuggle<F, R>(context: &dyn MainContext, label: &'static str, f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if context.is_current() {
        return f();
    }
    let prior_context = logwise::context::Context::current();
    let hop = logwise::perfwarn_begin!("smuggle hop to main context");
    let (s, r) = r#continue::continuation();
    context.submit(Box::new(move || {
        //logs from `f` nest under the caller's task
        let c = logwise::context::Context::new_task(Some(prior_context), "smuggle".to_string());
        let id = c.context_id();
        c.set_current();
        logwise::trace_sync!("smuggle {label}", label = logwise::privacy::LogIt(label));
        let result = f();
        logwise::context::Context::pop(id);
        s.send(result);
    }));
    let result = r.await;
    drop(hop);
    result
}

/// Future returned by [yield_now].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Suspends for exactly one poll, letting the executor run something else.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// One scheduling quantum: a single-poll yield, or a sleep when the host paces by time.
pub(crate) async fn yield_quantum(sleep: Duration) {
    if sleep.is_zero() {
        yield_now().await;
    } else {
        portable_async_sleep::async_sleep(sleep).await;
    }
}

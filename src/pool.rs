//! Indexed work processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). In order to
//! prevent overflow, we limit the number of work items that may be "in flight"
//! at any one time, and once that limit is reached, trying to submit more items
//! for processing will block until one of the in-flight items is completed.
//!
//! Every input carries its global index, and results come back tagged with
//! that index in completion order. Callers must key results by index, never
//! by position.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{
    FutureExt as _, SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
    future,
};
use tokio::task::JoinHandle;

use crate::{
    async_utils::{BoxedFuture, BoxedStream, JoinWorker},
    prelude::*,
};

/// A cooperative cancellation flag, shared between the Ctrl-C handler and the
/// pool.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Ask everything watching this token to stop starting new work.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Work items contain an input, and a one-shot channel on which to return the
/// result.
#[derive(Debug)]
struct WorkItem<Input, Output> {
    input: Input,
    tx: oneshot::Sender<Result<Output>>,
}

/// An async work function. It must not capture any mutable state: workers
/// only talk to the caller through their return value.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Result<Output>> + Send + Sync + 'static>;

/// A handle to a [`WorkQueue`]. It can be cloned cheaply and passed around.
struct WorkQueueHandle<Input, Output> {
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<Input, Output> Clone for WorkQueueHandle<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Input, Output> WorkQueueHandle<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Submit an input and wait for its output. Blocks while the queue is
    /// full.
    async fn process(&self, input: Input) -> Result<Output> {
        let (tx, rx) = oneshot::channel();
        // We need a mutable copy of `tx` to send the item, so we clone it here.
        let mut queue_tx = self.tx.clone();
        queue_tx
            .send(WorkItem { input, tx })
            .await
            .context("failed to send work item")?;
        rx.await.context("failed to receive work item result")?
    }
}

/// Maintains a queue of work items and processes up to `concurrency_limit` of
/// them at a time.
struct WorkQueue<Input, Output> {
    tx: mpsc::Sender<WorkItem<Input, Output>>,
    worker_handle: JoinHandle<()>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Note that up to `concurrency_limit` work may be waiting at any one time,
    /// and another `concurrency_limit` work items may be in progress.
    fn new(concurrency_limit: usize, work_fn: WorkFn<Input, Output>) -> Self {
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker_handle = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    // A panicking task becomes a failed task, not a dead pool.
                    let result = AssertUnwindSafe(work_fn(item.input))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(anyhow!("worker task panicked")));
                    if item.tx.send(result).is_err() {
                        debug!("failed to send work item result because receiver was dropped");
                    }
                }
            })
            .await;
        });
        Self { tx, worker_handle }
    }

    fn handle(&self) -> WorkQueueHandle<Input, Output> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }

    /// Close the work queue once every handle has been dropped.
    async fn close(self) -> Result<()> {
        let Self { tx, worker_handle } = self;
        drop(tx);
        worker_handle
            .await
            .context("failed to join worker thread")?;
        Ok(())
    }
}

/// Runs a work function over indexed inputs with bounded parallelism.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    /// Tasks running at once.
    jobs: usize,
    /// Tasks submitted but not yet retrieved. Bounds memory held by finished
    /// results.
    window: usize,
    cancel: CancelToken,
}

impl WorkerPool {
    pub fn new(jobs: usize, cancel: CancelToken) -> Self {
        let jobs = jobs.max(1);
        Self {
            jobs,
            window: jobs * 4,
            cancel,
        }
    }

    /// Run `work_fn` over `inputs`, yielding `(index, result)` pairs as tasks
    /// finish. A failed task yields `None` for its index.
    ///
    /// Once the cancel token fires, no further inputs are submitted, but
    /// in-flight tasks still report. Drop the stream before joining the
    /// returned worker.
    pub fn run<Input, Output>(
        &self,
        inputs: Vec<(usize, Input)>,
        work_fn: WorkFn<Input, Output>,
    ) -> (BoxedStream<(usize, Option<Output>)>, JoinWorker)
    where
        Input: Send + 'static,
        Output: Send + 'static,
    {
        let queue = WorkQueue::new(self.jobs, work_fn);
        let handle = queue.handle();
        let cancel = self.cancel.clone();

        let results = futures::stream::iter(inputs)
            .take_while(move |_| future::ready(!cancel.is_cancelled()))
            .map(move |(index, input)| {
                let handle = handle.clone();
                async move {
                    match handle.process(input).await {
                        Ok(output) => (index, Some(output)),
                        Err(err) => {
                            warn!(index, "Task failed: {:#}", err);
                            (index, None)
                        }
                    }
                }
            })
            .buffer_unordered(self.window)
            .boxed();

        let worker = JoinWorker::from_handle(tokio::spawn(queue.close()));
        (results, worker)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use super::*;

    fn delayed_double() -> WorkFn<u64, u64> {
        Arc::new(|n: u64| -> BoxedFuture<Result<u64>> {
            async move {
                // Later inputs finish first.
                tokio::time::sleep(Duration::from_millis(50 - n * 5)).await;
                if n == 3 {
                    bail!("three is unlucky");
                }
                if n == 5 {
                    panic!("five panics");
                }
                Ok(n * 2)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn results_are_keyed_by_index() -> Result<()> {
        let pool = WorkerPool::new(4, CancelToken::default());
        let inputs = (0..8u64).map(|n| (100 + n as usize, n)).collect();
        let (results, worker) = pool.run(inputs, delayed_double());
        let results = results.collect::<BTreeMap<_, _>>().await;
        worker.join().await?;

        assert_eq!(results.len(), 8);
        assert_eq!(results[&100], Some(0));
        assert_eq!(results[&102], Some(4));
        assert_eq!(results[&103], None);
        assert_eq!(results[&105], None);
        assert_eq!(results[&107], Some(14));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_new_submissions() -> Result<()> {
        let cancel = CancelToken::default();
        let pool = WorkerPool::new(1, cancel.clone());
        let work_fn: WorkFn<usize, usize> =
            Arc::new(|n: usize| -> BoxedFuture<Result<usize>> { async move { Ok(n) }.boxed() });
        let inputs = (0..1000).map(|n| (n, n)).collect();
        let (mut results, worker) = pool.run(inputs, work_fn);

        let mut seen = 0;
        while let Some((_, output)) = results.next().await {
            assert!(output.is_some());
            seen += 1;
            if seen == 3 {
                cancel.cancel();
            }
        }
        drop(results);
        worker.join().await?;
        assert!(seen >= 3);
        assert!(seen < 1000, "cancellation should stop submission early");
        Ok(())
    }
}

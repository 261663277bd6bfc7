//! Reconciler harness: one per controller. All event pumps and the re-sync
//! ticker funnel through a single exclusive mutex, so handler invocations
//! for a controller never overlap. Cancellation lets in-flight handlers
//! finish; nothing is aborted mid-invocation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::EventQueue;

pub struct Harness<C> {
    name: &'static str,
    controller: Arc<Mutex<C>>,
}

impl<C: Send + 'static> Harness<C> {
    pub fn new(name: &'static str, controller: C) -> Self {
        Self {
            name,
            controller: Arc::new(Mutex::new(controller)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The big lock. Handlers passed to `spawn_pump`/`spawn_resync` receive
    /// this and lock it for the duration of their work; fan-out that must
    /// run outside the lock can snapshot under it and release first.
    pub fn controller(&self) -> Arc<Mutex<C>> {
        self.controller.clone()
    }

    /// Drain `queue` into `handler` until cancelled or the queue closes.
    pub fn spawn_pump<T, F, Fut>(
        &self,
        queue: EventQueue<T>,
        cancel: CancellationToken,
        handler: F,
    ) -> JoinHandle<()>
    where
        T: Send + 'static,
        F: Fn(Arc<Mutex<C>>, T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let name = self.name;
        let controller = self.controller.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = queue.pop() => item,
                };
                match item {
                    Some(item) => handler(controller.clone(), item).await,
                    None => break,
                }
            }
            tracing::debug!(controller = name, "event pump stopped");
        })
    }

    /// Periodic re-sync sweep, serialized with the event pumps through the
    /// same mutex.
    pub fn spawn_resync<F, Fut>(
        &self,
        period: Duration,
        cancel: CancellationToken,
        sweep: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Mutex<C>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let name = self.name;
        let controller = self.controller.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would race informer warm-up.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => sweep(controller.clone()).await,
                }
            }
            tracing::debug!(controller = name, "re-sync ticker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        handled: Vec<u32>,
        sweeps: usize,
    }

    #[tokio::test]
    async fn pump_and_resync_share_the_big_lock() {
        let harness = Harness::new(
            "test",
            Counter {
                handled: Vec::new(),
                sweeps: 0,
            },
        );
        let queue = EventQueue::new();
        let cancel = CancellationToken::new();

        let pump = harness.spawn_pump(queue.clone(), cancel.clone(), |c, item: u32| async move {
            c.lock().await.handled.push(item);
        });
        let resync =
            harness.spawn_resync(Duration::from_millis(20), cancel.clone(), |c| async move {
                c.lock().await.sweeps += 1;
            });

        for i in 0..5u32 {
            queue.push(format!("k{i}"), i).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        pump.await.unwrap();
        resync.await.unwrap();

        let controller = harness.controller();
        let guard = controller.lock().await;
        assert_eq!(guard.handled, vec![0, 1, 2, 3, 4]);
        assert!(guard.sweeps >= 1);
    }

    #[tokio::test]
    async fn pump_ends_when_queue_closes() {
        let harness = Harness::new("test", ());
        let queue: EventQueue<u32> = EventQueue::new();
        let cancel = CancellationToken::new();
        let pump = harness.spawn_pump(queue.clone(), cancel, |_, _| async {});
        queue.close();
        pump.await.unwrap();
    }
}

//! Filter-and-dispatch pipeline shared by every protocol manager.
//!
//! A [`ConnectionManager`] drives one [`MessageHandler`] over a connection's
//! broadcast stream. Each manager runs in its own task with its own receiver,
//! so a slow or failing handler never holds up a sibling or the connection.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::error::Result;

/// A (filter, handle) pair attached to a decoded-message stream
#[async_trait]
pub trait MessageHandler<M: Send + Sync>: Send + Sync {
    /// Name used to identify this registration in logs
    fn name(&self) -> &str;

    /// Decide whether `message` is meaningful to this handler
    async fn filter(&self, message: &M) -> Result<bool>;

    /// Act on a message that passed the filter
    async fn handle(&self, message: &M) -> Result<()>;
}

/// Anything that can hand out receivers for a hot, multicast message stream
pub trait MessageSource<M>: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<M>;
}

impl<M: Send> MessageSource<M> for broadcast::Sender<M> {
    fn subscribe(&self) -> broadcast::Receiver<M> {
        broadcast::Sender::subscribe(self)
    }
}

/// Closure-backed handler: a synchronous filter plus an async handle routine
pub struct FnHandler<M, F, H> {
    name: String,
    filter: F,
    handle: H,
    _message: PhantomData<fn(M)>,
}

impl<M, F, H> FnHandler<M, F, H> {
    pub fn new(name: impl Into<String>, filter: F, handle: H) -> Self {
        Self {
            name: name.into(),
            filter,
            handle,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, F, H, Fut> MessageHandler<M> for FnHandler<M, F, H>
where
    M: Clone + Send + Sync + 'static,
    F: Fn(&M) -> bool + Send + Sync,
    H: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn filter(&self, message: &M) -> Result<bool> {
        Ok((self.filter)(message))
    }

    async fn handle(&self, message: &M) -> Result<()> {
        (self.handle)(message.clone()).await
    }
}

/// Run one message through a handler, containing any error or panic
///
/// Returns `true` when the handler completed without failing.
pub(crate) async fn run_isolated<M: Send + Sync>(
    owner: &str,
    handler: &dyn MessageHandler<M>,
    message: &M,
) -> bool {
    let outcome = AssertUnwindSafe(async {
        if handler.filter(message).await? {
            handler.handle(message).await?;
        }
        Ok::<(), super::error::TwitchError>(())
    })
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::error!("[{}] handler '{}' failed: {}", owner, handler.name(), e);
            false
        }
        Err(_) => {
            log::error!("[{}] handler '{}' panicked", owner, handler.name());
            false
        }
    }
}

/// Drives a single handler over a connection's decoded-message stream
pub struct ConnectionManager<M: Send + Sync> {
    name: String,
    source: Arc<dyn MessageSource<M>>,
    handler: Arc<dyn MessageHandler<M>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<M> ConnectionManager<M>
where
    M: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn MessageSource<M>>,
        handler: Arc<dyn MessageHandler<M>>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            handler,
            task: Mutex::new(None),
        }
    }

    /// Subscribe the handler to the stream. Calling `start` twice restarts it.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let mut stream = BroadcastStream::new(self.source.subscribe());
        let handler = self.handler.clone();
        let name = self.name.clone();

        *task = Some(tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => {
                        run_isolated(&name, handler.as_ref(), &message).await;
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        log::warn!(
                            "[{}] handler '{}' lagged, skipped {} messages",
                            name,
                            handler.name(),
                            skipped
                        );
                    }
                }
            }
            log::debug!("[{}] stream ended for '{}'", name, handler.name());
        }));

        log::debug!("[{}] started '{}'", self.name, self.handler.name());
    }

    /// Cancel the subscription
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            log::debug!("[{}] stopped '{}'", self.name, self.handler.name());
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl<M: Send + Sync> Drop for ConnectionManager<M> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::twitch::error::TwitchError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout, Duration};

    struct Counting {
        name: String,
        accept: bool,
        fail: bool,
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler<u32> for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        async fn filter(&self, _message: &u32) -> Result<bool> {
            Ok(self.accept)
        }

        async fn handle(&self, message: &u32) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TwitchError::ChannelError(format!("boom on {}", message)));
            }
            Ok(())
        }
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("counter never reached expected value");
    }

    #[tokio::test]
    async fn test_rejecting_filter_never_handles() {
        let (tx, _rx) = broadcast::channel::<u32>(16);
        let handled = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(
            "test",
            Arc::new(tx.clone()),
            Arc::new(Counting {
                name: "never".to_string(),
                accept: false,
                fail: false,
                handled: handled.clone(),
            }),
        );
        manager.start().await;

        for i in 0..10 {
            tx.send(i).unwrap();
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(handled.load(Ordering::SeqCst), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_affect_sibling() {
        let (tx, _rx) = broadcast::channel::<u32>(16);
        let failing_count = Arc::new(AtomicUsize::new(0));
        let healthy_count = Arc::new(AtomicUsize::new(0));

        let failing = ConnectionManager::new(
            "test",
            Arc::new(tx.clone()),
            Arc::new(Counting {
                name: "failing".to_string(),
                accept: true,
                fail: true,
                handled: failing_count.clone(),
            }),
        );
        let healthy = ConnectionManager::new(
            "test",
            Arc::new(tx.clone()),
            Arc::new(Counting {
                name: "healthy".to_string(),
                accept: true,
                fail: false,
                handled: healthy_count.clone(),
            }),
        );
        failing.start().await;
        healthy.start().await;

        for i in 0..5 {
            tx.send(i).unwrap();
        }

        wait_for(&healthy_count, 5).await;
        wait_for(&failing_count, 5).await;
        assert!(failing.is_running().await);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let (tx, _rx) = broadcast::channel::<u32>(16);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let handler = FnHandler::new(
            "panicky",
            |_: &u32| true,
            move |message: u32| {
                let seen = seen_clone.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if message == 0 {
                        panic!("first message");
                    }
                    Ok(())
                }
            },
        );
        let manager = ConnectionManager::new("test", Arc::new(tx.clone()), Arc::new(handler));
        manager.start().await;

        tx.send(0).unwrap();
        tx.send(1).unwrap();

        wait_for(&seen, 2).await;
        assert!(manager.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_cancels_subscription() {
        let (tx, _rx) = broadcast::channel::<u32>(16);
        let handled = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(
            "test",
            Arc::new(tx.clone()),
            Arc::new(Counting {
                name: "stoppable".to_string(),
                accept: true,
                fail: false,
                handled: handled.clone(),
            }),
        );
        manager.start().await;
        tx.send(1).unwrap();
        wait_for(&handled, 1).await;

        manager.stop().await;
        assert!(!manager.is_running().await);
        let _ = tx.send(2);
        sleep(Duration::from_millis(30)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}

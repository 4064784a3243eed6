//! Change-notification listener that wakes idle consumers.
//!
//! Producers publish on the partition's `{prefix-topic-partition}-changed`
//! channel after every write. The [`Monitor`] holds one subscription for
//! all registered channels on a connection of its own and turns each
//! message into a [`Notify::notify_one`] on the matching consumer's wake
//! signal. A permit
//! stored while the consumer is busy makes its next idle sleep return at
//! once, so a notification is never lost between polls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_stream::StreamExt;

use crate::config::MonitorConfig;
use crate::store::ChangeFeed;

/// Subscribes to change channels and signals the registered waiters.
pub struct Monitor {
    feed: Arc<dyn ChangeFeed>,
    config: MonitorConfig,
    channels: Mutex<HashMap<String, Arc<Notify>>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("channels", &self.channel_names())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Create a monitor reading from `feed`.
    pub fn new(feed: Arc<dyn ChangeFeed>, config: MonitorConfig) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            feed,
            config,
            channels: Mutex::new(HashMap::new()),
            shutdown_tx,
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Return the wake signal for `channel`, creating it if needed.
    ///
    /// Channels registered after [`start`](Monitor::start) are picked up
    /// the next time the subscription is re-established.
    pub fn register(&self, channel: impl Into<String>) -> Arc<Notify> {
        let mut channels = self.channels.lock().expect("monitor channel lock poisoned");
        Arc::clone(channels.entry(channel.into()).or_default())
    }

    fn channel_names(&self) -> Vec<String> {
        let channels = self.channels.lock().expect("monitor channel lock poisoned");
        let mut names: Vec<String> = channels.keys().cloned().collect();
        names.sort();
        names
    }

    fn signal(&self, channel: &str) {
        let notify = self
            .channels
            .lock()
            .expect("monitor channel lock poisoned")
            .get(channel)
            .cloned();
        if let Some(notify) = notify {
            notify.notify_one();
        }
    }

    /// Spawn the subscription loop. Calling `start` while it runs is a
    /// no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            monitor.run(shutdown_rx).await;
        }));
    }

    async fn run(&self, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        let mut backoff_delay = self.config.reconnect_base_delay;

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let channels = self.channel_names();
            if channels.is_empty() {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                return;
            }

            match self.feed.subscribe(&channels).await {
                Ok(mut stream) => {
                    tracing::info!(channels = channels.len(), "monitor: subscribed");
                    backoff_delay = self.config.reconnect_base_delay;
                    loop {
                        tokio::select! {
                            message = stream.next() => match message {
                                Some(channel) => self.signal(&channel),
                                None => break,
                            },
                            _ = shutdown_rx.wait_for(|stop| *stop) => return,
                        }
                    }
                    tracing::warn!("monitor: subscription ended, will resubscribe");
                }
                Err(e) => {
                    tracing::error!(error = %e, "monitor: subscribe failed, will retry");
                }
            }

            // Consumers still poll on their idle timer while disconnected.
            tokio::select! {
                _ = tokio::time::sleep(backoff_delay) => {}
                _ = shutdown_rx.wait_for(|stop| *stop) => return,
            }
            backoff_delay = (backoff_delay * 2).min(self.config.reconnect_max_delay);
        }
    }

    /// Stop the subscription loop and wait for it to exit.
    ///
    /// Calling `dispose` more than once is safe.
    pub async fn dispose(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task
            && let Err(e) = join_handle.await
        {
            tracing::error!(error = %e, "monitor task panicked");
        }
    }
}

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::formatter::{menubar_summary, PENDING_MARKER};
use crate::models::AggregateResult;
use arc_swap::ArcSwapOption;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Periodic refresher behind the status-bar line.
///
/// Holds the most recent [`AggregateResult`]; a new result replaces the old
/// one in a single pointer swap. At most one cycle runs at a time.
#[derive(Clone)]
pub struct MenubarDriver {
    aggregator: Aggregator,
    config: Arc<Config>,
    last: Arc<ArcSwapOption<AggregateResult>>,
    in_flight: Arc<Mutex<()>>,
}

impl MenubarDriver {
    pub fn new(aggregator: Aggregator, config: Config) -> Self {
        Self {
            aggregator,
            config: Arc::new(config),
            last: Arc::new(ArcSwapOption::empty()),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn last_result(&self) -> Option<Arc<AggregateResult>> {
        self.last.load_full()
    }

    pub fn summary(&self) -> String {
        match self.last.load_full() {
            Some(result) => menubar_summary(&result),
            None => PENDING_MARKER.to_string(),
        }
    }

    /// Run one cycle now. Returns `false` without doing anything when a
    /// cycle is already in flight.
    pub async fn refresh_now(&self) -> bool {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Refresh already in flight, ignoring trigger");
            return false;
        };

        let result = self.aggregator.run(&self.config).await;
        self.last.store(Some(Arc::new(result)));
        true
    }

    fn spawn_cycle(&self, done: mpsc::UnboundedSender<()>) {
        let driver = self.clone();
        tokio::spawn(async move {
            if driver.refresh_now().await {
                let _ = done.send(());
            }
        });
    }

    /// Refresh on start, every `interval`, and whenever `triggers` yields,
    /// emitting the summary line after each completed cycle. Cycles run on
    /// their own tasks so the loop keeps serving triggers while a slow
    /// provider is pending. Returns once `shutdown` resolves.
    pub async fn run<F, E>(
        self,
        interval: Duration,
        mut triggers: mpsc::Receiver<()>,
        shutdown: F,
        mut emit: E,
    ) where
        F: Future<Output = ()>,
        E: FnMut(&str),
    {
        info!(interval_secs = interval.as_secs(), "Starting menubar refresh loop");
        emit(&self.summary());

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut triggers_open = true;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    debug!("Scheduled refresh");
                    self.spawn_cycle(done_tx.clone());
                }
                trigger = triggers.recv(), if triggers_open => match trigger {
                    Some(()) => {
                        debug!("Manual refresh");
                        self.spawn_cycle(done_tx.clone());
                    }
                    None => triggers_open = false,
                },
                Some(()) = done_rx.recv() => emit(&self.summary()),
            }
        }

        info!("Menubar refresh loop stopped");
    }
}

/// Forward SIGUSR1 as a manual refresh, the way status bars poke their
/// custom modules.
#[cfg(unix)]
pub fn manual_triggers() -> std::io::Result<mpsc::Receiver<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signals = signal(SignalKind::user_defined1())?;
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while signals.recv().await.is_some() {
            // A full channel already holds a pending refresh.
            let _ = tx.try_send(());
        }
    });
    Ok(rx)
}

#[cfg(not(unix))]
pub fn manual_triggers() -> std::io::Result<mpsc::Receiver<()>> {
    // No signal to listen for; the loop treats a closed channel as "no
    // manual triggers".
    let (_tx, rx) = mpsc::channel(1);
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use crate::error::ProviderError;
    use crate::mock::{FailAt, MockProvider};
    use crate::models::UsageInfo;
    use crate::providers::{AuthContext, Provider, Registry};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers after a delay so cycles overlap.
    struct SlowProvider {
        delay: Duration,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl Provider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn authenticate(&self, credential: &Credential) -> Result<AuthContext, ProviderError> {
            AuthContext::bearer(credential)
        }

        async fn fetch_usage(&self, _auth: &AuthContext) -> Result<Vec<u8>, ProviderError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }

        fn parse_usage(&self, _raw: &[u8]) -> Result<UsageInfo, ProviderError> {
            Ok(UsageInfo::new("slow", 1.0, 4.0))
        }
    }

    fn driver(providers: Vec<Arc<dyn Provider>>, config: Config) -> MenubarDriver {
        let mut registry = Registry::new();
        for provider in providers {
            registry.register(provider);
        }
        MenubarDriver::new(Aggregator::new(registry), config)
    }

    #[tokio::test]
    async fn test_summary_before_and_after_refresh() {
        let driver = driver(
            vec![
                Arc::new(MockProvider::ok("kimi", r#"{"used": 13, "limit": 100}"#)),
                Arc::new(MockProvider::ok("bigmodel", r#"{"used": 45, "limit": 100}"#)),
            ],
            Config::from_entries([("kimi", "k1"), ("bigmodel", "b1")]),
        );

        assert_eq!(driver.summary(), PENDING_MARKER);
        assert!(driver.last_result().is_none());

        assert!(driver.refresh_now().await);
        assert_eq!(driver.summary(), "kimi: 13% | bigmodel: 45%");
    }

    #[tokio::test]
    async fn test_new_result_replaces_old() {
        let driver = driver(
            vec![Arc::new(MockProvider::ok("kimi", r#"{"used": 13, "limit": 100}"#))],
            Config::from_entries([("kimi", "k1")]),
        );

        driver.refresh_now().await;
        let first = driver.last_result().unwrap();
        driver.refresh_now().await;
        let second = driver.last_result().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        // A reader holding the old snapshot still sees it intact.
        assert_eq!(first.len(), 1);
        assert_eq!(menubar_summary(&first), "kimi: 13%");
    }

    #[tokio::test]
    async fn test_overlapping_triggers_run_once() {
        let slow = Arc::new(SlowProvider {
            delay: Duration::from_millis(200),
            fetches: AtomicUsize::new(0),
        });
        let driver = driver(
            vec![slow.clone() as Arc<dyn Provider>],
            Config::from_entries([("slow", "s1")]),
        );

        let (first, second) = tokio::join!(driver.refresh_now(), driver.refresh_now());
        assert!(first);
        assert!(!second);
        assert_eq!(slow.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(driver.summary(), "slow: 25%");
    }

    #[tokio::test]
    async fn test_failed_provider_shows_marker() {
        let driver = driver(
            vec![
                Arc::new(MockProvider::failing("kimi", FailAt::Fetch)),
                Arc::new(MockProvider::ok("bigmodel", r#"{"used": 45, "limit": 100}"#)),
            ],
            Config::from_entries([("kimi", "k1"), ("bigmodel", "b1")]),
        );

        driver.refresh_now().await;
        assert_eq!(driver.summary(), "kimi: ERR | bigmodel: 45%");
    }

    #[tokio::test]
    async fn test_run_emits_on_start_and_manual_trigger() {
        let mock = Arc::new(MockProvider::ok("kimi", r#"{"used": 13, "limit": 100}"#));
        let driver = driver(
            vec![mock.clone() as Arc<dyn Provider>],
            Config::from_entries([("kimi", "k1")]),
        );

        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(driver.run(
            Duration::from_secs(3600),
            trigger_rx,
            async move {
                let _ = stop_rx.await;
            },
            move |line| {
                let _ = line_tx.send(line.to_string());
            },
        ));

        assert_eq!(line_rx.recv().await.unwrap(), PENDING_MARKER);
        // Immediate first tick
        assert_eq!(line_rx.recv().await.unwrap(), "kimi: 13%");

        trigger_tx.send(()).await.unwrap();
        assert_eq!(line_rx.recv().await.unwrap(), "kimi: 13%");
        assert_eq!(mock.fetch_count(), 2);

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}

//! The polling loop: fetch, print, advance the watermark, sleep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tracing::Instrument;

use crate::auth::callback::cancelled;
use crate::config::Config;
use crate::auth::AuthError;
use crate::error::Result;
use crate::extract::ExtractedFile;
use crate::print::{PrintError, PrintSink, Rasterizer};
use crate::provider::{FetchError, MailProvider, ProviderFactory};
use crate::state::StateStore;

/// Source of time for the scheduler.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Polling,
    Reinitializing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    /// A provider older than this is rebuilt before the next cycle.
    pub reauth_interval: Duration,
    pub delete_printed: bool,
    pub rasterize_pdf: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            reauth_interval: Duration::from_secs(config.reauth_interval_secs),
            delete_printed: config.delete_printed,
            rasterize_pdf: config.rasterize_pdf,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub printed: usize,
    pub failed: usize,
    /// Watermark recorded at the end of the cycle.
    pub watermark: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The fetch failed; nothing was printed and the watermark is unchanged.
    FetchFailed,
}

pub struct PollScheduler<'a> {
    factory: Box<dyn ProviderFactory>,
    sink: Box<dyn PrintSink>,
    state: &'a StateStore,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    rasterizer: Rasterizer,
    provider: Option<Box<dyn MailProvider>>,
    phase: Phase,
    last_init: Option<DateTime<Utc>>,
    rebuild_count: usize,
    cycles: u64,
}

impl<'a> PollScheduler<'a> {
    pub fn new(
        factory: Box<dyn ProviderFactory>,
        sink: Box<dyn PrintSink>,
        state: &'a StateStore,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            factory,
            sink,
            state,
            clock,
            settings,
            rasterizer: Rasterizer::default(),
            provider: None,
            phase: Phase::Init,
            last_init: None,
            rebuild_count: 0,
            cycles: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Forced re-initializations so far; the initial build is not counted.
    pub fn rebuild_count(&self) -> usize {
        self.rebuild_count
    }

    /// Polls until `shutdown` flips, then saves state. A running cycle is
    /// always finished; only the sleep between cycles is interrupted.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Polling every {}s (re-initializing every {}s)",
            self.settings.poll_interval.as_secs(),
            self.settings.reauth_interval.as_secs()
        );

        let result = self.poll_until(shutdown).await;
        if let Err(e) = self.state.flush().await {
            error!("Failed to save state on exit: {}", e);
            result?;
            return Err(e.into());
        }
        result
    }

    async fn poll_until(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await?;
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = self.clock.sleep(self.settings.poll_interval) => {}
                _ = cancelled(shutdown.clone()) => break,
            }
        }
        info!("Shutting down after {} cycle(s)", self.cycles);
        Ok(())
    }

    /// One fetch-and-print pass. Only authentication failures that need the
    /// user and printer misconfiguration are returned as errors.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.cycles += 1;
        let span = tracing::info_span!("cycle", n = self.cycles);
        self.cycle().instrument(span).await
    }

    async fn cycle(&mut self) -> Result<CycleOutcome> {
        let started = self.clock.now();
        let watermark = self.state.last_fetch().await;
        let delete = self.settings.delete_printed;

        let provider = match self.provider().await {
            Ok(provider) => provider,
            Err(e) if e.is_transient() => {
                error!("Provider initialization failed, will retry next cycle: {}", e);
                return Ok(CycleOutcome::FetchFailed);
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Fetching from {} after {}", provider.name(), watermark.to_rfc3339());
        let files = match provider.fetch_attachments(watermark, delete).await {
            Ok(files) => files,
            Err(FetchError::Auth(e)) if !e.is_transient() => return Err(e.into()),
            Err(e) => {
                error!("Fetch failed, will retry next cycle: {}", e);
                return Ok(CycleOutcome::FetchFailed);
            }
        };

        let fetched = files.len();
        let (printed, failed) = self.print_all(files).await?;

        let next = watermark.max(started);
        self.state.record_fetch(next).await;

        if fetched > 0 {
            info!(
                "Cycle done: {} printed, {} failed of {} file(s)",
                printed, failed, fetched
            );
        } else {
            debug!("Cycle done: nothing to print");
        }
        Ok(CycleOutcome::Completed(CycleReport {
            fetched,
            printed,
            failed,
            watermark: next,
        }))
    }

    /// The current provider, built on first use and rebuilt once it is older
    /// than the re-initialization interval. After a failed build the next
    /// cycle tries again.
    async fn provider(&mut self) -> std::result::Result<&mut Box<dyn MailProvider>, AuthError> {
        let now = self.clock.now();
        let reauth = chrono::Duration::from_std(self.settings.reauth_interval)
            .unwrap_or(chrono::Duration::MAX);
        let due = self
            .last_init
            .is_some_and(|last| now.signed_duration_since(last) >= reauth);

        let provider = match self.provider.take() {
            Some(provider) if !due => provider,
            previous => {
                self.phase = if self.last_init.is_some() {
                    info!("Re-initializing provider");
                    Phase::Reinitializing
                } else {
                    Phase::Init
                };
                drop(previous);
                let provider = self.factory.build().await?;
                if self.phase == Phase::Reinitializing {
                    self.rebuild_count += 1;
                }
                self.last_init = Some(now);
                self.phase = Phase::Polling;
                provider
            }
        };

        Ok(self.provider.insert(provider))
    }

    /// Prints every file and removes it afterwards. Returns (printed, failed).
    async fn print_all(&self, files: Vec<ExtractedFile>) -> Result<(usize, usize)> {
        let mut printed = 0;
        let mut failed = 0;

        for file in files {
            let result = self.print_one(&file).await;
            let path = file.path().to_path_buf();
            if let Err(e) = file.remove() {
                warn!("Failed to remove {}: {}", path.display(), e);
            }

            match result {
                Ok(()) => printed += 1,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    error!("{}", e);
                    failed += 1;
                }
            }
        }

        Ok((printed, failed))
    }

    async fn print_one(&self, file: &ExtractedFile) -> std::result::Result<(), PrintError> {
        info!(
            "Printing '{}' from message {}",
            file.original_name, file.message_id
        );

        if self.settings.rasterize_pdf && Rasterizer::applies_to(file.path()) {
            match self.rasterizer.rasterize(file.path()).await {
                Ok(rasterized) => {
                    for page in rasterized.pages() {
                        self.sink.print(page).await?;
                    }
                    return Ok(());
                }
                Err(e) => warn!("{}; printing the PDF as is", e),
            }
        }
        self.sink.print(file.path()).await
    }
}

//! Isolated environment for scheduler and fetch tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use mailprint::extract::Extractor;
use mailprint::scheduler::{PollScheduler, SchedulerSettings};
use mailprint::state::{StateStore, STATE_FILE};

use super::fakes::{FakeFactory, FakeMailbox, ManualClock, RecordingSink, SinkMode};

pub const SENDER: &str = "scanner@example.com";
pub const SKEW_SECS: i64 = 45;

/// A fixed, readable starting point for the manual clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub spool_dir: PathBuf,
    pub state: StateStore,
    pub mailbox: FakeMailbox,
    pub clock: Arc<ManualClock>,
    pub sink: RecordingSink,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let spool_dir = temp_dir.path().join("spool");
        let state =
            StateStore::open(temp_dir.path().join(STATE_FILE)).expect("Failed to open state");

        Self {
            temp_dir,
            spool_dir,
            state,
            mailbox: FakeMailbox::default(),
            clock: Arc::new(ManualClock::new(t0())),
            sink: RecordingSink::new(SinkMode::Accept),
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn state_path(&self) -> PathBuf {
        self.temp_dir.path().join(STATE_FILE)
    }

    pub fn extractor(&self) -> Extractor {
        Extractor::new(&self.spool_dir)
    }

    pub fn factory(&self) -> FakeFactory {
        FakeFactory::new(
            self.mailbox.clone(),
            self.extractor(),
            vec![SENDER.to_string()],
            chrono::Duration::seconds(SKEW_SECS),
        )
    }

    pub fn settings(&self, delete_printed: bool) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: Duration::from_secs(60),
            reauth_interval: Duration::from_secs(12 * 60 * 60),
            delete_printed,
            rasterize_pdf: false,
        }
    }

    /// A scheduler over the fake mailbox; the factory handle is returned so
    /// tests can count provider builds.
    pub fn scheduler(&self, delete_printed: bool) -> (PollScheduler<'_>, FakeFactory) {
        let factory = self.factory();
        let scheduler = PollScheduler::new(
            Box::new(factory.clone()),
            Box::new(self.sink.clone()),
            &self.state,
            self.clock.clone(),
            self.settings(delete_printed),
        );
        (scheduler, factory)
    }

    /// Files left behind in the spool directory.
    pub fn spool_files(&self) -> usize {
        std::fs::read_dir(&self.spool_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

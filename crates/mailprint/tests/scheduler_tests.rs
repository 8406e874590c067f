//! Poll scheduler behaviour with a manual clock: watermark handling, forced
//! re-initialization, print failure classification and shutdown.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;

use common::{
    attachment, message, t0, FakeIssuer, RecordingSink, SinkMode, TestHarness, TokenGatedFactory,
    SENDER,
};
use mailprint::auth::{AuthError, Credentials, Token};
use mailprint::error::MailprintError;
use mailprint::print::PrintError;
use mailprint::scheduler::{CycleOutcome, Phase, PollScheduler};
use mailprint::state::{initial_watermark, StateStore};
use mailprint::vault::TokenStore;

fn report(outcome: CycleOutcome) -> mailprint::scheduler::CycleReport {
    match outcome {
        CycleOutcome::Completed(report) => report,
        CycleOutcome::FetchFailed => panic!("fetch unexpectedly failed"),
    }
}

#[tokio::test]
async fn test_watermark_advances_to_cycle_start() {
    let harness = TestHarness::new();
    let (mut scheduler, _) = harness.scheduler(true);
    assert_eq!(harness.state.last_fetch().await, initial_watermark());

    let report = report(scheduler.run_cycle().await.unwrap());
    assert_eq!(report.watermark, t0());
    assert_eq!(harness.state.last_fetch().await, t0());
    assert_eq!(scheduler.phase(), Phase::Polling);
}

#[tokio::test]
async fn test_watermark_unchanged_when_fetch_fails() {
    let harness = TestHarness::new();
    let (mut scheduler, _) = harness.scheduler(true);
    scheduler.run_cycle().await.unwrap();

    harness.mailbox.set_fail_listing(true);
    harness.clock.advance(Duration::hours(1));
    assert_eq!(
        scheduler.run_cycle().await.unwrap(),
        CycleOutcome::FetchFailed
    );
    assert_eq!(harness.state.last_fetch().await, t0());

    harness.mailbox.set_fail_listing(false);
    let report = report(scheduler.run_cycle().await.unwrap());
    assert_eq!(report.watermark, t0() + Duration::hours(1));
}

#[tokio::test]
async fn test_watermark_never_moves_backwards() {
    let harness = TestHarness::new();
    let (mut scheduler, _) = harness.scheduler(true);
    scheduler.run_cycle().await.unwrap();

    harness.clock.set(t0() - Duration::days(1));
    let report = report(scheduler.run_cycle().await.unwrap());
    assert_eq!(report.watermark, t0());
    assert_eq!(harness.state.last_fetch().await, t0());
}

#[tokio::test]
async fn test_late_message_is_printed_in_at_most_one_extra_cycle() {
    let harness = TestHarness::new();
    let (mut scheduler, _) = harness.scheduler(false);

    // First cycle at T sees nothing.
    assert_eq!(report(scheduler.run_cycle().await.unwrap()).fetched, 0);

    // Indexed after the first cycle, but received 30 s before it.
    harness.mailbox.deliver(
        SENDER,
        message("late", t0() - Duration::seconds(30), vec![attachment("late.pdf", b"LATE")]),
    );
    harness.mailbox.deliver(
        SENDER,
        message("stale", t0() - Duration::minutes(5), vec![attachment("stale.pdf", b"STALE")]),
    );

    harness.clock.advance(Duration::minutes(1));
    let second = report(scheduler.run_cycle().await.unwrap());
    assert_eq!(second.printed, 1);
    assert_eq!(harness.sink.printed(), vec![b"LATE".to_vec()]);

    let queries = harness.mailbox.queries();
    assert_eq!(queries[1].received_after, Some(t0() - Duration::seconds(45)));

    harness.clock.advance(Duration::minutes(1));
    let third = report(scheduler.run_cycle().await.unwrap());
    assert_eq!(third.fetched, 0);
    assert_eq!(harness.sink.printed().len(), 1);
}

#[tokio::test]
async fn test_printed_mail_is_deleted_and_spool_cleaned() {
    let harness = TestHarness::new();
    let (mut scheduler, _) = harness.scheduler(true);
    harness.mailbox.deliver(
        SENDER,
        message(
            "m1",
            t0(),
            vec![attachment("a.pdf", b"A"), attachment("b.pdf", b"B")],
        ),
    );

    let report = report(scheduler.run_cycle().await.unwrap());
    assert_eq!((report.fetched, report.printed, report.failed), (2, 2, 0));
    assert_eq!(harness.sink.printed(), vec![b"A".to_vec(), b"B".to_vec()]);
    assert_eq!(harness.mailbox.deletes(), vec!["m1"]);
    assert_eq!(harness.spool_files(), 0);

    // Deleted exactly once: nothing left to fetch.
    harness.clock.advance(Duration::minutes(1));
    scheduler.run_cycle().await.unwrap();
    assert_eq!(harness.mailbox.deletes(), vec!["m1"]);
}

#[tokio::test]
async fn test_forced_reinitialization_once_per_interval() {
    let harness = TestHarness::new();
    let (mut scheduler, factory) = harness.scheduler(true);

    // Cycles at T, T+1h, …, T+11h: only the initial build.
    for _ in 0..12 {
        scheduler.run_cycle().await.unwrap();
        harness.clock.advance(Duration::hours(1));
    }
    assert_eq!(factory.builds(), 1);
    assert_eq!(scheduler.rebuild_count(), 0);

    // T+12h reaches the interval.
    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.rebuild_count(), 1);
    assert_eq!(scheduler.phase(), Phase::Polling);

    // T+13h … T+23h: measured from the rebuild, so no more.
    for _ in 0..11 {
        harness.clock.advance(Duration::hours(1));
        scheduler.run_cycle().await.unwrap();
    }
    assert_eq!(scheduler.rebuild_count(), 1);

    harness.clock.advance(Duration::hours(1));
    scheduler.run_cycle().await.unwrap();
    assert_eq!(scheduler.rebuild_count(), 2);
    assert_eq!(factory.builds(), 3);
}

#[tokio::test]
async fn test_job_failures_do_not_stop_the_cycle() {
    let harness = TestHarness::new();
    let sink = RecordingSink::new(SinkMode::FailOffline);
    let mut scheduler = PollScheduler::new(
        Box::new(harness.factory()),
        Box::new(sink.clone()),
        &harness.state,
        harness.clock.clone(),
        harness.settings(true),
    );
    harness.mailbox.deliver(
        SENDER,
        message(
            "m1",
            t0(),
            vec![attachment("a.pdf", b"OFFLINE a"), attachment("b.pdf", b"B")],
        ),
    );

    let report = report(scheduler.run_cycle().await.unwrap());
    assert_eq!((report.printed, report.failed), (1, 1));
    assert_eq!(sink.printed(), vec![b"B".to_vec()]);
    assert_eq!(harness.state.last_fetch().await, t0());
    assert_eq!(harness.spool_files(), 0);
}

#[tokio::test]
async fn test_printer_misconfiguration_is_fatal() {
    let harness = TestHarness::new();
    let mut scheduler = PollScheduler::new(
        Box::new(harness.factory()),
        Box::new(RecordingSink::new(SinkMode::NoDefaultPrinter)),
        &harness.state,
        harness.clock.clone(),
        harness.settings(false),
    );
    harness.mailbox.deliver(
        SENDER,
        message(
            "m1",
            t0(),
            vec![attachment("a.pdf", b"A"), attachment("b.pdf", b"B")],
        ),
    );

    match scheduler.run_cycle().await {
        Err(MailprintError::Print(PrintError::NoDefaultPrinter { .. })) => {}
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
    assert_eq!(harness.state.last_fetch().await, initial_watermark());
    assert_eq!(harness.spool_files(), 0);
}

#[tokio::test]
async fn test_late_messages_print_once_at_shortest_accepted_interval() {
    let harness = TestHarness::new();
    // The skew is 45 s, so 46 s is the shortest interval a keep-mail config accepts
    let settings = mailprint::scheduler::SchedulerSettings {
        poll_interval: std::time::Duration::from_secs(46),
        ..harness.settings(false)
    };
    let mut scheduler = PollScheduler::new(
        Box::new(harness.factory()),
        Box::new(harness.sink.clone()),
        &harness.state,
        harness.clock.clone(),
        settings,
    );
    let step = Duration::seconds(46);

    scheduler.run_cycle().await.unwrap();
    harness.mailbox.deliver(
        SENDER,
        message("late-1", t0() - Duration::seconds(1), vec![attachment("1.pdf", b"ONE")]),
    );

    for cycle in 1..6 {
        harness.clock.advance(step);
        scheduler.run_cycle().await.unwrap();
        if cycle == 2 {
            // Received just before this cycle started, indexed after it ran
            harness.mailbox.deliver(
                SENDER,
                message(
                    "late-2",
                    t0() + step * 2 - Duration::seconds(1),
                    vec![attachment("2.pdf", b"TWO")],
                ),
            );
        }
    }

    assert_eq!(harness.sink.printed(), vec![b"ONE".to_vec(), b"TWO".to_vec()]);
}

fn token_gated_scheduler<'a>(
    harness: &'a TestHarness,
    expires_in: Duration,
) -> (PollScheduler<'a>, Arc<Credentials>, Arc<FakeIssuer>) {
    let store = TokenStore::new(harness.temp_path().join("token-fake.bin"));
    let key = harness.state.encryption_key();
    let token = Token::new("stored-access", "Bearer")
        .with_refresh_token("stored-refresh")
        .with_expires_at(Utc::now() + expires_in);
    store.save(&key, &token).unwrap();

    let issuer = Arc::new(FakeIssuer::default());
    let credentials = Arc::new(Credentials::new(store, key, issuer.clone()));
    let scheduler = PollScheduler::new(
        Box::new(TokenGatedFactory::new(credentials.clone(), harness.factory())),
        Box::new(harness.sink.clone()),
        &harness.state,
        harness.clock.clone(),
        harness.settings(true),
    );
    (scheduler, credentials, issuer)
}

#[tokio::test]
async fn test_token_endpoint_outage_mid_run_is_retried() {
    let harness = TestHarness::new();
    let (mut scheduler, credentials, issuer) = token_gated_scheduler(&harness, Duration::hours(1));
    scheduler.run_cycle().await.unwrap();
    assert_eq!(harness.state.last_fetch().await, t0());

    harness
        .mailbox
        .deliver(SENDER, message("m1", t0(), vec![attachment("a.pdf", b"A")]));
    credentials.invalidate().await;
    issuer.refresh_offline.store(true, Ordering::SeqCst);

    harness.clock.advance(Duration::minutes(1));
    assert_eq!(
        scheduler.run_cycle().await.unwrap(),
        CycleOutcome::FetchFailed
    );
    assert_eq!(harness.state.last_fetch().await, t0());
    assert!(harness.mailbox.contains("m1"));

    issuer.refresh_offline.store(false, Ordering::SeqCst);
    harness.clock.advance(Duration::minutes(1));
    let report = report(scheduler.run_cycle().await.unwrap());
    assert_eq!(report.printed, 1);
    assert_eq!(report.watermark, t0() + Duration::minutes(2));
    assert_eq!(issuer.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(issuer.grants.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_token_endpoint_outage_at_startup_is_retried() {
    let harness = TestHarness::new();
    let (mut scheduler, _, issuer) = token_gated_scheduler(&harness, -Duration::minutes(5));
    issuer.refresh_offline.store(true, Ordering::SeqCst);

    assert_eq!(
        scheduler.run_cycle().await.unwrap(),
        CycleOutcome::FetchFailed
    );
    assert_eq!(scheduler.phase(), Phase::Init);
    assert_eq!(harness.state.last_fetch().await, initial_watermark());

    issuer.refresh_offline.store(false, Ordering::SeqCst);
    harness.clock.advance(Duration::minutes(1));
    let report = report(scheduler.run_cycle().await.unwrap());
    assert_eq!(report.watermark, t0() + Duration::minutes(1));
    assert_eq!(scheduler.phase(), Phase::Polling);
    assert_eq!(issuer.grants.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rejected_login_is_fatal() {
    let harness = TestHarness::new();
    let (mut scheduler, _) = harness.scheduler(true);
    scheduler.run_cycle().await.unwrap();

    harness.mailbox.set_reject_login(true);
    harness.clock.advance(Duration::minutes(1));
    match scheduler.run_cycle().await {
        Err(MailprintError::Auth(AuthError::Login { reason, .. })) => {
            assert!(reason.contains("AUTHENTICATIONFAILED"))
        }
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
    assert_eq!(harness.state.last_fetch().await, t0());
}

#[tokio::test]
async fn test_run_stops_on_shutdown_and_saves_state() {
    let harness = TestHarness::new();
    let (mut scheduler, _) = harness.scheduler(true);
    let (tx, rx) = watch::channel(false);
    let mailbox = harness.mailbox.clone();

    let stop = async move {
        while mailbox.queries().len() < 3 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();
        tx
    };
    let (result, _tx) = tokio::join!(scheduler.run(rx), stop);
    result.unwrap();

    let cycles = harness.mailbox.queries().len();
    assert!(cycles >= 3);
    let reopened = StateStore::open(harness.state_path()).unwrap();
    let expected = t0() + Duration::seconds(60 * (cycles as i64 - 1));
    assert_eq!(reopened.last_fetch().await, expected);
}

#[tokio::test]
async fn test_run_with_shutdown_already_requested_does_nothing() {
    let harness = TestHarness::new();
    let (mut scheduler, factory) = harness.scheduler(true);
    let (_tx, rx) = watch::channel(true);

    scheduler.run(rx).await.unwrap();
    assert_eq!(factory.builds(), 0);
    assert!(harness.state_path().exists());
}

// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use sailfish_live::live::{LiveUpdateState, StopReason};

#[tokio::test(start_paused = true)]
async fn report_updates_only_on_change() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.set_document(
        "report.json",
        report_manifest(&[("tc-1", 10, false), ("tc-2", 20, true)], false),
    );

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_report();
    settle().await;
    assert_eq!(service.state(), LiveUpdateState::WatchingReport);
    assert_eq!(recorder.observed(), [Observed::ReportUpdated { test_cases: 2 }]);

    // Nothing changed: polls are silent.
    advance_polls(2).await;
    assert_eq!(transport.fetches("report.json"), 3);
    assert_eq!(recorder.observed().len(), 1);

    // A finished test case's hash changing is still silent.
    transport.set_document(
        "report.json",
        report_manifest(&[("tc-1", 11, false), ("tc-2", 20, true)], false),
    );
    advance_polls(1).await;
    assert_eq!(recorder.observed().len(), 1);

    // The live test case's hash changing isn't.
    transport.set_document(
        "report.json",
        report_manifest(&[("tc-1", 11, false), ("tc-2", 21, true)], false),
    );
    advance_polls(1).await;
    assert_eq!(recorder.observed().len(), 2);

    // Neither is a new test case.
    transport.set_document(
        "report.json",
        report_manifest(
            &[("tc-1", 11, false), ("tc-2", 21, false), ("tc-3", 1, true)],
            false,
        ),
    );
    advance_polls(1).await;
    assert_eq!(
        recorder.observed().last(),
        Some(&Observed::ReportUpdated { test_cases: 3 })
    );

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn report_finish_notifies_once_and_stops_polling() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.set_document(
        "report.json",
        report_manifest(&[("tc-1", 10, false), ("tc-2", 20, false)], true),
    );

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_report();
    settle().await;
    assert_eq!(
        recorder.observed(),
        [
            Observed::ReportUpdated { test_cases: 2 },
            Observed::ReportFinished,
        ]
    );
    assert_eq!(service.wait_stopped().await, Some(StopReason::Finished));

    advance_polls(3).await;
    assert_eq!(recorder.count(|o| *o == Observed::ReportFinished), 1);
    assert_eq!(transport.fetches("report.json"), 1);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn finish_detected_after_live_test_case_completes() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    // The report's finish time is set, but a test case is still live.
    transport.set_document(
        "report.json",
        report_manifest(&[("tc-1", 10, true)], true),
    );

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_report();
    advance_polls(1).await;
    assert_eq!(recorder.count(|o| *o == Observed::ReportFinished), 0);
    assert_eq!(service.state(), LiveUpdateState::WatchingReport);

    transport.set_document(
        "report.json",
        report_manifest(&[("tc-1", 11, false)], true),
    );
    advance_polls(1).await;
    // The hash changed as well, so both notifications fire.
    assert_eq!(
        recorder.observed(),
        [
            Observed::ReportUpdated { test_cases: 1 },
            Observed::ReportUpdated { test_cases: 1 },
            Observed::ReportFinished,
        ]
    );
    assert_eq!(service.state(), LiveUpdateState::Stopped(StopReason::Finished));

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connection_error_halts_until_restarted() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.set_document("report.json", report_manifest(&[("tc-1", 10, true)], false));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 0, &[])], false),
    );

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_report();
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(
        service.state(),
        LiveUpdateState::WatchingReportAndTestCase
    );

    transport.fail_next("report.json", 1);
    advance_polls(1).await;
    assert_eq!(recorder.count(|o| *o == Observed::ConnectionError), 1);
    assert_eq!(
        service.wait_stopped().await,
        Some(StopReason::ConnectionError)
    );

    // Neither manifest is polled any more.
    let report_fetches = transport.fetches("report.json");
    let test_case_fetches = transport.fetches("tc-1.json");
    advance_polls(3).await;
    assert_eq!(transport.fetches("report.json"), report_fetches);
    assert_eq!(transport.fetches("tc-1.json"), test_case_fetches);
    assert_eq!(recorder.count(|o| *o == Observed::ConnectionError), 1);

    // Restarting is up to the caller.
    service.start_watching_report();
    settle().await;
    assert_eq!(service.state(), LiveUpdateState::WatchingReport);
    assert_eq!(transport.fetches("report.json"), report_fetches + 1);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopped_report_watch_no_longer_polls() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.set_document("report.json", report_manifest(&[("tc-1", 10, true)], false));

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_report();
    advance_polls(1).await;
    assert_eq!(transport.fetches("report.json"), 2);

    service.stop_watching_report();
    settle().await;
    assert_eq!(service.state(), LiveUpdateState::Idle);

    // Changes made after stopping are neither fetched nor delivered.
    transport.set_document("report.json", report_manifest(&[("tc-1", 11, true)], false));
    advance_polls(3).await;
    assert_eq!(transport.fetches("report.json"), 2);
    assert_eq!(recorder.observed(), [Observed::ReportUpdated { test_cases: 1 }]);

    // Watching again resumes from a fresh poll.
    service.start_watching_report();
    settle().await;
    assert_eq!(transport.fetches("report.json"), 3);
    assert_eq!(service.state(), LiveUpdateState::WatchingReport);

    service.shutdown().await;
    Ok(())
}

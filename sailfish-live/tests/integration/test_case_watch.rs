// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use sailfish_live::{
    live::{LiveUpdateState, StopReason},
    manifest::{FragmentCategory, Ordinal},
};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn full_fetch_then_incremental() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!({ "id": "a1" }));
    transport.append("a/0", 1, json!([{ "id": "a2" }, { "id": "a3" }]));
    transport.append("a/1", 0, json!({ "id": "a4" }));
    transport.append("m/0", 0, json!({ "id": "m1" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(
            1,
            &[
                ("action", 4, &[("a/0", 1), ("a/1", 0)]),
                ("message", 1, &[("m/0", 0)]),
            ],
            false,
        ),
    );

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(service.state(), LiveUpdateState::WatchingTestCase);
    assert_eq!(
        recorder.records(FragmentCategory::Action),
        [(
            Ordinal(1),
            vec![json!("a1"), json!("a2"), json!("a3"), json!("a4")]
        )]
    );
    assert_eq!(
        recorder.records(FragmentCategory::Message),
        [(Ordinal(1), vec![json!("m1")])]
    );

    // An idle poll fetches nothing.
    advance_polls(1).await;
    assert_eq!(transport.fetches("a/0"), 1);
    assert_eq!(
        recorder.count(|o| matches!(o, Observed::TestCaseUpdated { .. })),
        2
    );

    // Only the advanced fragment is fetched, and only its new revisions are
    // delivered.
    transport.append("a/0", 2, json!({ "id": "a5" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(
            1,
            &[
                ("action", 5, &[("a/0", 2), ("a/1", 0)]),
                ("message", 1, &[("m/0", 0)]),
            ],
            false,
        ),
    );
    advance_polls(1).await;
    assert_eq!(transport.fetches("a/0"), 2);
    assert_eq!(transport.fetches("a/1"), 1);
    assert_eq!(transport.fetches("m/0"), 1);
    assert_eq!(
        recorder.records(FragmentCategory::Action).last(),
        Some(&(Ordinal(1), vec![json!("a5")]))
    );

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn overlapping_polls_fetch_each_path_once() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!({ "id": "a1" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 1, &[("a/0", 0)])], false),
    );
    transport.close_gate("a/0");

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(transport.fetches("a/0"), 1);

    // The manifest advances twice while the first fetch is held.
    transport.append("a/0", 1, json!({ "id": "a2" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 2, &[("a/0", 1)])], false),
    );
    advance_polls(1).await;
    transport.append("a/0", 2, json!({ "id": "a3" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 3, &[("a/0", 2)])], false),
    );
    advance_polls(1).await;
    assert_eq!(
        recorder.count(|o| matches!(o, Observed::TestCaseUpdated { .. })),
        3
    );
    assert_eq!(transport.fetches("a/0"), 1);
    assert!(recorder.records(FragmentCategory::Action).is_empty());

    // Once released, the backlog drains without waiting for another poll.
    transport.open_gate("a/0");
    settle().await;
    assert_eq!(transport.fetches("a/0"), 2);
    assert_eq!(
        recorder.records(FragmentCategory::Action),
        [
            (Ordinal(1), vec![json!("a1")]),
            (Ordinal(1), vec![json!("a2"), json!("a3")]),
        ]
    );

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stale_session_results_are_discarded() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    for revision in 0..=5 {
        transport.append("tc1/a/0", revision, json!({ "id": format!("tc1-{revision}") }));
    }
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 6, &[("tc1/a/0", 5)])], false),
    );
    transport.append("tc2/a/0", 0, json!({ "id": "tc2-0" }));
    transport.set_document(
        "tc-2.json",
        test_case_manifest(2, &[("action", 1, &[("tc2/a/0", 0)])], false),
    );
    transport.close_gate("tc1/a/0");

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(transport.fetches("tc1/a/0"), 1);

    // Navigate away while test case 1's fetch is held, then release it.
    service.start_watching_test_case("tc-2.json");
    settle().await;
    transport.open_gate("tc1/a/0");
    advance_polls(2).await;

    let ordinals: Vec<_> = recorder
        .records(FragmentCategory::Action)
        .into_iter()
        .map(|(ordinal, _)| ordinal)
        .collect();
    assert_eq!(ordinals, [Ordinal(2)]);
    // The cancelled fetch isn't retried.
    assert_eq!(transport.fetches("tc1/a/0"), 1);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rewatching_same_test_case_starts_over() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!({ "id": "a1" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 1, &[("a/0", 0)])], false),
    );
    transport.close_gate("a/0");

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    settle().await;
    service.start_watching_test_case("tc-1.json");
    settle().await;
    transport.open_gate("a/0");
    settle().await;

    // Only the second watch's full fetch is delivered.
    assert_eq!(transport.fetches("a/0"), 2);
    assert_eq!(
        recorder.records(FragmentCategory::Action),
        [(Ordinal(1), vec![json!("a1")])]
    );

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn completed_test_case_stops_polling() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.set_document("report.json", report_manifest(&[("tc-1", 10, false)], true));
    transport.append("a/0", 0, json!([{ "id": 1 }, { "id": 2 }]));
    transport.append("m/0", 0, json!({ "id": 3 }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(
            1,
            &[
                ("action", 2, &[("a/0", 0)]),
                ("message", 1, &[("m/0", 0)]),
            ],
            true,
        ),
    );

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_report();
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(service.wait_stopped().await, Some(StopReason::Finished));
    assert_eq!(transport.fetches("tc-1.json"), 1);

    advance_polls(3).await;
    assert_eq!(transport.fetches("tc-1.json"), 1);
    assert_eq!(transport.fetches("report.json"), 1);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn finished_test_case_polls_until_counts_match() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!({ "id": 1 }));
    // The manifest advertises a record the fragment doesn't hold yet.
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 2, &[("a/0", 0)])], true),
    );

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    advance_polls(2).await;
    assert_eq!(service.state(), LiveUpdateState::WatchingTestCase);
    assert_eq!(transport.fetches("tc-1.json"), 3);

    transport.append("a/0", 1, json!({ "id": 2 }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 2, &[("a/0", 1)])], true),
    );
    advance_polls(1).await;
    assert_eq!(
        service.state(),
        LiveUpdateState::Stopped(StopReason::Finished)
    );

    advance_polls(2).await;
    assert_eq!(transport.fetches("tc-1.json"), 4);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn logs_are_fetched_once_opted_in() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!({ "id": "a1" }));
    transport.append("l/0", 0, json!([{ "id": "l1" }, { "id": "l2" }]));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(
            1,
            &[("action", 1, &[("a/0", 0)]), ("logentry", 2, &[("l/0", 0)])],
            false,
        ),
    );

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(transport.fetches("l/0"), 0);
    assert!(recorder.records(FragmentCategory::LogEntry).is_empty());

    // Opting in fetches the logs from the beginning, without waiting for a
    // poll and without refetching anything else.
    service.start_watching_logs();
    settle().await;
    assert_eq!(transport.fetches("l/0"), 1);
    assert_eq!(transport.fetches("a/0"), 1);
    assert_eq!(
        recorder.records(FragmentCategory::LogEntry),
        [(Ordinal(1), vec![json!("l1"), json!("l2")])]
    );

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn fragment_retry_then_success() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!({ "id": "a1" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 1, &[("a/0", 0)])], false),
    );
    transport.fail_next("a/0", 1);

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(transport.fetches("a/0"), 2);
    assert_eq!(
        recorder.records(FragmentCategory::Action),
        [(Ordinal(1), vec![json!("a1")])]
    );
    assert_eq!(recorder.count(|o| *o == Observed::ConnectionError), 0);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn fragment_retry_exhaustion_is_a_connection_error() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!({ "id": "a1" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 1, &[("a/0", 0)])], false),
    );
    transport.fail_next("a/0", 2);

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(transport.fetches("a/0"), 2);
    assert!(recorder.records(FragmentCategory::Action).is_empty());
    assert_eq!(recorder.count(|o| *o == Observed::ConnectionError), 1);
    assert_eq!(
        service.state(),
        LiveUpdateState::Stopped(StopReason::ConnectionError)
    );

    advance_polls(2).await;
    assert_eq!(transport.fetches("tc-1.json"), 1);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopping_test_case_watch_cancels_fetches() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!({ "id": "a1" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 1, &[("a/0", 0)])], false),
    );
    transport.close_gate("a/0");

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(transport.fetches("a/0"), 1);

    service.stop_watching_test_case();
    settle().await;
    assert_eq!(service.state(), LiveUpdateState::Idle);

    // The held fetch completing after the stop delivers nothing, and the
    // manifest is no longer polled.
    transport.open_gate("a/0");
    advance_polls(3).await;
    assert!(recorder.records(FragmentCategory::Action).is_empty());
    assert_eq!(
        recorder.count(|o| matches!(o, Observed::TestCaseUpdated { .. })),
        1
    );
    assert_eq!(transport.fetches("tc-1.json"), 1);
    assert_eq!(transport.fetches("a/0"), 1);

    // Watching again starts over with a full fetch.
    service.start_watching_test_case("tc-1.json");
    settle().await;
    assert_eq!(transport.fetches("a/0"), 2);
    assert_eq!(
        recorder.records(FragmentCategory::Action),
        [(Ordinal(1), vec![json!("a1")])]
    );

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_test_case_poll_is_a_connection_error() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!({ "id": "a1" }));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 1, &[("a/0", 0)])], false),
    );
    transport.fail_next("tc-1.json", 1);

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    assert_eq!(
        service.wait_stopped().await,
        Some(StopReason::ConnectionError)
    );
    assert_eq!(recorder.observed(), [Observed::ConnectionError]);

    // Manifest polls aren't retried.
    advance_polls(3).await;
    assert_eq!(transport.fetches("tc-1.json"), 1);
    assert_eq!(transport.fetches("a/0"), 0);
    assert_eq!(
        service.state(),
        LiveUpdateState::Stopped(StopReason::ConnectionError)
    );

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn loaded_test_case_without_report_finishes() -> Result<()> {
    test_init();
    let transport = ScriptedTransport::new();
    let recorder = Recorder::new();
    transport.append("a/0", 0, json!([{ "id": "a1" }, { "id": "a2" }]));
    transport.set_document(
        "tc-1.json",
        test_case_manifest(1, &[("action", 2, &[("a/0", 0)])], true),
    );

    let service = spawn_service(&transport, &recorder)?;
    service.start_watching_test_case("tc-1.json");
    assert_eq!(service.wait_stopped().await, Some(StopReason::Finished));
    assert_eq!(
        recorder.records(FragmentCategory::Action),
        [(Ordinal(1), vec![json!("a1"), json!("a2")])]
    );

    advance_polls(2).await;
    assert_eq!(transport.fetches("tc-1.json"), 1);

    // Stopping the finished watch leaves nothing watched.
    service.stop_watching_test_case();
    settle().await;
    assert_eq!(service.state(), LiveUpdateState::Idle);

    service.shutdown().await;
    Ok(())
}

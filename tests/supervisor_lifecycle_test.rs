//! Group start/stop behaviour of the recorder supervisor.
//!
//! All timing runs on Tokio's paused clock, so intervals of seconds complete
//! instantly and deterministically.

use daq_recorder::error::RecorderError;
use daq_recorder::recorder::{RecorderState, RecorderTask};
use daq_recorder::sink::memory::MemorySink;
use daq_recorder::supervisor::RecorderSupervisor;
use daq_recorder::transport::mock::{MockConnector, FS740_IDENTITY};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_test::{assert_err, assert_ok};

fn task(id: &str, table: &str, interval_secs: u64) -> RecorderTask {
    assert_ok!(RecorderTask::fs740_frequency(
        id,
        table,
        Duration::from_secs(interval_secs)
    ))
}

fn states(supervisor: &RecorderSupervisor) -> Vec<RecorderState> {
    supervisor.status().iter().map(|s| s.status.state).collect()
}

#[tokio::test(start_paused = true)]
async fn test_two_devices_record_on_independent_intervals() {
    let sink = Arc::new(MemorySink::new());
    let fast = MockConnector::fs740("10.0.0.5:5025", "1.0000000001E+07");
    let slow = MockConnector::fs740("10.0.0.6:5025", "5.0000000002E+06");

    let mut supervisor = RecorderSupervisor::new(sink.clone());
    assert_ok!(supervisor.add_device(task("fast", "clock_fast", 1), Arc::new(fast.clone())));
    assert_ok!(supervisor.add_device(task("slow", "clock_slow", 2), Arc::new(slow.clone())));

    assert_ok!(supervisor.start().await);
    assert!(supervisor.is_running());
    assert_eq!(states(&supervisor), vec![RecorderState::Polling; 2]);

    sleep(Duration::from_millis(4500)).await;
    assert_ok!(supervisor.stop().await);

    let fast_records = sink.records_for("clock_fast").await;
    let slow_records = sink.records_for("clock_slow").await;
    assert_eq!(fast_records.len(), 5);
    assert!((2..=3).contains(&slow_records.len()), "{}", slow_records.len());

    for record in sink.records().await {
        assert!(!record.table.is_empty());
        assert!(record.fields.contains_key("frequency"));
    }
    assert_eq!(fast_records[0].fields["frequency"], 1.0000000001e7);

    assert_eq!(states(&supervisor), vec![RecorderState::Stopped; 2]);
    for connector in [&fast, &slow] {
        assert_eq!(connector.open_sessions(), 0);
        assert_eq!(connector.max_open_sessions(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_identity_mismatch_blocks_whole_fleet() {
    let sink = Arc::new(MemorySink::new());
    let good = MockConnector::fs740("good", "1.0E+07");
    let wrong = MockConnector::new("wrong", |request| {
        Ok(if request == "*IDN?" {
            "Stanford Research Systems,SR620,s/n000042,ver1.00".to_string()
        } else {
            "1.0E+07".to_string()
        })
    });

    let mut supervisor = RecorderSupervisor::new(sink.clone());
    assert_ok!(supervisor.add_device(task("good", "good", 1), Arc::new(good.clone())));
    assert_ok!(supervisor.add_device(task("wrong", "wrong", 1), Arc::new(wrong.clone())));

    let err = assert_err!(supervisor.start().await);
    match &err {
        RecorderError::PreflightFailed(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].device, "wrong");
            assert!(matches!(
                failures[0].error,
                RecorderError::IdentityMismatch { .. }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!supervisor.is_running());
    assert_eq!(
        states(&supervisor),
        vec![RecorderState::Idle, RecorderState::Faulted]
    );
    assert!(supervisor.status()[1].status.last_error.is_some());

    sleep(Duration::from_secs(3)).await;
    assert!(sink.is_empty().await);
    assert_eq!(good.opens(), 1);
    assert_eq!(wrong.opens(), 1);
    assert_eq!(wrong.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_faulted_device_is_retried_on_next_start() {
    let sink = Arc::new(MemorySink::new());
    let swapped = Arc::new(AtomicBool::new(false));
    let flag = swapped.clone();
    let connector = MockConnector::new("bench", move |request| {
        Ok(match request {
            "*IDN?" if flag.load(Ordering::SeqCst) => FS740_IDENTITY.to_string(),
            "*IDN?" => "Stanford Research Systems,FS725,s/n000007,ver1.00".to_string(),
            _ => "1.0E+07".to_string(),
        })
    });

    let mut supervisor = RecorderSupervisor::new(sink.clone());
    assert_ok!(supervisor.add_device(task("bench", "bench", 1), Arc::new(connector)));

    assert_err!(supervisor.start().await);
    assert_eq!(states(&supervisor), vec![RecorderState::Faulted]);

    swapped.store(true, Ordering::SeqCst);
    assert_ok!(supervisor.start().await);
    sleep(Duration::from_millis(1500)).await;
    assert_ok!(supervisor.stop().await);
    assert_eq!(sink.records_for("bench").await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_sink_starts_nothing() {
    let sink = Arc::new(MemorySink::new());
    sink.set_reachable(false);
    let connector = MockConnector::fs740("clock", "1.0E+07");

    let mut supervisor = RecorderSupervisor::new(sink.clone());
    assert_ok!(supervisor.add_device(task("clock", "clock", 1), Arc::new(connector.clone())));

    assert!(matches!(
        supervisor.start().await,
        Err(RecorderError::SinkUnavailable(_))
    ));
    assert_eq!(connector.opens(), 0);
    assert_eq!(states(&supervisor), vec![RecorderState::Idle]);
    assert!(!supervisor.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_is_rejected() {
    let sink = Arc::new(MemorySink::new());
    let mut supervisor = RecorderSupervisor::new(sink);
    assert_ok!(supervisor.add_device(
        task("clock", "clock", 1),
        Arc::new(MockConnector::fs740("clock", "1.0E+07"))
    ));

    assert_ok!(supervisor.start().await);
    assert!(matches!(
        supervisor.start().await,
        Err(RecorderError::AlreadyRunning)
    ));
    assert!(matches!(
        supervisor.check().await,
        Err(RecorderError::AlreadyRunning)
    ));
    assert_ok!(supervisor.stop().await);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_cycle_within_one_interval() {
    let sink = Arc::new(MemorySink::new());
    let connector =
        MockConnector::fs740("slow-reply", "1.0E+07").with_latency(Duration::from_millis(300));

    let mut supervisor = RecorderSupervisor::new(sink.clone());
    assert_ok!(supervisor.add_device(task("clock", "clock", 1), Arc::new(connector.clone())));
    assert_ok!(supervisor.start().await);

    // Pre-flight took 0.3s, so cycle three starts at t=2.3s and is still
    // waiting for its reply at t=2.45s.
    sleep(Duration::from_millis(2150)).await;
    let requested = Instant::now();
    assert_ok!(supervisor.stop().await);
    let waited = requested.elapsed();

    assert!(waited <= Duration::from_secs(1), "stop took {:?}", waited);
    assert_eq!(sink.records_for("clock").await.len(), 3);
    assert_eq!(connector.open_sessions(), 0);
    assert_eq!(states(&supervisor), vec![RecorderState::Stopped]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop() {
    let sink = Arc::new(MemorySink::new());
    let connector = MockConnector::fs740("clock", "1.0E+07");
    let mut supervisor = RecorderSupervisor::new(sink.clone());
    assert_ok!(supervisor.add_device(task("clock", "clock", 1), Arc::new(connector.clone())));

    assert_ok!(supervisor.start().await);
    sleep(Duration::from_millis(500)).await;
    assert_ok!(supervisor.stop().await);
    assert_eq!(sink.len().await, 1);

    assert_ok!(supervisor.start().await);
    sleep(Duration::from_millis(500)).await;
    assert_ok!(supervisor.stop().await);
    assert_eq!(sink.len().await, 2);

    let status = &supervisor.status()[0].status;
    assert_eq!(status.state, RecorderState::Stopped);
    assert_eq!(status.cycles, 2);
    assert_eq!(status.records_published, 2);
    // Two pre-flights plus two poll cycles.
    assert_eq!(connector.opens(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_device_is_skipped_and_can_join_later() {
    let sink = Arc::new(MemorySink::new());
    let first = MockConnector::fs740("first", "1.0E+07");
    let second = MockConnector::fs740("second", "2.0E+07");

    let mut supervisor = RecorderSupervisor::new(sink.clone());
    assert_ok!(supervisor.add_device(task("first", "first", 1), Arc::new(first)));
    let mut later = task("second", "second", 1);
    later.enabled = false;
    assert_ok!(supervisor.add_device(later, Arc::new(second.clone())));

    assert_ok!(supervisor.start().await);
    assert_eq!(second.opens(), 0);
    assert_eq!(
        states(&supervisor),
        vec![RecorderState::Polling, RecorderState::Idle]
    );

    sleep(Duration::from_millis(1500)).await;
    assert_ok!(supervisor.set_enabled("second", true).await);
    assert_eq!(supervisor.status()[1].status.state, RecorderState::Polling);

    sleep(Duration::from_millis(1200)).await;
    assert_ok!(supervisor.set_enabled("first", false).await);
    assert_eq!(supervisor.status()[0].status.state, RecorderState::Stopped);

    assert_ok!(supervisor.stop().await);
    assert_eq!(sink.records_for("first").await.len(), 3);
    assert_eq!(sink.records_for("second").await.len(), 2);
    assert_eq!(
        states(&supervisor),
        vec![RecorderState::Stopped, RecorderState::Stopped]
    );
}

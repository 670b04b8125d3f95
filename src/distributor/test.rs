use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use tokio::sync::mpsc;

use crate::{
    error::ErrorKind,
    event::DisconnectCause,
    table::Table,
    test_util::{mock_distributor, ListenerEvent, MockReactor, RecordingListener, MOCK_CLUSTER},
    wire::{ClusterIdentity, ConnectInfo, Invocation, Response, ResponseStatus, HEARTBEAT_HANDLE, HEARTBEAT_PROCEDURE},
    Distributor,
    DistributorOptions,
    Value,
};

fn collecting_callback(
    sender: &mpsc::UnboundedSender<Response>,
) -> impl FnOnce(Response) + Send + 'static {
    let sender = sender.clone();
    move |response| {
        let _ = sender.send(response);
    }
}

fn submit(distributor: &Distributor, handle: i64, sender: &mpsc::UnboundedSender<Response>) {
    let accepted = distributor
        .queue(
            Invocation::new(handle, "Echo", vec![Value::BigInt(handle)]),
            collecting_callback(sender),
            false,
        )
        .unwrap();
    assert!(accepted);
}

fn drain_channel(receiver: &mut mpsc::UnboundedReceiver<Response>) -> Vec<Response> {
    let mut responses = Vec::new();
    while let Ok(response) = receiver.try_recv() {
        responses.push(response);
    }
    responses
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn response_reaches_the_callback_exactly_once() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 1).await;
    mock.set_auto_respond(true);

    let (tx, mut rx) = mpsc::unbounded_channel();
    submit(&distributor, 7, &tx);

    let response = rx.recv().await.unwrap();
    assert_eq!(response.client_handle(), 7);
    assert_eq!(response.status(), ResponseStatus::Success);

    distributor.drain().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(distributor.connections()[0].outstanding, 0);
}

#[tokio::test(start_paused = true)]
async fn empty_pool_fails_with_no_connections() {
    let (distributor, _mock) = mock_distributor(DistributorOptions::default(), 0).await;
    let err = distributor
        .queue(Invocation::new(1, "Echo", vec![]), |_| {}, false)
        .unwrap_err();
    assert!(err.is_no_connections());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_handle_is_rejected() {
    let (distributor, _mock) = mock_distributor(DistributorOptions::default(), 1).await;
    let err = distributor
        .queue(Invocation::new(HEARTBEAT_HANDLE, "Echo", vec![]), |_| {}, false)
        .unwrap_err();
    assert!(matches!(
        err.kind.as_ref(),
        ErrorKind::InvalidArgument { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn round_robin_spreads_submissions_evenly() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 3).await;
    let (tx, _rx) = mpsc::unbounded_channel();

    for handle in 0..6 {
        submit(&distributor, handle, &tx);
    }
    mock.wait_for_sent(6).await;
    for i in 0..3 {
        assert_eq!(mock.connection(i).sent_count(), 2, "connection {}", i);
    }

    // Mark the middle connection as backpressured: the cursor still advances
    // once per attempt, so the next three submissions land A, C, A.
    distributor.inner.pool.lock().unwrap().connections[1].set_backpressure_for_test(true);
    for handle in 6..9 {
        submit(&distributor, handle, &tx);
    }
    mock.wait_for_sent(9).await;
    let handles_on = |index: usize| -> Vec<i64> {
        mock.connection(index)
            .sent_invocations()
            .iter()
            .map(|i| i.client_handle())
            .collect()
    };
    // 6 hit A, 7 skipped B onto C, 8 landed back on A.
    assert_eq!(handles_on(0), vec![0, 3, 6, 8]);
    assert_eq!(handles_on(1), vec![1, 4]);
    assert_eq!(handles_on(2), vec![2, 5, 7]);
}

#[tokio::test(start_paused = true)]
async fn backpressure_stops_dispatch_and_clears_once() {
    let options = DistributorOptions::builder()
        .backpressure_high_water(100_usize)
        .build();
    let (distributor, mock) = mock_distributor(options, 1).await;
    let listener = RecordingListener::new();
    distributor.add_listener(listener.clone());
    mock.set_hold_writes(true);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let padding = "x".repeat(60);
    let mut accepted = 0;
    let mut handle = 0;
    loop {
        let queued = distributor
            .queue(
                Invocation::new(handle, "Pad", vec![Value::Str(padding.clone())]),
                collecting_callback(&tx),
                false,
            )
            .unwrap();
        if !queued {
            break;
        }
        accepted += 1;
        handle += 1;
    }
    assert!(accepted >= 2);
    assert!(listener.count(|e| *e == ListenerEvent::Backpressure(true)) >= 1);
    assert_eq!(listener.count(|e| *e == ListenerEvent::Backpressure(false)), 0);

    // `ignore_backpressure` pushes through anyway.
    assert!(distributor
        .queue(
            Invocation::new(handle, "Pad", vec![Value::Str(padding.clone())]),
            collecting_callback(&tx),
            true,
        )
        .unwrap());
    accepted += 1;

    // Let the write queue drain; the off notification fires exactly once.
    let connection = mock.connection(0);
    wait_until(|| connection.held_count() == accepted).await;
    connection.release_held();
    assert_eq!(listener.count(|e| *e == ListenerEvent::Backpressure(false)), 1);

    // Dispatch works again.
    assert!(distributor
        .queue(
            Invocation::new(handle + 1, "Pad", vec![]),
            collecting_callback(&tx),
            false,
        )
        .unwrap());
    assert!(drain_channel(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_cluster_identity_is_rejected() {
    let mock = MockReactor::new();
    let distributor = Distributor::with_reactor(DistributorOptions::default(), mock.clone());
    let listener = RecordingListener::new();
    distributor.add_listener(listener.clone());

    mock.script_connect(ConnectInfo {
        host_id: 0,
        connection_id: 1,
        cluster: MOCK_CLUSTER,
        build_string: "v9.1".to_string(),
    });
    mock.script_connect(ConnectInfo {
        host_id: 1,
        connection_id: 2,
        cluster: ClusterIdentity {
            timestamp: 1_000,
            leader_address: 0xCCDD,
        },
        build_string: "v9.1".to_string(),
    });

    let digest = crate::hash_password("pw");
    distributor
        .create_connection("db-a", "ops", &digest, 21212)
        .await
        .unwrap();
    let err = distributor
        .create_connection("db-b", "ops", &digest, 21212)
        .await
        .unwrap_err();
    assert!(err.is_cluster_identity_mismatch());

    assert_eq!(distributor.connections().len(), 1);
    assert_eq!(distributor.connections()[0].connection_id, 1);
    assert_eq!(mock.connection(0).info.connection_id, 1);
    assert_eq!(distributor.instance_id(), Some(MOCK_CLUSTER));
    assert_eq!(distributor.build_string().as_deref(), Some("v9.1"));
    // The rejected connection never joined the pool, so its teardown is not
    // a connection-loss event.
    assert_eq!(mock.connection_count(), 2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(listener
        .events()
        .iter()
        .all(|e| !matches!(e, ListenerEvent::ConnectionLost { .. })));
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_late_response_is_reported() {
    let options = DistributorOptions::builder()
        .procedure_call_timeout(Duration::from_millis(50))
        .connection_response_timeout(Duration::from_secs(10))
        .build();
    let (distributor, mock) = mock_distributor(options, 1).await;
    let listener = RecordingListener::new();
    distributor.add_listener(listener.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    submit(&distributor, 42, &tx);

    // The reaper's next 1 Hz tick finds the deadline elapsed.
    let response = rx.recv().await.unwrap();
    assert_eq!(response.client_handle(), 42);
    assert_eq!(response.status(), ResponseStatus::ConnectionTimeout);
    let status_string = response.status_string().unwrap();
    assert!(status_string.contains("50 ms"), "got: {}", status_string);
    assert_eq!(
        response.client_round_trip(),
        response.cluster_round_trip(),
        "synthesized responses carry the elapsed time in both round trips"
    );

    distributor.drain().await;

    // The server answering afterwards is a late response: reported to
    // listeners, callback not invoked again.
    mock.connection(0).respond_success(42);
    assert_eq!(listener.count(|e| *e == ListenerEvent::LateResponse(42)), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn idle_connection_is_probed_and_closed_on_silence() {
    let options = DistributorOptions::builder()
        .connection_response_timeout(Duration::from_millis(2_990))
        .build();
    let (distributor, mock) = mock_distributor(options, 1).await;
    let listener = RecordingListener::new();
    distributor.add_listener(listener.clone());

    // Idle past a third of the response timeout: a heartbeat goes out under
    // the reserved handle, with no bookkeeping entry behind it.
    mock.wait_for_sent(1).await;
    let heartbeat = &mock.connection(0).sent_invocations()[0];
    assert_eq!(heartbeat.client_handle(), HEARTBEAT_HANDLE);
    assert_eq!(heartbeat.procedure(), HEARTBEAT_PROCEDURE);
    assert_eq!(distributor.connections()[0].outstanding, 0);

    // Still silent: the heartbeat goes unanswered past the full timeout and
    // the connection is closed with cause Timeout.
    wait_until(|| !listener.events().is_empty()).await;
    assert_eq!(
        listener.events(),
        vec![ListenerEvent::ConnectionLost {
            hostname: "node".to_string(),
            port: 21212,
            remaining: 0,
            cause: DisconnectCause::Timeout,
        }]
    );
    assert!(distributor.connections().is_empty());
}

#[tokio::test(start_paused = true)]
async fn answered_heartbeat_keeps_the_connection_alive() {
    let options = DistributorOptions::builder()
        .connection_response_timeout(Duration::from_millis(2_990))
        .build();
    let (distributor, mock) = mock_distributor(options, 1).await;
    let listener = RecordingListener::new();
    distributor.add_listener(listener.clone());

    mock.wait_for_sent(1).await;
    mock.connection(0).respond_heartbeat();

    // Quiet again: the next probe goes out instead of a close, and the
    // heartbeat reply was not mistaken for a late procedure response.
    mock.wait_for_sent(2).await;
    assert_eq!(distributor.connections().len(), 1);
    assert!(listener.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connection_loss_completes_every_outstanding_call() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 1).await;
    let listener = RecordingListener::new();
    distributor.add_listener(listener.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    for handle in 0..3 {
        submit(&distributor, handle, &tx);
    }
    mock.wait_for_sent(3).await;

    mock.connection(0).close();
    wait_until(|| distributor.connections().is_empty()).await;

    let mut responses = Vec::new();
    for _ in 0..3 {
        responses.push(rx.recv().await.unwrap());
    }
    assert!(drain_channel(&mut rx).is_empty());
    let mut handles: Vec<i64> = responses.iter().map(|r| r.client_handle()).collect();
    handles.sort_unstable();
    assert_eq!(handles, vec![0, 1, 2]);
    assert!(responses
        .iter()
        .all(|r| r.status() == ResponseStatus::ConnectionLost));
    assert_eq!(
        listener.count(|e| matches!(e, ListenerEvent::ConnectionLost { cause: DisconnectCause::Closed, .. })),
        1
    );

    // The reactor also drops the dead connection's I/O entry; only the
    // GLOBAL aggregate row remains.
    use crate::reactor::{Reactor as _, GLOBAL_CONNECTION_ID};
    wait_until(|| mock.io_stats(false).len() == 1).await;
    assert!(mock.io_stats(false).contains_key(&GLOBAL_CONNECTION_ID));

    // Later submissions fail fast: the pool is empty.
    let err = distributor
        .queue(Invocation::new(9, "Echo", vec![]), |_| {}, false)
        .unwrap_err();
    assert!(err.is_no_connections());
}

#[tokio::test(start_paused = true)]
async fn drain_waits_for_every_callback() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 2).await;
    mock.set_auto_respond(true);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for handle in 0..100 {
        submit(&distributor, handle, &tx);
    }
    distributor.drain().await;

    let responses = drain_channel(&mut rx);
    assert_eq!(responses.len(), 100);
    let mut handles: Vec<i64> = responses.iter().map(|r| r.client_handle()).collect();
    handles.sort_unstable();
    assert_eq!(handles, (0..100).collect::<Vec<i64>>());
    assert!(distributor.connections().iter().all(|c| c.outstanding == 0));
}

#[tokio::test(start_paused = true)]
async fn callback_panic_is_contained_and_reported() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 1).await;
    mock.set_auto_respond(true);
    let listener = RecordingListener::new();
    distributor.add_listener(listener.clone());

    let accepted = distributor
        .queue(
            Invocation::new(13, "Echo", vec![]),
            |_| panic!("embedder bug"),
            false,
        )
        .unwrap();
    assert!(accepted);

    distributor.drain().await;
    assert_eq!(
        listener.count(|e| *e == ListenerEvent::UncaughtException(13)),
        1
    );

    // The transport survives: the next call completes normally.
    let (tx, mut rx) = mpsc::unbounded_channel();
    submit(&distributor, 14, &tx);
    let response = rx.recv().await.unwrap();
    assert_eq!(response.status(), ResponseStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn listener_registration_is_idempotent() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 1).await;
    let listener = RecordingListener::new();
    distributor.add_listener(listener.clone());
    distributor.add_listener(listener.clone());

    mock.connection(0).close();
    wait_until(|| !listener.events().is_empty()).await;
    assert_eq!(
        listener.count(|e| matches!(e, ListenerEvent::ConnectionLost { .. })),
        1
    );

    let removable: Arc<dyn crate::event::StatusListener> = listener.clone();
    distributor.remove_listener(&removable);
    distributor.remove_listener(&removable);
}

fn completed(table: &Table, row: usize) -> i64 {
    table
        .get_by_name(row, "INVOCATIONS_COMPLETED")
        .unwrap()
        .as_bigint()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn interval_deltas_agree_across_views() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 2).await;
    mock.set_auto_respond(true);

    let (tx, _rx) = mpsc::unbounded_channel();
    for handle in 0..10 {
        let accepted = distributor
            .queue(
                Invocation::new(handle, if handle % 2 == 0 { "Alpha" } else { "Beta" }, vec![]),
                collecting_callback(&tx),
                false,
            )
            .unwrap();
        assert!(accepted);
    }
    distributor.drain().await;

    let connection_table = distributor.connection_stats(true);
    let per_connection: i64 = (0..connection_table.row_count() - 1)
        .map(|row| completed(&connection_table, row))
        .sum();
    let global_row = connection_table.row_count() - 1;
    assert_eq!(per_connection, 10);
    assert_eq!(completed(&connection_table, global_row), 10);
    assert_eq!(
        connection_table
            .get_by_name(global_row, "CONNECTION_ID")
            .unwrap()
            .as_bigint(),
        Some(-1)
    );

    let procedure_table = distributor.procedure_stats(true);
    let per_procedure: i64 = (0..procedure_table.row_count())
        .map(|row| completed(&procedure_table, row))
        .sum();
    assert_eq!(per_procedure, 10);

    // Nothing ran since: the next interval window is empty, and zero-count
    // procedure rows are skipped entirely.
    assert_eq!(distributor.procedure_stats(true).row_count(), 0);
    let quiet = distributor.connection_stats(true);
    let quiet_sum: i64 = (0..quiet.row_count()).map(|row| completed(&quiet, row)).sum();
    assert_eq!(quiet_sum, 0);

    // The cumulative view is unaffected by interval resets.
    let cumulative = distributor.procedure_stats(false);
    let cumulative_sum: i64 = (0..cumulative.row_count())
        .map(|row| completed(&cumulative, row))
        .sum();
    assert_eq!(cumulative_sum, 10);
}

#[tokio::test(start_paused = true)]
async fn latency_histogram_accounts_every_completion() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 1).await;
    mock.set_auto_respond(true);

    let (tx, _rx) = mpsc::unbounded_channel();
    for handle in 0..5 {
        submit(&distributor, handle, &tx);
    }
    distributor.drain().await;

    let table = distributor.latency_histogram(true, false);
    assert_eq!(table.row_count(), 1);
    let bucket_sum: i64 = (0..20)
        .map(|i| {
            table
                .get_by_name(0, &format!("BUCKET_{}", i))
                .unwrap()
                .as_bigint()
                .unwrap()
        })
        .sum();
    assert_eq!(bucket_sum, 5);
}

#[derive(Default)]
struct CountingSink {
    connection_batches: std::sync::atomic::AtomicUsize,
    procedure_batches: std::sync::atomic::AtomicUsize,
}

impl crate::StatsSink for CountingSink {
    fn connection_stats(&self, _table: Table) {
        self.connection_batches
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn procedure_stats(&self, _table: Table) {
        self.procedure_batches
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn stats_loader_polls_until_shutdown() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 1).await;
    mock.set_auto_respond(true);

    let sink = Arc::new(CountingSink::default());
    distributor
        .start_stats_loader(sink.clone(), Duration::from_millis(250))
        .unwrap();
    assert!(distributor
        .start_stats_loader(sink.clone(), Duration::from_millis(250))
        .is_err());

    let (tx, mut rx) = mpsc::unbounded_channel();
    submit(&distributor, 1, &tx);
    rx.recv().await.unwrap();
    wait_until(|| {
        sink.connection_batches
            .load(std::sync::atomic::Ordering::SeqCst)
            >= 1
            && sink
                .procedure_batches
                .load(std::sync::atomic::Ordering::SeqCst)
                >= 1
    })
    .await;

    distributor.shutdown().await;
    let frozen = sink
        .connection_batches
        .load(std::sync::atomic::Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        sink.connection_batches
            .load(std::sync::atomic::Ordering::SeqCst),
        frozen
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callbacks_fire_exactly_once_across_connection_loss() {
    let (distributor, mock) = mock_distributor(DistributorOptions::default(), 2).await;
    mock.set_auto_respond(true);

    let total: i64 = 400;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let submitter = {
        let distributor = distributor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            for handle in 0..total {
                let tx = tx.clone();
                let accepted = distributor
                    .queue(
                        Invocation::new(handle, "Echo", vec![]),
                        move |response| {
                            let _ = tx.send(response);
                        },
                        true,
                    )
                    .unwrap();
                assert!(accepted);
                tokio::task::yield_now().await;
            }
        })
    };
    drop(tx);

    // Take one connection down mid-stream: its in-flight calls complete with
    // ConnectionLost while dispatch keeps flowing to the survivor. This also
    // exercises both compound lock paths concurrently (queue: pool lock
    // alone; stopping: connection lock, then pool lock inside it).
    tokio::time::sleep(Duration::from_millis(2)).await;
    mock.connection(0).close();
    submitter.await.unwrap();
    distributor.drain().await;

    // Every callback owns a sender clone, so the channel closes once each
    // accepted invocation has been completed exactly once.
    let mut seen: HashMap<i64, u32> = HashMap::new();
    while let Some(response) = rx.recv().await {
        *seen.entry(response.client_handle()).or_default() += 1;
    }
    assert_eq!(seen.len() as i64, total);
    assert!(seen.values().all(|count| *count == 1));
}

mod common;

use common::*;
use durohost::bus::{Delivery, Message, MessageHandler};
use durohost::providers::in_memory::InMemoryProvider;
use durohost::providers::Provider;
use durohost::runtime::catalog::{DefinitionCatalog, ProcessDefinition, Step};
use durohost::runtime::{ExecutionOutcome, LifecycleKind, LifetimeExtension, Orchestrator, Services};
use durohost::{CORRELATION_HEADER, CorrelationToken, InstanceStatus, OrchestratorError};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Barrier;

fn catalog(definition: ProcessDefinition) -> DefinitionCatalog {
    DefinitionCatalog::builder().register(definition).build().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_peak_at_n_and_drain_to_zero() {
    const N: usize = 6;
    let def = ProcessDefinition::builder("Gathering", "demo", "1.0.0")
        .on_start("Join", |ctx, _in: serde_json::Value| async move {
            let barrier = ctx.resolve::<Barrier>().ok_or("no barrier")?;
            barrier.wait().await;
            Ok(Step::Complete)
        })
        .build()
        .unwrap();
    let orchestrator = Orchestrator::builder("Gathering", catalog(def))
        .services(Services::new().with(Arc::new(Barrier::new(N))))
        .options(fast_options())
        .build()
        .unwrap();

    let tasks: Vec<_> = (0..N)
        .map(|_| {
            let o = orchestrator.clone();
            tokio::spawn(async move { o.dispatch(Message::json("Join", &json!({})).unwrap()).await })
        })
        .collect();
    for t in tasks {
        assert_eq!(t.await.unwrap().unwrap(), ExecutionOutcome::Completed);
    }

    assert_eq!(orchestrator.in_flight().peak(), N);
    assert_eq!(orchestrator.in_flight().current(), 0);
    assert_eq!(orchestrator.metrics().completed, N as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resumes_of_one_instance_conflict() {
    let def = ProcessDefinition::builder("Counter", "demo", "1.0.0")
        .on_start("Open", |_ctx, _in: serde_json::Value| async { Step::await_message("Bump", &0u32) })
        .on_resume("Bump", |ctx, count: u32, _in: serde_json::Value| async move {
            // Both resumes must have loaded the same version before either commits.
            let barrier = ctx.resolve::<Barrier>().ok_or("no barrier")?;
            barrier.wait().await;
            Step::await_message("Bump", &(count + 1))
        })
        .build()
        .unwrap();
    let provider = Arc::new(InMemoryProvider::new());
    let observer = Arc::new(RecordingObserver::default());
    let orchestrator = Orchestrator::builder("Counter", catalog(def))
        .provider(provider.clone())
        .observer(observer.clone())
        .services(Services::new().with(Arc::new(Barrier::new(2))))
        .options(fast_options())
        .build()
        .unwrap();

    orchestrator
        .dispatch(Message::json("Open", &json!({})).unwrap())
        .await
        .unwrap();
    let id = observer.of_kind(LifecycleKind::Started)[0].instance_id;
    let bump = || {
        Message::json("Bump", &json!({}))
            .unwrap()
            .with_header(CORRELATION_HEADER, CorrelationToken::new(id, "Counter").unwrap().encode())
    };

    let a = tokio::spawn({
        let o = orchestrator.clone();
        let m = bump();
        async move { o.dispatch(m).await }
    });
    let b = tokio::spawn({
        let o = orchestrator.clone();
        let m = bump();
        async move { o.dispatch(m).await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(OrchestratorError::VersionConflict { instance_id, .. }) if *instance_id == id))
        .count();
    assert_eq!(ok, 1, "{results:?}");
    assert_eq!(conflicts, 1, "{results:?}");

    let stored = provider.read_instance(id).await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.status, InstanceStatus::Idle);
    assert_eq!(serde_json::from_slice::<u32>(stored.state.as_deref().unwrap()).unwrap(), 1);
    assert_eq!(orchestrator.in_flight().current(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completing_resumes_conflict() {
    let def = ProcessDefinition::builder("Closer", "demo", "1.0.0")
        .on_start("Open", |_ctx, _in: serde_json::Value| async { Step::await_message("Close", &()) })
        .on_resume("Close", |ctx, _state: (), _in: serde_json::Value| async move {
            let barrier = ctx.resolve::<Barrier>().ok_or("no barrier")?;
            barrier.wait().await;
            Ok(Step::Complete)
        })
        .build()
        .unwrap();
    let provider = Arc::new(InMemoryProvider::new());
    let observer = Arc::new(RecordingObserver::default());
    // Default completion action deletes the row on completion.
    let orchestrator = Orchestrator::builder("Closer", catalog(def))
        .provider(provider.clone())
        .observer(observer.clone())
        .services(Services::new().with(Arc::new(Barrier::new(2))))
        .options(fast_options())
        .build()
        .unwrap();

    orchestrator
        .dispatch(Message::json("Open", &json!({})).unwrap())
        .await
        .unwrap();
    let id = observer.of_kind(LifecycleKind::Started)[0].instance_id;
    let close = || {
        Message::json("Close", &json!({}))
            .unwrap()
            .with_header(CORRELATION_HEADER, CorrelationToken::new(id, "Closer").unwrap().encode())
    };

    let a = tokio::spawn({
        let o = orchestrator.clone();
        let m = close();
        async move { o.dispatch(m).await }
    });
    let b = tokio::spawn({
        let o = orchestrator.clone();
        let m = close();
        async move { o.dispatch(m).await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let completed = results
        .iter()
        .filter(|r| matches!(r, Ok(ExecutionOutcome::Completed)))
        .count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(OrchestratorError::VersionConflict { instance_id, expected_version: 1 }) if *instance_id == id))
        .count();
    assert_eq!(completed, 1, "{results:?}");
    assert_eq!(conflicts, 1, "{results:?}");
    assert_eq!(provider.instance_count().await, 0);
    assert_eq!(orchestrator.metrics().completed, 1);
    assert_eq!(orchestrator.in_flight().current(), 0);
}

#[derive(Default)]
struct RecordingLifetime {
    requests: Mutex<Vec<Duration>>,
}

impl LifetimeExtension for RecordingLifetime {
    fn request_additional_time(&self, additional: Duration) {
        self.requests.lock().unwrap().push(additional);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_drains_in_flight_work_and_refuses_new_messages() {
    let runs = Arc::new(AtomicU32::new(0));
    let def = ProcessDefinition::builder("Slow", "demo", "1.0.0")
        .on_start("Work", |ctx, _in: serde_json::Value| async move {
            if let Some(runs) = ctx.resolve::<AtomicU32>() {
                runs.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(Step::Complete)
        })
        .build()
        .unwrap();
    let provider = Arc::new(InMemoryProvider::new());
    let lifetime = Arc::new(RecordingLifetime::default());
    let orchestrator = Orchestrator::builder("Slow", catalog(def))
        .provider(provider.clone())
        .services(Services::new().with(runs.clone()))
        .lifetime(lifetime.clone())
        .options(fast_options())
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let o = orchestrator.clone();
            tokio::spawn(async move { o.dispatch(Message::json("Work", &json!({})).unwrap()).await })
        })
        .collect();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let runs = runs.clone();
            async move { runs.load(Ordering::SeqCst) == 3 }
        })
        .await
    );
    assert_eq!(orchestrator.in_flight().current(), 3);

    let began = Instant::now();
    orchestrator.stop(Duration::from_secs(5)).await;
    assert!(began.elapsed() <= Duration::from_secs(5), "stop took {:?}", began.elapsed());
    assert_eq!(orchestrator.in_flight().current(), 0);
    assert!(!orchestrator.is_running());

    for t in tasks {
        assert_eq!(t.await.unwrap().unwrap(), ExecutionOutcome::Completed);
    }

    // Nothing new is dispatched once stop has begun.
    assert_eq!(orchestrator.handle(Message::json("Work", &json!({})).unwrap()).await, Delivery::Requeue);
    let err = orchestrator
        .dispatch(Message::json("Work", &json!({})).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ShuttingDown { .. }));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(provider.instance_count().await, 0);
    assert_eq!(provider.owner_count().await, 0, "owner released on stop");

    let requests = lifetime.requests.lock().unwrap().clone();
    assert_eq!(requests.first(), Some(&Duration::from_secs(5)));
    assert!(requests.len() >= 2, "drain rounds request more time: {requests:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_gives_up_after_drain_timeout() {
    let def = ProcessDefinition::builder("Stuck", "demo", "1.0.0")
        .on_start("Work", |_ctx, _in: serde_json::Value| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(Step::Complete)
        })
        .build()
        .unwrap();
    let orchestrator = Orchestrator::builder("Stuck", catalog(def))
        .options(fast_options())
        .build()
        .unwrap();
    orchestrator.start().await.unwrap();

    let o = orchestrator.clone();
    let task = tokio::spawn(async move { o.dispatch(Message::json("Work", &json!({})).unwrap()).await });
    let in_flight = orchestrator.in_flight().clone();
    assert!(
        wait_until(Duration::from_secs(1), || {
            let in_flight = in_flight.clone();
            async move { in_flight.current() == 1 }
        })
        .await
    );

    let began = Instant::now();
    orchestrator.stop(Duration::from_millis(300)).await;
    let elapsed = began.elapsed();
    assert!(elapsed < Duration::from_secs(2), "stop took {elapsed:?}");
    assert_eq!(orchestrator.in_flight().current(), 1, "in-flight work is not cancelled");

    // The execution still finishes after stop returned; its owner lease was released,
    // so the store renews one to commit.
    let result = task.await.unwrap();
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(orchestrator.in_flight().current(), 0);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let orchestrator = greeter_orchestrator(Arc::new(InMemoryProvider::new()));
    orchestrator.start().await.unwrap();
    orchestrator.start().await.unwrap();
    assert!(orchestrator.is_running());

    orchestrator.stop(Duration::from_millis(50)).await;
    orchestrator.stop(Duration::from_millis(50)).await;
    assert!(!orchestrator.is_running());

    // A stopped orchestrator can be started again.
    orchestrator.start().await.unwrap();
    assert!(orchestrator.is_accepting());
    assert!(orchestrator.dispatch(start_greeting("Alice")).await.is_ok());
    orchestrator.stop(Duration::from_millis(50)).await;
}

use futures::StreamExt;
use run_panel::comms::Broker;
use run_panel::transport::{StatsEvent, TelemetryEvent, Topic};
use std::sync::Arc;
use std::time::Duration;

fn stats(n: u32) -> TelemetryEvent {
    TelemetryEvent::Stats(StatsEvent {
        cpu_percent: n as f64,
        memory_percent: 0.0,
        timestamp: n.to_string(),
    })
}

fn cpu(event: &TelemetryEvent) -> u32 {
    match event {
        TelemetryEvent::Stats(s) => s.cpu_percent as u32,
        other => panic!("expected stats, got {other:?}"),
    }
}

#[tokio::test]
async fn every_subscriber_sees_every_event_in_order() {
    let broker = Arc::new(Broker::new(1024));
    let mut a = broker.subscribe(Topic::Stats);
    let mut b = broker.subscribe(Topic::Stats);
    let mut logs = broker.subscribe(Topic::Logs);

    for n in 0..10 {
        assert_eq!(broker.publish(stats(n)), 2);
    }
    broker.publish(TelemetryEvent::log("only for logs"));

    for sub in [&mut a, &mut b] {
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(cpu(&sub.recv().await.unwrap()));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(sub.try_recv().is_none());
    }

    let log = logs.recv().await.unwrap();
    assert_eq!(*log, TelemetryEvent::log("only for logs"));
    assert!(logs.try_recv().is_none());
}

#[tokio::test]
async fn concurrent_consumers_do_not_compete() {
    let broker = Arc::new(Broker::new(1024));
    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let sub = broker.subscribe(Topic::Stats);
            tokio::spawn(async move {
                sub.into_stream()
                    .take(100)
                    .map(|event| cpu(&event))
                    .collect::<Vec<_>>()
                    .await
            })
        })
        .collect();

    let publisher = broker.clone();
    tokio::spawn(async move {
        for n in 0..100 {
            publisher.publish(stats(n));
            if n % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });

    for consumer in consumers {
        let seen = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn resubscribing_does_not_replay() {
    let broker = Broker::new(16);

    let mut first = broker.subscribe(Topic::Stats);
    broker.publish(stats(1));
    assert_eq!(cpu(&first.recv().await.unwrap()), 1);
    broker.publish(stats(2));
    drop(first);

    broker.publish(stats(3));

    let mut second = broker.subscribe(Topic::Stats);
    assert!(second.try_recv().is_none());
    broker.publish(stats(4));
    assert_eq!(cpu(&second.recv().await.unwrap()), 4);
    assert!(second.try_recv().is_none());
}

#[tokio::test]
async fn stalled_subscriber_is_bounded_and_does_not_block_others() {
    let broker = Broker::new(4);
    let mut stalled = broker.subscribe(Topic::Stats);
    let mut live = broker.subscribe(Topic::Stats);

    for n in 0..10 {
        broker.publish(stats(n));
        assert_eq!(cpu(&live.recv().await.unwrap()), n);
    }

    assert_eq!(stalled.dropped(), 6);
    assert_eq!(live.dropped(), 0);
    let mut kept = Vec::new();
    while let Some(event) = stalled.try_recv() {
        kept.push(cpu(&event));
    }
    assert_eq!(kept, vec![6, 7, 8, 9]);
}

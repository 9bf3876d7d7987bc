#![cfg(feature = "channel")]

use super::*;
use crate::bus::{ChannelBroker, InboundMessage};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};

fn settings() -> TransportSettings {
    TransportSettings {
        publish_timeout: Duration::from_secs(1),
        reconnect: ReconnectConfig {
            min_delay_ms: 100,
            max_delay_ms: 1_000,
            factor: 2.0,
            jitter: false,
        },
        workers: 4,
    }
}

fn start(broker: &ChannelBroker, settings: TransportSettings) -> Arc<ManagedTransport> {
    ManagedTransport::start(Arc::new(broker.connector()), settings)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<StdMutex<Vec<Bytes>>>,
    failures: Arc<AtomicUsize>,
    hold: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Recorder {
    fn failing(times: usize) -> Self {
        let recorder = Self::default();
        recorder.failures.store(times, Ordering::SeqCst);
        recorder
    }

    fn holding(hold: Duration) -> Self {
        Self {
            hold: Some(hold),
            ..Self::default()
        }
    }

    fn seen(&self) -> Vec<Bytes> {
        self.seen.lock().unwrap().clone()
    }
}

impl MessageHandler for Recorder {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            let now = this.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            this.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(hold) = this.hold {
                tokio::time::sleep(hold).await;
            }
            this.in_flight.fetch_sub(1, Ordering::SeqCst);

            if this
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BusError::Handler("rejected".to_string()));
            }
            this.seen.lock().unwrap().push(message.payload);
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_publish_without_session_is_not_connected() {
    let broker = ChannelBroker::new();
    broker.fail_next_connects(usize::MAX);
    let transport = start(&broker, settings());

    let result = transport.publish("events", Bytes::from_static(b"{}")).await;

    assert!(matches!(result, Err(BusError::NotConnected)));
    assert!(broker.sent().is_empty());
    transport.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_grows_between_attempts() {
    let broker = ChannelBroker::new();
    broker.fail_next_connects(3);
    let transport = start(&broker, settings());

    transport.wait_connected().await.unwrap();

    let attempts = broker.connect_attempts();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected_ms) in gaps.iter().zip([100u64, 200, 400]) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(10),
            "gap {:?}, expected about {:?}",
            gap,
            expected
        );
    }
    assert_eq!(transport.state(), ConnectionState::Connected);
    transport.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_publish_times_out() {
    let broker = ChannelBroker::new();
    let transport = start(
        &broker,
        TransportSettings {
            publish_timeout: Duration::from_millis(50),
            ..settings()
        },
    );
    transport.wait_connected().await.unwrap();
    broker.set_publish_delay(Some(Duration::from_millis(200)));

    let result = transport.publish("events", Bytes::from_static(b"{}")).await;

    assert!(matches!(result, Err(BusError::Timeout(_))));
    assert!(broker.sent().is_empty());
    transport.close().await;
}

#[tokio::test]
async fn test_subscriptions_survive_reconnect() {
    let broker = ChannelBroker::new();
    let transport = start(&broker, settings());
    transport.wait_connected().await.unwrap();

    let recorder = Recorder::default();
    transport
        .subscribe(
            SubscriptionSpec::durable("acks", "outbox"),
            Arc::new(recorder.clone()),
        )
        .await
        .unwrap();

    broker.send("acks", None, "before");
    eventually(|| recorder.seen().len() == 1).await;

    broker.drop_connections();
    eventually(|| broker.connect_attempts().len() == 2).await;
    transport.wait_connected().await.unwrap();

    broker.send("acks", None, "after");
    eventually(|| recorder.seen().len() == 2).await;

    assert_eq!(
        recorder.seen(),
        vec![Bytes::from("before"), Bytes::from("after")]
    );
    eventually(|| broker.acked_count() == 2).await;
    transport.close().await;
}

#[tokio::test]
async fn test_publish_resumes_after_reconnect() {
    let broker = ChannelBroker::new();
    let transport = start(&broker, settings());
    transport.wait_connected().await.unwrap();

    broker.drop_connections();
    eventually(|| broker.connect_attempts().len() == 2).await;
    transport.wait_connected().await.unwrap();

    transport
        .publish("events", Bytes::from_static(b"{}"))
        .await
        .unwrap();
    assert_eq!(broker.sent_to("events").len(), 1);
    transport.close().await;
}

#[tokio::test]
async fn test_handler_error_requests_redelivery() {
    let broker = ChannelBroker::new();
    let transport = start(&broker, settings());
    transport.wait_connected().await.unwrap();

    let recorder = Recorder::failing(1);
    transport
        .subscribe(
            SubscriptionSpec::durable("acks", "outbox"),
            Arc::new(recorder.clone()),
        )
        .await
        .unwrap();

    broker.send("acks", None, "a");

    eventually(|| broker.acked_count() == 1).await;
    assert_eq!(broker.nacked_count(), 1);
    assert_eq!(recorder.seen(), vec![Bytes::from("a")]);
    transport.close().await;
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let broker = ChannelBroker::new();
    let transport = start(
        &broker,
        TransportSettings {
            workers: 2,
            ..settings()
        },
    );
    transport.wait_connected().await.unwrap();

    let recorder = Recorder::holding(Duration::from_millis(30));
    transport
        .subscribe(
            SubscriptionSpec::queue("commands", "api"),
            Arc::new(recorder.clone()),
        )
        .await
        .unwrap();

    for i in 0..6 {
        broker.send("commands", None, i.to_string());
    }

    eventually(|| recorder.seen().len() == 6).await;
    assert!(recorder.max_in_flight.load(Ordering::SeqCst) <= 2);
    transport.close().await;
}

#[tokio::test]
async fn test_close_rejects_further_publishes() {
    let broker = ChannelBroker::new();
    let transport = start(&broker, settings());
    transport.wait_connected().await.unwrap();

    transport.close().await;

    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(matches!(
        transport.publish("events", Bytes::new()).await,
        Err(BusError::Closed)
    ));
    assert_eq!(broker.live_connections(), 0);
}

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use async_trait::async_trait;
use courier_messaging::{Connection, ConnectionFactory, Consumer, Destination};
use courier_messaging_memory::MemoryBroker;
use courier_request_reply::{
    Error, Exchange, HandlerError, HeaderValue, JmsComponent, JmsConsumer, JmsProducer, Outcome,
    ReplyStrategy, RequestHandler, TemporaryAffinity, headers,
};
use futures::future::join_all;
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
#[error("refused {0}")]
struct Refused(String);

impl HandlerError for Refused {}

/// Prefixes the request text with a greeting. `slow` takes half a second and
/// `boom` fails.
#[derive(Clone, Debug)]
struct Greeter {
    greeting: &'static str,
    calls: Arc<AtomicUsize>,
}

impl Greeter {
    fn new(greeting: &'static str) -> Self {
        Self {
            greeting,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for Greeter {
    type Error = Refused;

    async fn handle(&self, exchange: Exchange) -> Result<Exchange, Refused> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let text = exchange.text().unwrap_or_default().to_string();
        match text.as_str() {
            "boom" => return Err(Refused(text)),
            "slow" => tokio::time::sleep(Duration::from_millis(500)).await,
            _ => {}
        }

        Ok(Exchange::in_out(format!("{}{text}", self.greeting)))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn responder(
    component: &JmsComponent<MemoryBroker>,
    uri: &str,
    handler: Greeter,
) -> JmsConsumer<MemoryBroker, Greeter> {
    let consumer = component
        .endpoint(uri)
        .unwrap()
        .create_consumer(handler)
        .unwrap();
    consumer.start().unwrap();
    consumer
}

async fn requester(component: &JmsComponent<MemoryBroker>, uri: &str) -> JmsProducer<MemoryBroker> {
    let producer = component.endpoint(uri).unwrap().create_producer().unwrap();
    producer.start().await.unwrap();
    producer
}

#[tokio::test]
async fn test_explicit_correlation_id_round_trip() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let consumer = responder(&component, "jms:queue:greet", Greeter::new("Hello "));
    let producer = requester(&component, "jms:queue:greet").await;

    let reply = producer
        .request(Exchange::in_out("A").with_header(headers::JMS_CORRELATION_ID, "abc-123"))
        .await
        .unwrap();

    assert_eq!(reply.text(), Some("Hello A"));
    assert_eq!(reply.correlation_id.as_deref(), Some("abc-123"));

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_missing_correlation_id_is_generated() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let consumer = responder(&component, "jms:queue:greet", Greeter::new("Hello "));
    let producer = requester(&component, "jms:queue:greet").await;

    let reply = producer.request(Exchange::in_out("B")).await.unwrap();
    let correlation_id = reply.correlation_id.unwrap();

    assert_eq!(reply.body.as_text(), Some("Hello B"));
    assert!(correlation_id.starts_with("Courier-"));
    assert!(!correlation_id.starts_with("ID:"));

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_message_id_correlation() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let uri = "jms:queue:greet?useMessageIDAsCorrelationID=true";
    let consumer = responder(&component, uri, Greeter::new("Hello "));
    let producer = requester(&component, uri).await;

    // A caller supplied id is not what the responder echoes.
    let reply = producer
        .request(Exchange::in_out("C").with_header(headers::JMS_CORRELATION_ID, "ignored"))
        .await
        .unwrap();

    assert_eq!(reply.text(), Some("Hello C"));
    assert!(reply.correlation_id.unwrap().starts_with("ID:"));

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_in_flight_correlation_id() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let producer = Arc::new(requester(&component, "jms:queue:nobody?requestTimeout=500").await);

    let first = {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move {
            producer
                .request(Exchange::in_out("one").with_header(headers::JMS_CORRELATION_ID, "dup"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = producer
        .request(Exchange::in_out("two").with_header(headers::JMS_CORRELATION_ID, "dup"))
        .await;

    assert_matches!(second, Err(Error::DuplicateCorrelationKey(key)) if key == "dup");
    assert_matches!(first.await.unwrap(), Err(Error::ExchangeTimedOut { correlation_id, .. }) if correlation_id == "dup");

    producer.shutdown().await;
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_dropped() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let consumer = responder(&component, "jms:queue:greet", Greeter::new("Hello "));
    let producer = requester(&component, "jms:queue:greet?requestTimeout=200").await;

    let started = Instant::now();
    let result = producer
        .request(Exchange::in_out("slow").with_header(headers::JMS_CORRELATION_ID, "late-1"))
        .await;

    assert_matches!(
        result,
        Err(Error::ExchangeTimedOut { correlation_id, timeout })
            if correlation_id == "late-1" && timeout == Duration::from_millis(200)
    );
    assert!(started.elapsed() >= Duration::from_millis(200));

    // Let the slow reply arrive and be discarded.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let reply = producer
        .request(Exchange::in_out("fast").with_header(headers::JMS_CORRELATION_ID, "late-1"))
        .await
        .unwrap();
    assert_eq!(reply.text(), Some("Hello fast"));

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_request_timeout_header_overrides_endpoint() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let producer = requester(&component, "jms:queue:nobody?requestTimeout=10000").await;

    let result = timeout(
        Duration::from_secs(2),
        producer.request(Exchange::in_out("x").with_header(headers::REQUEST_TIMEOUT, 150)),
    )
    .await
    .unwrap();

    assert_matches!(result, Err(Error::ExchangeTimedOut { timeout, .. }) if timeout == Duration::from_millis(150));

    producer.shutdown().await;
}

#[tokio::test]
async fn test_component_json_defaults() {
    init_tracing();
    let component =
        JmsComponent::from_json(MemoryBroker::new(), r#"{"requestTimeout": 150}"#).unwrap();
    let endpoint = component.endpoint("jms:queue:nobody").unwrap();
    assert_eq!(endpoint.config().request_timeout, Duration::from_millis(150));

    let producer = endpoint.create_producer().unwrap();
    producer.start().await.unwrap();

    let result = producer.request(Exchange::in_out("x")).await;
    assert_matches!(result, Err(Error::ExchangeTimedOut { timeout, .. }) if timeout == Duration::from_millis(150));

    producer.shutdown().await;
}

#[tokio::test]
async fn test_temporary_reply_to_with_fixed_queue_is_rejected() {
    let component = JmsComponent::new(MemoryBroker::new());
    let endpoint = component
        .endpoint("jms:queue:greet?replyToType=Temporary&replyTo=bar")
        .unwrap();

    assert_matches!(
        endpoint.create_producer(),
        Err(Error::InvalidReplyToConfiguration(_))
    );
}

#[tokio::test]
async fn test_exclusive_reply_queue() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let consumer = responder(&component, "jms:queue:greet", Greeter::new("Hello "));
    let producer = requester(
        &component,
        "jms:queue:greet?replyTo=greet.replies&replyToType=Exclusive",
    )
    .await;

    assert_matches!(producer.reply_strategy(), ReplyStrategy::Exclusive { destination } if destination == &Destination::queue("greet.replies"));

    let reply = producer.request(Exchange::in_out("A")).await.unwrap();
    assert_eq!(reply.text(), Some("Hello A"));

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_reply_queue_concurrent_callers() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let consumer = responder(
        &component,
        "jms:queue:bye?concurrentConsumers=5",
        Greeter::new("Bye "),
    );
    let producer = Arc::new(
        requester(
            &component,
            "jms:queue:bye?replyTo=bye.replies&replyToConcurrentConsumers=2&requestTimeout=10000",
        )
        .await,
    );

    assert_matches!(producer.reply_strategy(), ReplyStrategy::Shared { .. });

    let callers = (0..200).map(|i| {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move {
            let reply = producer
                .request(Exchange::in_out(format!("Message {i}")))
                .await
                .unwrap();
            (i, reply)
        })
    });

    for caller in join_all(callers).await {
        let (i, reply) = caller.unwrap();
        assert_eq!(reply.text(), Some(format!("Bye Message {i}").as_str()));
    }

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_transferred_failure() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let consumer = responder(
        &component,
        "jms:queue:fail?transferException=true",
        Greeter::new("Hello "),
    );
    let producer = requester(&component, "jms:queue:fail").await;

    let result = producer.request(Exchange::in_out("boom")).await;
    assert_matches!(result, Err(Error::RemoteProcessingFailure(failure)) => {
        assert_eq!(failure.message, "refused boom");
        assert!(failure.kind.ends_with("Refused"));
    });

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_failure_without_transfer_sends_no_reply() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let greeter = Greeter::new("Hello ");
    let consumer = responder(&component, "jms:queue:fail", greeter.clone());
    let producer = requester(&component, "jms:queue:fail?requestTimeout=300").await;

    let result = producer.request(Exchange::in_out("boom")).await;
    assert_matches!(result, Err(Error::ExchangeTimedOut { .. }));
    assert_eq!(greeter.calls(), 1);

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_in_only_send_drops_reply_to() {
    init_tracing();
    let broker = MemoryBroker::new();
    let component = JmsComponent::new(broker.clone());
    let producer = requester(&component, "jms:queue:oneway").await;

    let outcome = producer
        .process(
            Exchange::in_only("fire")
                .with_header(headers::JMS_REPLY_TO, Destination::queue("nowhere")),
        )
        .await
        .unwrap();
    assert_matches!(&outcome, Outcome::Sent { message_id } if message_id.starts_with("ID:"));

    let connection = broker.create_connection().await.unwrap();
    let raw = connection
        .create_consumer(&Destination::queue("oneway"), None)
        .await
        .unwrap();
    let message = timeout(Duration::from_secs(1), raw.receive())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(message.body.as_text(), Some("fire"));
    assert_eq!(message.reply_to, None);

    producer.shutdown().await;
}

#[tokio::test]
async fn test_disable_reply_to_sends_one_way() {
    init_tracing();
    let broker = MemoryBroker::new();
    let component = JmsComponent::new(broker.clone());
    let producer = requester(&component, "jms:queue:audit?disableReplyTo=true").await;

    let outcome = timeout(Duration::from_secs(1), producer.process(Exchange::in_out("x")))
        .await
        .unwrap()
        .unwrap();

    assert_matches!(outcome, Outcome::Sent { .. });
    assert_eq!(broker.queue_depth(&Destination::queue("audit")), 1);

    producer.shutdown().await;
}

#[tokio::test]
async fn test_consumer_disable_reply_to_ignores_reply_to() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let greeter = Greeter::new("Hello ");
    let consumer = responder(
        &component,
        "jms:queue:sink?disableReplyTo=true",
        greeter.clone(),
    );
    let producer = requester(&component, "jms:queue:sink?requestTimeout=300").await;

    let result = producer.request(Exchange::in_out("x")).await;

    assert_matches!(result, Err(Error::ExchangeTimedOut { .. }));
    assert_eq!(greeter.calls(), 1);

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_correlation_property() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let uri = "jms:queue:greet?correlationProperty=MyCorrelation";
    let consumer = responder(&component, uri, Greeter::new("Hello "));
    let producer = requester(&component, uri).await;

    let reply = producer.request(Exchange::in_out("D")).await.unwrap();

    assert_eq!(reply.text(), Some("Hello D"));
    assert_matches!(
        reply.header("MyCorrelation").and_then(HeaderValue::as_string),
        Some(key) if key.starts_with("Courier-")
    );

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_temporary_reply_queue_rebinds_after_connection_loss() {
    init_tracing();
    let broker = MemoryBroker::new();
    let component = JmsComponent::new(broker.clone());
    let consumer = responder(
        &component,
        "jms:queue:greet?recoveryInterval=50",
        Greeter::new("Hello "),
    );
    let producer = requester(
        &component,
        "jms:queue:greet?recoveryInterval=50&requestTimeout=2000",
    )
    .await;

    let reply = producer.request(Exchange::in_out("before")).await.unwrap();
    assert_eq!(reply.text(), Some("Hello before"));

    assert!(broker.drop_connections() > 0);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let reply = producer.request(Exchange::in_out("after")).await.unwrap();
    assert_eq!(reply.text(), Some("Hello after"));

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_temporary_affinity() {
    init_tracing();
    let broker = MemoryBroker::new();
    let component = JmsComponent::new(broker.clone());
    let consumer = responder(&component, "jms:queue:greet", Greeter::new("Hello "));

    let shared_uri = "jms:queue:greet?temporaryAffinity=component";
    let first = requester(&component, shared_uri).await;
    let second = requester(&component, shared_uri).await;
    assert_eq!(
        first.reply_strategy(),
        &ReplyStrategy::Temporary {
            affinity: TemporaryAffinity::Component
        }
    );

    assert_eq!(first.request(Exchange::in_out("1")).await.unwrap().text(), Some("Hello 1"));
    assert_eq!(second.request(Exchange::in_out("2")).await.unwrap().text(), Some("Hello 2"));
    assert_eq!(broker.temporary_queue_count(), 1);

    let own = requester(&component, "jms:queue:greet").await;
    assert_eq!(own.request(Exchange::in_out("3")).await.unwrap().text(), Some("Hello 3"));
    assert_eq!(broker.temporary_queue_count(), 2);

    // Producers never stop the component's queue.
    first.shutdown().await;
    second.shutdown().await;
    own.shutdown().await;
    assert_eq!(broker.temporary_queue_count(), 1);

    component.shutdown().await;
    assert_eq!(broker.temporary_queue_count(), 0);

    consumer.shutdown().await;
}

#[tokio::test]
async fn test_producer_lifecycle() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let producer = Arc::new(
        component
            .endpoint("jms:queue:nobody?requestTimeout=5000")
            .unwrap()
            .create_producer()
            .unwrap(),
    );

    assert_matches!(
        producer.request(Exchange::in_out("early")).await,
        Err(Error::NotStarted)
    );

    producer.start().await.unwrap();
    assert_matches!(producer.start().await, Err(Error::AlreadyStarted));

    let waiting = {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move { producer.request(Exchange::in_out("pending")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    producer.shutdown().await;

    let result = timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
    assert_matches!(result, Err(Error::Stopped));
    assert_matches!(
        producer.request(Exchange::in_out("late")).await,
        Err(Error::Stopped)
    );
}

#[tokio::test]
async fn test_invalid_uri() {
    let component = JmsComponent::new(MemoryBroker::new());

    assert_matches!(
        component.endpoint("jms:queue:greet?bogusOption=1"),
        Err(Error::InvalidUri { .. })
    );
    assert_matches!(
        component.endpoint("http://greet"),
        Err(Error::InvalidUri { .. })
    );
    assert_matches!(
        component
            .endpoint("jms:queue:greet?concurrentConsumers=0")
            .unwrap()
            .create_consumer(Greeter::new("Hello ")),
        Err(Error::InvalidConfiguration(_))
    );
}

#[tokio::test]
async fn test_component_affinity_separates_correlation_settings() {
    init_tracing();
    let broker = MemoryBroker::new();
    let component = JmsComponent::new(broker.clone());
    let consumer = responder(&component, "jms:queue:greet", Greeter::new("Hello "));
    let keyed_consumer = responder(
        &component,
        "jms:queue:keyed?correlationProperty=MyCorr",
        Greeter::new("Hello "),
    );

    let first = requester(
        &component,
        "jms:queue:greet?temporaryAffinity=component&requestTimeout=2000",
    )
    .await;
    let second = requester(
        &component,
        "jms:queue:keyed?temporaryAffinity=component&correlationProperty=MyCorr&requestTimeout=2000",
    )
    .await;

    assert_eq!(first.request(Exchange::in_out("1")).await.unwrap().text(), Some("Hello 1"));
    assert_eq!(second.request(Exchange::in_out("2")).await.unwrap().text(), Some("Hello 2"));
    assert_eq!(broker.temporary_queue_count(), 2);

    first.shutdown().await;
    second.shutdown().await;
    component.shutdown().await;
    assert_eq!(broker.temporary_queue_count(), 0);

    consumer.shutdown().await;
    keyed_consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_reply_queue_keeps_requesters_apart() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let consumer = responder(
        &component,
        "jms:queue:bye?concurrentConsumers=4",
        Greeter::new("Bye "),
    );

    let uri = "jms:queue:bye?replyTo=shared.replies&requestTimeout=10000";
    let left = Arc::new(requester(&component, uri).await);
    let right = Arc::new(requester(&component, uri).await);

    let callers = (0..100).map(|i| {
        let producer = Arc::clone(if i % 2 == 0 { &left } else { &right });
        tokio::spawn(async move {
            let reply = producer
                .request(Exchange::in_out(format!("M{i}")))
                .await
                .unwrap();
            (i, reply)
        })
    });

    for caller in join_all(callers).await {
        let (i, reply) = caller.unwrap();
        assert_eq!(reply.text(), Some(format!("Bye M{i}").as_str()));
    }

    left.shutdown().await;
    right.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_shared_reply_queue_with_message_id_correlation() {
    init_tracing();
    let component = JmsComponent::new(MemoryBroker::new());
    let consumer = responder(
        &component,
        "jms:queue:greet?useMessageIDAsCorrelationID=true",
        Greeter::new("Hello "),
    );
    let producer = requester(
        &component,
        "jms:queue:greet?replyTo=greet.shared&useMessageIDAsCorrelationID=true&requestTimeout=2000",
    )
    .await;

    assert_matches!(producer.reply_strategy(), ReplyStrategy::Shared { .. });

    let reply = producer.request(Exchange::in_out("X")).await.unwrap();
    assert_eq!(reply.text(), Some("Hello X"));
    assert!(reply.correlation_id.unwrap().starts_with("ID:"));

    producer.shutdown().await;
    consumer.shutdown().await;
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Every delivery ends acknowledged. Redelivery is never left to the broker:
//! a message whose handler failed is re-published with an incremented retry
//! count until the queue's retry limit is reached, then dropped.
//!
//! 1. The body is parsed as an [`Envelope`]; a malformed body is reported
//!    with the raw content and acked
//! 2. The handler is looked up by the payload type tag and the payload is
//!    decoded; an unroutable message is reported and acked
//! 3. The handler runs; on success the delivery is acked
//! 4. On failure the error is reported, the delivery is acked and the
//!    envelope is re-published or dropped

use crate::{
    configs::OnException,
    envelope::{AnyMessage, Envelope},
    errors::{AmqpError, BusError, BusException},
    handler::{HandlerError, HandlerRegistry},
    otel,
    publisher::EnvelopePublisher,
    queue::QueueSettings,
    transport::{BrokerChannel, Delivery},
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Everything needed to process the deliveries of one queue.
pub(crate) struct DeliveryContext {
    pub settings: Arc<QueueSettings>,
    pub handlers: HandlerRegistry,
    pub channel: Arc<dyn BrokerChannel>,
    pub publisher: Arc<dyn EnvelopePublisher>,
    pub on_exception: OnException,
}

/// Terminal state of a processed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Handled,
    Unroutable,
    Retried,
    Dropped,
}

/// Processes one delivery to its terminal state.
///
/// # Parameters
/// * `tracer` - Tracer of the consumer spans
/// * `delivery` - The delivery as received from the broker
/// * `ctx` - Settings, handlers and channel of the consumed queue
///
/// # Returns
/// The terminal state of the delivery, or the broker error when it could not
/// be acknowledged
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    ctx: &DeliveryContext,
) -> Result<Outcome, AmqpError> {
    let queue = ctx.settings.name.as_str();

    let mut envelope = match Envelope::from_bytes(&delivery.data) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue, "removing message from queue - reason: malformed envelope"
            );
            (ctx.on_exception)(
                &BusException::new(
                    "could not parse the message envelope",
                    &delivery.exchange,
                    &delivery.routing_key,
                    err,
                )
                .with_raw_message(String::from_utf8_lossy(&delivery.data)),
            );

            ack(ctx, &delivery, None).await?;
            return Ok(Outcome::Unroutable);
        }
    };

    let (_, mut span) = otel::new_span(&delivery.headers, tracer, &envelope.message_type);

    debug!(
        "received: {} - exchange: {}",
        envelope.message_type, delivery.exchange,
    );

    let decoded = match ctx.handlers.handler(&envelope.message_type) {
        None => Err((
            "removing message from queue - reason: unsupported msg type",
            BusError::Routing(envelope.message_type.clone()),
        )),
        Some(handler) => match handler.decode(&envelope.json_message) {
            Ok(message) => Ok((handler.clone(), message)),
            Err(err) => Err((
                "removing message from queue - reason: payload does not match the msg type",
                err,
            )),
        },
    };

    let (handler, message) = match decoded {
        Ok(decoded) => decoded,
        Err((reason, err)) => {
            debug!("{}", reason);
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(reason),
            });

            (ctx.on_exception)(
                &BusException::new(
                    reason,
                    &delivery.exchange,
                    &delivery.routing_key,
                    err,
                )
                .with_raw_message(envelope.json_message.clone()),
            );

            ack(ctx, &delivery, Some(&mut span)).await?;
            return Ok(Outcome::Unroutable);
        }
    };

    let result = handler.handle(message.as_ref()).await;

    let Err(err) = result else {
        debug!("message successfully processed");
        ack(ctx, &delivery, Some(&mut span)).await?;
        span.set_status(Status::Ok);
        return Ok(Outcome::Handled);
    };

    warn!(
        error = err.to_string(),
        queue,
        message_type = envelope.message_type.as_str(),
        retry_count = envelope.retry_count,
        "error whiling handling msg"
    );
    span.set_status(Status::Error {
        description: Cow::from("handler failure"),
    });

    envelope.retry_count += 1;
    report_handler_failure(ctx, &delivery, &envelope, message.as_ref(), &err);

    ack(ctx, &delivery, Some(&mut span)).await?;

    if envelope.retry_count >= ctx.settings.retry_limit {
        error!(
            queue,
            message_type = envelope.message_type.as_str(),
            retry_count = envelope.retry_count,
            "too many attempts, dropping message"
        );
        return Ok(Outcome::Dropped);
    }

    // back to where it was originally published, with the same ttl
    match ctx.publisher.publish(&envelope, delivery.expiration).await {
        Ok(_) => {
            debug!(retry_count = envelope.retry_count, "message re-published for retry");
            Ok(Outcome::Retried)
        }
        Err(err) => {
            error!(error = err.to_string(), "error whiling re-publishing msg");
            (ctx.on_exception)(
                &BusException::new(
                    "could not re-publish the message for retry",
                    &envelope.properties.exchange_name,
                    &envelope.properties.queue_name,
                    err,
                )
                .with_raw_message(envelope.json_message.clone()),
            );
            Ok(Outcome::Dropped)
        }
    }
}

fn report_handler_failure(
    ctx: &DeliveryContext,
    delivery: &Delivery,
    envelope: &Envelope,
    message: &dyn AnyMessage,
    err: &HandlerError,
) {
    match &ctx.settings.exception_handler {
        Some(on_queue_exception) => on_queue_exception(message, err),
        None => (ctx.on_exception)(
            &BusException::new(
                "error whiling handling msg",
                &delivery.exchange,
                &delivery.routing_key,
                BusError::Handler(err.to_string()),
            )
            .with_raw_message(envelope.json_message.clone()),
        ),
    }
}

async fn ack(
    ctx: &DeliveryContext,
    delivery: &Delivery,
    span: Option<&mut BoxedSpan>,
) -> Result<(), AmqpError> {
    if let Err(err) = ctx.channel.ack(delivery.delivery_tag).await {
        error!("error whiling ack msg");
        if let Some(span) = span {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
        }
        return Err(AmqpError::AckMessageError);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::BusMessage,
        handler::OnQueueException,
        publisher::MockEnvelopePublisher,
        queue::QueueConfiguration,
        transport::MockBrokerChannel,
    };
    use opentelemetry::global;
    use serde::{Deserialize, Serialize};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Charge {
        id: Uuid,
        amount: i64,
    }

    impl BusMessage for Charge {
        fn message_id(&self) -> Uuid {
            self.id
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Refund {
        id: Uuid,
    }

    impl BusMessage for Refund {
        fn message_id(&self) -> Uuid {
            self.id
        }
    }

    #[derive(Default)]
    struct Reports {
        client: Mutex<Vec<BusException>>,
        queue: AtomicUsize,
    }

    fn acking_channel(times: usize) -> Arc<dyn BrokerChannel> {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .withf(|tag| *tag == 7)
            .times(times)
            .returning(|_| Ok(()));
        Arc::new(channel)
    }

    fn context(
        config: QueueConfiguration,
        channel: Arc<dyn BrokerChannel>,
        publisher: MockEnvelopePublisher,
        reports: Arc<Reports>,
    ) -> DeliveryContext {
        let settings = QueueSettings::resolve(&config, "billing", 1);
        DeliveryContext {
            settings,
            handlers: config.handlers.clone(),
            channel,
            publisher: Arc::new(publisher),
            on_exception: Arc::new(move |exc: &BusException| {
                reports.client.lock().unwrap().push(exc.clone())
            }),
        }
    }

    fn failing_queue(retry_limit: u32) -> QueueConfiguration {
        QueueConfiguration::new()
            .with_retry_limit(retry_limit)
            .with_handlers(|h| {
                h.register(|_: Charge| async { Err("card declined".into()) })?;
                Ok(())
            })
            .unwrap()
    }

    fn delivery(envelope: &Envelope) -> Delivery {
        Delivery {
            delivery_tag: 7,
            exchange: envelope.properties.exchange_name.clone(),
            routing_key: envelope.properties.queue_name.clone(),
            headers: Default::default(),
            expiration: None,
            data: envelope.to_bytes().unwrap(),
        }
    }

    fn charge(retry_count: u32) -> Envelope {
        let mut envelope = Envelope::wrap(
            &Charge {
                id: Uuid::new_v4(),
                amount: 10,
            },
            "",
            "billing",
            "shop",
        )
        .unwrap();
        envelope.retry_count = retry_count;
        envelope
    }

    #[tokio::test]
    async fn successful_handling_acks_once() {
        let config = QueueConfiguration::new()
            .with_handlers(|h| {
                h.register(|_: Charge| async { Ok(()) })?;
                Ok(())
            })
            .unwrap();
        let reports = Arc::new(Reports::default());
        let ctx = context(
            config,
            acking_channel(1),
            MockEnvelopePublisher::new(),
            reports.clone(),
        );

        let outcome = consume(&global::tracer("test"), delivery(&charge(0)), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Handled);
        assert!(reports.client.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_envelopes_are_acked_and_reported_with_the_raw_body() {
        let reports = Arc::new(Reports::default());
        let ctx = context(
            failing_queue(3),
            acking_channel(1),
            MockEnvelopePublisher::new(),
            reports.clone(),
        );
        let mut delivery = delivery(&charge(0));
        delivery.data = b"{not an envelope".to_vec();

        let outcome = consume(&global::tracer("test"), delivery, &ctx)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Unroutable);
        let client = reports.client.lock().unwrap();
        assert_eq!(client.len(), 1);
        assert!(matches!(client[0].source, BusError::Envelope(_)));
        assert_eq!(client[0].raw_message.as_deref(), Some("{not an envelope"));
        assert_eq!(client[0].queue, "billing");
    }

    #[tokio::test]
    async fn unknown_types_are_acked_and_reported_once() {
        let reports = Arc::new(Reports::default());
        let ctx = context(
            failing_queue(3),
            acking_channel(1),
            MockEnvelopePublisher::new(),
            reports.clone(),
        );
        let envelope =
            Envelope::wrap(&Refund { id: Uuid::new_v4() }, "", "billing", "shop").unwrap();

        let outcome = consume(&global::tracer("test"), delivery(&envelope), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Unroutable);
        let client = reports.client.lock().unwrap();
        assert_eq!(client.len(), 1);
        assert_eq!(
            client[0].source,
            BusError::Routing(Refund::type_tag().into_owned())
        );
    }

    #[tokio::test]
    async fn failures_below_the_limit_are_republished_with_the_next_count() {
        let mut publisher = MockEnvelopePublisher::new();
        publisher
            .expect_publish()
            .withf(|envelope, ttl| {
                envelope.retry_count == 2
                    && envelope.properties.queue_name == "billing"
                    && ttl.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let reports = Arc::new(Reports::default());
        let ctx = context(failing_queue(3), acking_channel(1), publisher, reports.clone());

        let outcome = consume(&global::tracer("test"), delivery(&charge(1)), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Retried);
        let client = reports.client.lock().unwrap();
        assert_eq!(client.len(), 1);
        assert_eq!(
            client[0].source,
            BusError::Handler("card declined".to_owned())
        );
    }

    #[tokio::test]
    async fn retried_messages_keep_their_ttl() {
        let mut publisher = MockEnvelopePublisher::new();
        publisher
            .expect_publish()
            .withf(|envelope, ttl| {
                envelope.retry_count == 1 && *ttl == Some(Duration::from_secs(30))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = context(
            failing_queue(3),
            acking_channel(1),
            publisher,
            Arc::new(Reports::default()),
        );
        let mut delivery = delivery(&charge(0));
        delivery.expiration = Some(Duration::from_secs(30));

        let outcome = consume(&global::tracer("test"), delivery, &ctx)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Retried);
    }

    #[tokio::test]
    async fn failures_at_the_limit_are_dropped() {
        let mut publisher = MockEnvelopePublisher::new();
        publisher.expect_publish().never();

        let reports = Arc::new(Reports::default());
        let ctx = context(failing_queue(3), acking_channel(1), publisher, reports.clone());

        let outcome = consume(&global::tracer("test"), delivery(&charge(2)), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(reports.client.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queue_callbacks_receive_the_typed_message() {
        let reports = Arc::new(Reports::default());
        let seen = reports.clone();
        let on_queue: OnQueueException = Arc::new(move |msg: &dyn AnyMessage, err: &HandlerError| {
            let charge = msg.as_any().downcast_ref::<Charge>().unwrap();
            assert_eq!(charge.amount, 10);
            assert_eq!(err.to_string(), "card declined");
            seen.queue.fetch_add(1, Ordering::SeqCst);
        });

        let ctx = context(
            failing_queue(0).with_error_handling(on_queue),
            acking_channel(1),
            MockEnvelopePublisher::new(),
            reports.clone(),
        );

        let outcome = consume(&global::tracer("test"), delivery(&charge(0)), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(reports.queue.load(Ordering::SeqCst), 1);
        assert!(reports.client.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ack_failures_stop_processing() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .returning(|_| Err(AmqpError::AckMessageError));
        let mut publisher = MockEnvelopePublisher::new();
        publisher.expect_publish().never();

        let ctx = context(
            failing_queue(3),
            Arc::new(channel),
            publisher,
            Arc::new(Reports::default()),
        );

        assert_eq!(
            consume(&global::tracer("test"), delivery(&charge(0)), &ctx).await,
            Err(AmqpError::AckMessageError)
        );
    }
}

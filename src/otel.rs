// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Propagates trace context through AMQP message headers: publishers inject the
//! current context, the subscription loop extracts it and opens a consumer
//! span per delivery.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
///
/// This struct implements the OpenTelemetry `Injector` and `Extractor` traits
/// over the header table of an AMQP message.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    /// Creates a new RabbitMQTracePropagator.
    ///
    /// # Parameters
    /// * `headers` - The header table of an outgoing or incoming message
    ///
    /// # Returns
    /// A propagator reading and writing `headers`
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Stores a trace header as a long string under its lowercase key.
    ///
    /// # Parameters
    /// * `key` - The header key
    /// * `value` - The header value
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Reads a trace header. Headers that are not UTF-8 long strings are
    /// ignored.
    ///
    /// # Parameters
    /// * `key` - The header key to retrieve
    ///
    /// # Returns
    /// The header value, or None if missing or not a string
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    /// Lists every header key.
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the current trace context into outgoing message headers.
///
/// Uses the globally registered text-map propagator; with none registered the
/// headers are left untouched.
///
/// # Parameters
/// * `headers` - The header table of the outgoing message
pub(crate) fn inject_current(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let ctx = Context::current();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Extracts the trace context from a delivery and starts a consumer span.
///
/// # Parameters
/// * `props` - Properties of the delivery, headers included
/// * `tracer` - The tracer starting the span
/// * `name` - The span name, the consumed queue
///
/// # Returns
/// The extracted parent context and the started span
pub(crate) fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(
            &mut props.headers().clone().unwrap_or_default().inner().clone(),
        ))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

// These tests need a running RabbitMQ. Run them with `--ignored`;
// AMQP_TEST_HOST overrides the broker host.

use rabbitmq_pubsub::{
    client::RabbitMq,
    config::RabbitMqConfig,
    publisher::Publish,
    subscriber::Subscription,
};
use std::{process::Command, time::Duration};

fn config() -> RabbitMqConfig {
    let host = std::env::var("AMQP_TEST_HOST").unwrap_or_else(|_| "localhost".to_owned());

    serde_json::from_value(serde_json::json!({
        "host": host,
        "connection_name": "rabbitmq-pubsub-tests",
        "channel_pool_size": 2,
        "resubscribe_delay_ms": 200,
        "reconnect": { "initial_interval_ms": 200, "max_interval_ms": 2000 }
    }))
    .expect("invalid test config")
}

fn topic(name: &str) -> String {
    format!("{}-{}", name, uuid::Uuid::new_v4())
}

async fn next(subscription: &mut Subscription) -> rabbitmq_pubsub::message::Message {
    tokio::time::timeout(Duration::from_secs(10), subscription.recv())
        .await
        .expect("no message received")
        .expect("subscription closed")
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn deliver_published_messages_in_order() {
    let rabbit = RabbitMq::connect(&config()).await.unwrap();
    let orders = topic("orders");

    let mut subscription = rabbit.subscriber().subscribe(&orders).await.unwrap();
    rabbit
        .publisher()
        .publish(&orders, &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()], None)
        .await
        .unwrap();

    for expected in [b"a", b"b", b"c"] {
        let msg = next(&mut subscription).await;
        assert_eq!(msg.payload(), expected);
        assert!(msg.ack());
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(500), subscription.recv())
            .await
            .is_err()
    );

    rabbit.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance and rabbitmqctl
async fn subscription_survives_connection_loss() {
    let cfg = config();
    let rabbit = RabbitMq::connect(&cfg).await.unwrap();
    let orders = topic("orders");
    let mut subscription = rabbit.subscriber().subscribe(&orders).await.unwrap();

    let rabbitmqctl = std::env::var("RABBITMQCTL").unwrap_or_else(|_| "rabbitmqctl".to_owned());
    let status = Command::new(rabbitmqctl)
        .args(["close_all_connections", "killed by test"])
        .status()
        .expect("failure to run rabbitmqctl");
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let published = rabbit
                .publisher()
                .publish(&orders, &[b"after".to_vec()], None)
                .await;
            if published.is_ok() {
                break;
            }
        }
    })
    .await
    .expect("connection not recovered");

    let msg = next(&mut subscription).await;
    assert_eq!(msg.payload(), b"after");
    assert!(msg.ack());

    rabbit.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn nacked_message_is_redelivered() {
    let rabbit = RabbitMq::connect(&config()).await.unwrap();
    let orders = topic("orders");

    let mut subscription = rabbit.subscriber().subscribe(&orders).await.unwrap();
    rabbit
        .publisher()
        .publish(&orders, &[b"retry".to_vec()], None)
        .await
        .unwrap();

    let first = next(&mut subscription).await;
    assert_eq!(first.payload(), b"retry");
    assert!(first.nack());

    let second = next(&mut subscription).await;
    assert_eq!(second.payload(), b"retry");
    assert!(second.redelivered());
    assert!(second.ack());

    rabbit.close().await.unwrap();
}

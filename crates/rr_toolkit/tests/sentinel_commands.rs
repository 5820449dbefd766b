mod common;

use std::time::Duration;

use common::{FakeOptions, FakeRedis, IO_TIMEOUT};
use rr_toolkit::resp::RedisEndpoint;
use rr_toolkit::sentinel::wait_for_promotion;
use rr_toolkit::{Coordinator, DrillError, SentinelClient, SentinelConfig};
use tokio_util::sync::CancellationToken;

async fn sentinel() -> (FakeRedis, SentinelClient) {
    let server = FakeRedis::start(FakeOptions::default()).await;
    let client = SentinelClient::new(RedisEndpoint::parse(&server.url()).unwrap());
    (server, client)
}

#[tokio::test]
async fn queries_current_primary() {
    let (_server, client) = sentinel().await;
    let primary = client.query_primary("mycluster").await.unwrap();
    assert_eq!(primary.host, "10.0.0.1");
    assert_eq!(primary.port, 6379);
    assert_eq!(primary.cluster_name, "mycluster");
}

#[tokio::test]
async fn unknown_cluster_is_a_protocol_error() {
    let (_server, client) = sentinel().await;
    let err = client.query_primary("nosuch").await.unwrap_err();
    assert!(matches!(err, DrillError::Protocol { .. }), "{err}");
}

#[tokio::test]
async fn administrative_views_decode_into_maps() {
    let (_server, client) = sentinel().await;

    let master = client.master("mycluster").await.unwrap();
    assert_eq!(master["ip"], "10.0.0.1");
    assert_eq!(master["num-slaves"], "1");

    let replicas = client.replicas("mycluster").await.unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0]["ip"], "10.0.0.2");
    assert_eq!(replicas[0]["master-link-status"], "ok");

    let sentinels = client.sentinels("mycluster").await.unwrap();
    assert_eq!(sentinels[0]["flags"], "sentinel");

    assert!(matches!(
        client.master("nosuch").await,
        Err(DrillError::Protocol { .. })
    ));
}

#[tokio::test]
async fn soft_failover_is_announced_and_awaited() {
    let (server, client) = sentinel().await;
    let config = SentinelConfig::parse(&server.url(), "mycluster").unwrap();
    let cancel = CancellationToken::new();

    let waiter = {
        let client = config.client();
        let cancel = cancel.clone();
        tokio::spawn(async move { wait_for_promotion(&client, "mycluster", &cancel).await })
    };
    server.wait_for_subscribers(1).await;
    // Another cluster's promotion does not end the wait.
    server.publish("+switch-master", "othercluster 10.1.0.1 6379 10.1.0.2 6379");

    assert_eq!(client.failover("mycluster").await.unwrap(), "OK");
    let promotion = tokio::time::timeout(IO_TIMEOUT, waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(promotion.cluster_name, "mycluster");
    assert_eq!((promotion.old_host.as_str(), promotion.old_port), ("10.0.0.1", 6379));
    assert_eq!((promotion.new_host.as_str(), promotion.new_port), ("10.0.0.2", 6379));

    let primary = client.query_primary("mycluster").await.unwrap();
    assert!(promotion.promoted(&primary));
}

#[tokio::test]
async fn waiting_stops_on_cancellation() {
    let (_server, client) = sentinel().await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = wait_for_promotion(&client, "mycluster", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DrillError::Cancelled { .. }));
}

#[tokio::test]
async fn malformed_promotion_fails_the_wait() {
    let (server, client) = sentinel().await;
    let cancel = CancellationToken::new();
    let waiter = tokio::spawn(async move { wait_for_promotion(&client, "mycluster", &cancel).await });
    server.wait_for_subscribers(1).await;
    server.publish("+switch-master", "mycluster 10.0.0.1 6379");

    let err = tokio::time::timeout(IO_TIMEOUT, waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, DrillError::Protocol { .. }));
}

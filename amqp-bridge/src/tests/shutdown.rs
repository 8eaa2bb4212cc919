use super::mock_broker::Call;
use super::*;
use crate::connector::Phase;
use crate::error::{as_bridge_error, BridgeError};
use crate::signal::InterceptedSignal;

#[tokio::test(start_paused = true)]
async fn close_is_done_only_once() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.connector
        .consume_from_queue(&queue_config("jobs", 1, true), handler.handler())
        .await
        .unwrap();

    let (first, second, third) = tokio::join!(tc.connector.close(), tc.connector.close(), tc.connector.close());

    first.unwrap();
    second.unwrap();
    third.unwrap();
    tc.connector.close().await.unwrap();

    assert_eq!(tc.broker.close_count(), 1);
    assert_eq!(tc.broker.cancel_count(), 1);
    assert_eq!(tc.connector.phase(), Phase::Closed);

    tokio::time::timeout(Duration::from_secs(1), tc.connector.closed())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn closed_connector_cannot_consume() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.connector.close().await.unwrap();

    let calls = tc.broker.calls();
    let err = tc
        .connector
        .consume_from_queue(&queue_config("jobs", 1, true), handler.handler())
        .await
        .unwrap_err();

    assert_eq!(as_bridge_error(&err), Some(&BridgeError::ConnectorClosed));
    assert_eq!(tc.broker.calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn close_cancels_the_reply_consumer() {
    let tc = TestCase::new();
    tc.broker.auto_reply();

    tc.connector
        .publish_message(&publish_config(true, Some(Duration::from_secs(5))), Bytes::from("payload"))
        .await
        .unwrap();
    tc.connector.close().await.unwrap();

    let calls = tc.broker.calls();

    assert_eq!(&calls[calls.len() - 2..], &[Call::Cancel("ctag-1".to_owned()), Call::Close]);
}

#[tokio::test(start_paused = true)]
async fn close_with_failing_cancel_still_closes_the_connection() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.broker.fail_cancel();
    tc.connector
        .consume_from_queue(&queue_config("jobs", 1, true), handler.handler())
        .await
        .unwrap();

    let err = tc.connector.close().await.unwrap_err();

    assert!(err.to_string().contains("Cannot cancel ctag-1"));
    assert_eq!(tc.broker.close_count(), 1);
    assert_eq!(tc.connector.phase(), Phase::Closed);

    // the result is memoized
    assert!(tc.connector.close().await.is_err());
    assert_eq!(tc.broker.cancel_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn signal_drains_after_messages_in_progress() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.connector
        .consume_from_queue(&queue_config("jobs", 2, true), handler.handler())
        .await
        .unwrap();

    tc.broker.deliver("m-1", "sleep:500");
    wait_until(|| handler.handled_count() == 1).await;

    assert!(tc.signals.dispatch(InterceptedSignal::Interrupt) >= 1);

    wait_until(|| tc.broker.cancel_count() == 1).await;

    assert_eq!(tc.connector.phase(), Phase::Draining);
    assert_eq!(tc.broker.close_count(), 0);

    wait_until(|| tc.connector.phase() == Phase::Closed).await;

    assert_eq!(tc.broker.acked(), vec![1]);
    assert_eq!(tc.broker.close_count(), 1);

    // the signal listener of the connector is removed
    wait_until(|| tc.signals.listener_count() == 0).await;
}

#[tokio::test(start_paused = true)]
async fn signal_without_messages_closes_immediately() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.connector
        .consume_from_queue(&queue_config("jobs", 2, true), handler.handler())
        .await
        .unwrap();

    tc.signals.dispatch(InterceptedSignal::Terminate);
    tc.signals.dispatch(InterceptedSignal::Interrupt);

    tokio::time::timeout(Duration::from_secs(1), tc.connector.closed())
        .await
        .unwrap();

    assert_eq!(tc.broker.cancel_count(), 1);
    assert_eq!(tc.broker.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn deleted_queue_closes_the_connector() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.connector
        .consume_from_queue(&queue_config("jobs", 1, true), handler.handler())
        .await
        .unwrap();

    tc.broker.delete_queue("jobs");

    tokio::time::sleep(Duration::from_secs(61)).await;
    wait_until(|| tc.connector.phase() == Phase::Closed).await;

    assert_eq!(tc.broker.count(|c| c == &Call::CheckQueue("jobs".to_owned())), 1);
    assert_eq!(tc.broker.cancel_count(), 1);
    assert_eq!(tc.broker.close_count(), 1);
    assert!(tc.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failing_watchdog_drain_is_reported() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.connector
        .consume_from_queue(&queue_config("jobs", 1, true), handler.handler())
        .await
        .unwrap();

    tc.broker.delete_queue("jobs");
    tc.broker.fail_cancel();

    tokio::time::sleep(Duration::from_secs(61)).await;
    wait_until(|| !tc.errors().is_empty()).await;

    assert!(tc.errors()[0].contains("Cannot cancel ctag-1"));
    assert_eq!(tc.connector.phase(), Phase::Closed);
    assert_eq!(tc.broker.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn signal_closes_even_if_cancel_fails() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.broker.fail_cancel();
    tc.connector
        .consume_from_queue(&queue_config("jobs", 1, true), handler.handler())
        .await
        .unwrap();

    tc.signals.dispatch(InterceptedSignal::Terminate);

    tokio::time::timeout(Duration::from_secs(1), tc.connector.closed())
        .await
        .unwrap();

    assert_eq!(tc.connector.phase(), Phase::Closed);
    assert_eq!(tc.broker.cancel_count(), 1);
    assert_eq!(tc.broker.close_count(), 1);

    // no listener is left, the next signal would exit the process
    wait_until(|| tc.signals.listener_count() == 0).await;
}

#[tokio::test(start_paused = true)]
async fn terminate_waits_for_messages_in_progress() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.connector
        .consume_from_queue(&queue_config("jobs", 2, true), handler.handler())
        .await
        .unwrap();

    tc.broker.deliver("m-1", "sleep:500");
    wait_until(|| handler.handled_count() == 1).await;

    let started = tokio::time::Instant::now();
    tc.connector.terminate(Duration::from_secs(30)).await;

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(tc.connector.phase(), Phase::Closed);
    assert_eq!(tc.broker.acked(), vec![1]);
    assert_eq!(tc.broker.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn terminate_without_consumer_returns_immediately() {
    let tc = TestCase::new();
    let started = tokio::time::Instant::now();

    tc.connector.terminate(Duration::from_secs(30)).await;

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(tc.connector.phase(), Phase::Idle);
    assert_eq!(tc.broker.close_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn watchdog_is_not_rearmed_while_closing() {
    let tc = TestCase::new();
    let handler = TestHandler::default();

    tc.broker.slow_close(Duration::from_secs(5));
    tc.connector
        .consume_from_queue(&queue_config("jobs", 1, true), handler.handler())
        .await
        .unwrap();

    let connector = tc.connector.clone();
    let close = tokio::spawn(async move { connector.close().await });

    wait_until(|| tc.broker.close_count() == 1).await;
    assert_eq!(tc.connector.phase(), Phase::Draining);

    // a message delivered while the connection is being closed
    tc.connector.rearm_watchdog("jobs", Duration::from_secs(1));

    close.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(tc.broker.count(|c| matches!(c, Call::CheckQueue(_))), 0);
    assert!(tc.errors().is_empty());
}

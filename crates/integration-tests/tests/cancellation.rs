mod harness;

use std::time::Duration;

use conduit_llm::{ChatRequest, Conduit, ConversationTurn, ErrorKind, LlmClient, StreamEvent};
use futures_util::StreamExt;
use harness::config::ConfigBuilder;
use harness::mock_llm::{MockLlm, Reply};
use tokio_util::sync::CancellationToken;

fn client(mock: &MockLlm) -> LlmClient {
    let config = ConfigBuilder::new()
        .with_openai_provider("openai", &mock.openai_base_url(), &["sk-test"])
        .build();
    let conduit = Conduit::from_config(&config.llm).unwrap();
    conduit.client("openai").unwrap().clone()
}

#[tokio::test]
async fn cancel_mid_stream_aborts() {
    let mock = MockLlm::start_with(Reply::stall("thinking")).await.unwrap();
    let client = client(&mock);
    let cancel = CancellationToken::new();

    let mut stream = client.send_message_stream(
        ChatRequest::new(vec![ConversationTurn::user("hi")]).with_cancel(cancel.clone()),
    );

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, StreamEvent::Text("thinking".to_owned()));

    cancel.cancel();
    let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("cancellation should end the stream promptly");
    let err = next.unwrap().unwrap_err();
    assert_eq!(err.category, ErrorKind::Abort);
    assert!(stream.next().await.is_none());

    let health = client.health();
    assert_eq!(health.counters.failures, 0);
    assert_eq!(mock.request_count(), 1);
}

#[tokio::test]
async fn cancel_before_start_sends_nothing() {
    let mock = MockLlm::start().await.unwrap();
    let client = client(&mock);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client
        .send_prompt("hi", ChatRequest::default().with_cancel(cancel))
        .await
        .unwrap_err();

    assert_eq!(err.category, ErrorKind::Abort);
    assert_eq!(mock.request_count(), 0);
}

#[tokio::test]
async fn dropping_the_stream_releases_the_request() {
    let mock = MockLlm::start_with(Reply::stall("partial")).await.unwrap();
    let client = client(&mock);

    let mut stream = client.send_message_stream(ChatRequest::new(vec![ConversationTurn::user("hi")]));
    assert!(stream.next().await.unwrap().is_ok());
    drop(stream);

    let health = client.health();
    assert_eq!(health.counters.requests, 1);
    assert_eq!(health.counters.successes, 0);
    assert_eq!(health.rolling_window.count, 1);
}

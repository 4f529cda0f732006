// Integration tests for authenticated queries

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use quarry::prelude::*;

fn profile_query(client: &Arc<QueryClient>, calls: &Arc<AtomicUsize>) -> Query<String> {
    let counter = Arc::clone(calls);
    Query::with_session(
        query_key!["getUser", "me"],
        move |token: BearerToken, _cancel| {
            counter.fetch_add(1, Ordering::SeqCst);
            let header = token.authorization();
            async move { Ok::<_, QueryError>(header) }.boxed()
        },
        Arc::clone(client),
    )
}

#[tokio::test]
async fn test_missing_session_is_terminal() {
    let session = Arc::new(SessionStore::new());
    let client = Arc::new(QueryClient::with_session(QueryConfig::default(), Arc::clone(&session)));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut observer = profile_query(&client, &calls).bind();
    let result = observer.wait_for(QueryResult::is_settled).await.unwrap();

    assert!(result.is_error());
    assert!(matches!(result.error, Some(QueryError::FetcherUnavailable(_))));
    // Not retried, and the fetcher never ran.
    assert_eq!(result.retry_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_sign_in_then_invalidate_recovers() {
    let session = Arc::new(SessionStore::new());
    let client = Arc::new(QueryClient::with_session(QueryConfig::default(), Arc::clone(&session)));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut observer = profile_query(&client, &calls).bind();
    observer.wait_for(QueryResult::is_settled).await.unwrap();

    session.sign_in(BearerToken::new("eyJhbGciOi"));
    assert_eq!(client.invalidate_queries("getUser"), 1);
    let result = observer.wait_for(|result| result.is_success()).await.unwrap();

    assert_eq!(result.data(), Some(&"Bearer eyJhbGciOi".to_string()));
    assert!(result.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_token_read_per_fetch() {
    let session = Arc::new(SessionStore::signed_in(BearerToken::new("first")));
    let client = Arc::new(QueryClient::with_session(QueryConfig::default(), Arc::clone(&session)));
    let calls = Arc::new(AtomicUsize::new(0));
    let query = profile_query(&client, &calls);

    assert_eq!(client.fetch_query(&query).await, Ok("Bearer first".to_string()));

    session.sign_in(BearerToken::new("second"));
    assert_eq!(client.fetch_query(&query).await, Ok("Bearer second".to_string()));

    session.sign_out();
    assert!(matches!(
        client.fetch_query(&query).await,
        Err(QueryError::FetcherUnavailable(_))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

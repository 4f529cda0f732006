//! Admin dashboard example demonstrating queries, mutations and invalidation.
//!
//! This example shows:
//! - Authenticated queries reading the session token on every fetch
//! - Several screens observing one booking list with a single fetch
//! - A flaky endpoint recovering through retries
//! - A mutation invalidating the bookings lists it affects
//!
//! The backend is an in-memory fake with artificial latency.
//!
//! Run with: `cargo run --example admin_dashboard`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use quarry::prelude::*;

/// A booking as returned by the backend.
#[derive(Debug, Clone)]
struct Booking {
    id: String,
    status: String,
}

/// In-memory stand-in for the admin API.
#[derive(Default)]
struct Backend {
    bookings: Mutex<Vec<Booking>>,
    vendor_calls: AtomicUsize,
}

impl Backend {
    fn seeded() -> Self {
        let bookings = ["b-1", "b-2", "b-3"]
            .into_iter()
            .map(|id| Booking {
                id: id.to_string(),
                status: "New Bookings".to_string(),
            })
            .collect();
        Self {
            bookings: Mutex::new(bookings),
            ..Self::default()
        }
    }

    async fn bookings(&self, token: &BearerToken, status: &str) -> Result<Vec<Booking>, QueryError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        if token.secret().is_empty() {
            return Err(QueryError::fetch("401 Unauthorized"));
        }
        Ok(self
            .bookings
            .lock()
            .iter()
            .filter(|booking| booking.status == status)
            .cloned()
            .collect())
    }

    async fn vendors(&self) -> Result<Vec<String>, QueryError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The first request fails, as an overloaded server would.
        if self.vendor_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(QueryError::fetch("503 Service Unavailable"));
        }
        Ok(vec!["Acme Catering".to_string(), "Blue Venue".to_string()])
    }

    async fn complete(&self, token: &BearerToken, id: &str) -> Result<Booking, QueryError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if token.secret().is_empty() {
            return Err(QueryError::mutation("401 Unauthorized"));
        }
        let mut bookings = self.bookings.lock();
        let booking = bookings
            .iter_mut()
            .find(|booking| booking.id == id)
            .ok_or_else(|| QueryError::mutation(format!("404 booking {id}")))?;
        booking.status = "Completed".to_string();
        Ok(booking.clone())
    }
}

fn bookings_query(backend: &Arc<Backend>, client: &Arc<QueryClient>, status: &'static str) -> Query<Vec<Booking>> {
    let backend = Arc::clone(backend);
    Query::with_session(
        query_key!["bookings", {"status": status}],
        move |token, _cancel| {
            let backend = Arc::clone(&backend);
            async move { backend.bookings(&token, status).await }.boxed()
        },
        Arc::clone(client),
    )
}

fn describe<T>(name: &str, result: &QueryResult<Vec<T>>) {
    let detail = match (&result.data, &result.error) {
        (Some(items), _) => format!("{} items", items.len()),
        (None, Some(err)) => err.to_string(),
        (None, None) => "no data".to_string(),
    };
    println!(
        "{name:<14} status={:?} fetching={} retries={} {detail}",
        result.status, result.is_fetching, result.retry_count
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let backend = Arc::new(Backend::seeded());
    let session = Arc::new(SessionStore::signed_in(BearerToken::new("admin-session")));
    let config = QueryConfig::default()
        .with_stale_time(Duration::from_secs(30))
        .with_retry(RetryPolicy::new(3, Duration::from_millis(200), Duration::from_secs(2)));
    let client = Arc::new(QueryClient::with_session(config, Arc::clone(&session)));

    // Two screens showing new bookings share one entry and one fetch.
    let new_bookings = bookings_query(&backend, &client, "New Bookings");
    let mut overview = new_bookings.bind();
    let mut sidebar = new_bookings.bind();
    let completed = bookings_query(&backend, &client, "Completed");
    let mut history = completed.bind();
    println!("fetches in flight: {}", client.is_fetching());

    let vendor_backend = Arc::clone(&backend);
    let vendors = Query::new(
        "vendors",
        move |_cancel| {
            let backend = Arc::clone(&vendor_backend);
            async move { backend.vendors().await }.boxed()
        },
        Arc::clone(&client),
    );
    let mut vendor_list = vendors.bind();

    describe("overview", &overview.wait_for(QueryResult::is_settled).await.unwrap_or_else(|| overview.result()));
    describe("sidebar", &sidebar.wait_for(QueryResult::is_settled).await.unwrap_or_else(|| sidebar.result()));
    describe("history", &history.wait_for(QueryResult::is_settled).await.unwrap_or_else(|| history.result()));
    describe("vendors", &vendor_list.wait_for(QueryResult::is_settled).await.unwrap_or_else(|| vendor_list.result()));

    let complete = Mutation::with_session(
        {
            let backend = Arc::clone(&backend);
            move |token, id: String| {
                let backend = Arc::clone(&backend);
                async move { backend.complete(&token, &id).await }.boxed()
            }
        },
        Arc::clone(&client),
    )
    .invalidates("bookings")
    .on_success(|booking| println!("completed {} ({})", booking.id, booking.status))
    .on_error(|err| println!("could not complete booking: {err}"));

    if complete.run("b-2".to_string()).await.is_ok() {
        let refreshed = |result: &QueryResult<Vec<Booking>>| result.is_settled() && !result.is_stale;
        describe("overview", &overview.wait_for(refreshed).await.unwrap_or_else(|| overview.result()));
        describe("history", &history.wait_for(refreshed).await.unwrap_or_else(|| history.result()));
    }

    session.sign_out();
    let _ = complete.run("b-3".to_string()).await;
    println!("vendors cached: {:?}", client.get_query_data::<Vec<String>>("vendors"));
}

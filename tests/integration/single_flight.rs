//! Integration coverage for single-flight fan-out and cancellation isolation.

// std
use std::{sync::atomic::Ordering, time::Duration};
// crates.io
use bearer_cache::{CancellationToken, Error, FixedJitter, ManualClock, Phase, TokenCoordinator};
use futures::future;
// self
use crate::support::{GatedFetcher, epoch, wait_until};

const CALLERS: usize = 32;

fn coordinator(clock: &ManualClock, fetcher: GatedFetcher) -> TokenCoordinator {
	TokenCoordinator::builder()
		.name("single-flight")
		.refresh_skew(Duration::from_secs(60))
		.min_refresh_interval(Duration::from_secs(5))
		.clock(clock.clone())
		.jitter(FixedJitter::ZERO)
		.fetcher(fetcher)
		.build()
		.expect("coordinator")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_fetch() {
	let _ = tracing_subscriber::fmt::try_init();

	let clock = ManualClock::new(epoch());
	let fetcher = GatedFetcher::issuing(&clock, Duration::from_secs(3_600));
	let coordinator = coordinator(&clock, fetcher.clone());
	let callers: Vec<_> = (0..CALLERS)
		.map(|_| {
			let coordinator = coordinator.clone();

			tokio::spawn(async move { coordinator.get_valid_token(&CancellationToken::new()).await })
		})
		.collect();
	let metrics = coordinator.metrics();

	wait_until(|| {
		let snapshot = metrics.snapshot();

		snapshot.refreshes_started + snapshot.joined_flights == CALLERS as u64
	})
	.await;

	assert_eq!(coordinator.status().await.phase, Phase::Refreshing);

	fetcher.release();

	let tokens: Vec<_> = future::join_all(callers)
		.await
		.into_iter()
		.map(|joined| joined.expect("join").expect("token"))
		.collect();

	assert_eq!(fetcher.calls(), 1);
	assert!(tokens.iter().all(|token| token == &tokens[0]));
	assert_eq!(tokens[0].value(), "token-1");

	let snapshot = coordinator.metrics().snapshot();

	assert_eq!(snapshot.refreshes_started, 1);
	assert_eq!(snapshot.joined_flights, CALLERS as u64 - 1);
	assert_eq!(snapshot.refresh_successes, 1);
	assert_eq!(coordinator.status().await.phase, Phase::Fresh);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_failure() {
	let _ = tracing_subscriber::fmt::try_init();

	let clock = ManualClock::new(epoch());
	let fetcher = GatedFetcher::failing(&clock);
	let coordinator = coordinator(&clock, fetcher.clone());
	let callers: Vec<_> = (0..CALLERS)
		.map(|_| {
			let coordinator = coordinator.clone();

			tokio::spawn(async move { coordinator.get_valid_token(&CancellationToken::new()).await })
		})
		.collect();
	let metrics = coordinator.metrics();

	wait_until(|| {
		let snapshot = metrics.snapshot();

		snapshot.refreshes_started + snapshot.joined_flights == CALLERS as u64
	})
	.await;

	fetcher.release();

	let errors: Vec<_> = future::join_all(callers)
		.await
		.into_iter()
		.map(|joined| joined.expect("join").expect_err("fetch must fail"))
		.collect();

	assert_eq!(fetcher.calls(), 1);

	for err in &errors {
		assert!(matches!(err, Error::Fetch(_)), "{err:?}");
		assert_eq!(err.to_string(), "Token fetch failed: upstream rejected attempt 1");
	}

	let status = coordinator.status().await;

	assert_eq!(status.phase, Phase::Empty);
	assert!(status.refresh_started_at.is_none());

	// The in-flight slot was cleared, so the next caller starts a new attempt.
	let retry = {
		let coordinator = coordinator.clone();

		tokio::spawn(async move { coordinator.get_valid_token(&CancellationToken::new()).await })
	};

	wait_until(|| fetcher.calls() == 2).await;
	fetcher.release();

	let err = retry.await.expect("join").expect_err("second attempt fails too");

	assert_eq!(err.to_string(), "Token fetch failed: upstream rejected attempt 2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initiator_cancellation_does_not_abort_shared_refresh() {
	let _ = tracing_subscriber::fmt::try_init();

	let clock = ManualClock::new(epoch());
	let fetcher = GatedFetcher::issuing(&clock, Duration::from_secs(3_600));
	let coordinator = coordinator(&clock, fetcher.clone());
	let initiator_cancel = CancellationToken::new();
	let initiator = {
		let coordinator = coordinator.clone();
		let cancel = initiator_cancel.clone();

		tokio::spawn(async move { coordinator.get_valid_token(&cancel).await })
	};

	wait_until(|| fetcher.calls() == 1).await;

	let joiner = {
		let coordinator = coordinator.clone();

		tokio::spawn(async move { coordinator.get_valid_token(&CancellationToken::new()).await })
	};
	let metrics = coordinator.metrics();

	wait_until(|| metrics.snapshot().joined_flights == 1).await;

	initiator_cancel.cancel();

	let err = initiator.await.expect("join").expect_err("initiator cancelled");

	assert!(matches!(err, Error::Cancelled), "{err:?}");

	fetcher.release();

	let token = joiner.await.expect("join").expect("joiner still receives the token");

	assert_eq!(token.value(), "token-1");
	assert_eq!(fetcher.calls(), 1);
	assert_eq!(fetcher.saw_cancellation.load(Ordering::SeqCst), 0);
	assert_eq!(coordinator.cached_token(), Some(token));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_refresh_still_populates_the_cache() {
	let _ = tracing_subscriber::fmt::try_init();

	let clock = ManualClock::new(epoch());
	let fetcher = GatedFetcher::issuing(&clock, Duration::from_secs(3_600));
	let coordinator = coordinator(&clock, fetcher.clone());
	let cancel = CancellationToken::new();
	let caller = {
		let coordinator = coordinator.clone();
		let cancel = cancel.clone();

		tokio::spawn(async move { coordinator.get_valid_token(&cancel).await })
	};

	wait_until(|| fetcher.calls() == 1).await;
	cancel.cancel();

	assert!(matches!(caller.await.expect("join"), Err(Error::Cancelled)));

	fetcher.release();

	wait_until(|| coordinator.cached_token().is_some()).await;

	let token = coordinator.get_valid_token(&CancellationToken::new()).await.expect("token");

	assert_eq!(token.value(), "token-1");
	assert_eq!(fetcher.calls(), 1);
}

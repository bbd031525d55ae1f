//! Integration coverage for refresh timing: skew, jitter, cooldown and expiry.

// std
use std::time::Duration;
// crates.io
use bearer_cache::{
	CancellationToken, Clock, FixedJitter, ManualClock, Phase, RandomJitter, RefreshPolicy,
	TokenCoordinator,
};
use chrono::TimeDelta;
// self
use crate::support::{GatedFetcher, epoch};

fn open_fetcher(clock: &ManualClock, ttl: Duration) -> GatedFetcher {
	let fetcher = GatedFetcher::issuing(clock, ttl);

	fetcher.gate.add_permits(64);

	fetcher
}

#[tokio::test]
async fn configured_policy_drives_cooldown_boundaries() -> bearer_cache::Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let policy: RefreshPolicy = serde_json::from_str(
		r#"{
			"refresh_skew": { "secs": 60, "nanos": 0 },
			"min_refresh_interval": { "secs": 5, "nanos": 0 },
			"jitter_ratio": 0.0
		}"#,
	)
	.expect("policy");
	let clock = ManualClock::new(epoch());
	// Every issued token is already inside its refresh window but far from expiry.
	let fetcher = open_fetcher(&clock, Duration::from_secs(45));
	let coordinator = TokenCoordinator::builder()
		.name("cooldown")
		.policy(policy)
		.clock(clock.clone())
		.jitter(FixedJitter::ZERO)
		.fetcher(fetcher.clone())
		.build()?;
	let cancel = CancellationToken::new();
	let first = coordinator.get_valid_token(&cancel).await?;

	assert_eq!(coordinator.status().await.phase, Phase::Due);

	clock.set(epoch() + TimeDelta::milliseconds(4_999));

	assert_eq!(coordinator.get_valid_token(&cancel).await?, first);
	assert_eq!(fetcher.calls(), 1);

	clock.set(epoch() + TimeDelta::milliseconds(5_001));

	let second = coordinator.get_valid_token(&cancel).await?;

	assert_eq!(second.value(), "token-2");
	assert_eq!(fetcher.calls(), 2);
	assert_eq!(
		coordinator.status().await.last_refresh_at,
		Some(epoch() + TimeDelta::milliseconds(5_001))
	);

	Ok(())
}

#[tokio::test]
async fn expiry_overrides_cooldown() -> bearer_cache::Result<()> {
	let clock = ManualClock::new(epoch());
	let fetcher = open_fetcher(&clock, Duration::from_secs(2));
	let coordinator = TokenCoordinator::builder()
		.min_refresh_interval(Duration::from_secs(30))
		.clock(clock.clone())
		.fetcher(fetcher.clone())
		.build()?;
	let cancel = CancellationToken::new();

	coordinator.get_valid_token(&cancel).await?;
	clock.advance(Duration::from_secs(3));

	assert_eq!(coordinator.status().await.phase, Phase::Expired);

	let refreshed = coordinator.get_valid_token(&cancel).await?;

	assert_eq!(refreshed.value(), "token-2");
	assert!(!refreshed.is_expired(clock.now()));
	assert_eq!(fetcher.calls(), 2);

	Ok(())
}

#[tokio::test]
async fn random_jitter_never_reaches_past_its_band() -> bearer_cache::Result<()> {
	let clock = ManualClock::new(epoch());
	// Skew 60 s plus at most 30 s of jitter: a token 91 s from expiry is always fresh.
	let fetcher = open_fetcher(&clock, Duration::from_secs(91));
	let coordinator = TokenCoordinator::builder()
		.refresh_skew(Duration::from_secs(60))
		.jitter_ratio(0.5)
		.clock(clock.clone())
		.jitter(RandomJitter)
		.fetcher(fetcher.clone())
		.build()?;
	let cancel = CancellationToken::new();
	let first = coordinator.get_valid_token(&cancel).await?;

	for _ in 0..1_000 {
		assert_eq!(coordinator.get_valid_token(&cancel).await?, first);
	}

	assert_eq!(fetcher.calls(), 1);
	assert_eq!(coordinator.metrics().snapshot().fresh_hits, 1_000);

	Ok(())
}

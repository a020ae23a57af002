//! bloomd — HyperBloom feed daemon.
//!
//! Usage: `bloomd [FEED_KEY_HEX ...]`. The node's own feed and every feed
//! in `feeds.join` are joined as well.

use std::time::Duration;

use anyhow::{Context, Result};

use bloom_core::config::{parse_feed_key, BloomConfig};
use bloom_core::short_hex;
use bloom_services::ValueNodeFactory;
use hyperbloom::{BloomOptions, HyperBloom, JoinOptions};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = BloomConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BloomConfig::load().context("failed to load config")?;

    let keypair = config
        .identity
        .load_or_generate()
        .context("failed to load keypair")?;
    tracing::info!(public_key = hex::encode(keypair.public), "keypair ready");

    let mut feeds = vec![keypair.public];
    feeds.extend(config.feeds.feed_keys()?);
    for arg in std::env::args().skip(1) {
        feeds.push(parse_feed_key(&arg).with_context(|| format!("bad feed key argument {arg:?}"))?);
    }

    let options = BloomOptions::from_config(&config, &keypair)?;
    let bloom = HyperBloom::new(options, ValueNodeFactory)?;

    let port = bloom.listen(Some(config.discovery.port)).await?;
    tracing::info!(
        port,
        routing = ?config.discovery.routing,
        storage = %config.storage.path.display(),
        "bloomd listening"
    );

    let join = if config.feeds.full {
        JoinOptions::default()
    } else {
        JoinOptions::light()
    };
    for feed in feeds {
        match bloom.join(feed, join).await {
            Ok(node) => tracing::info!(
                feed = short_hex(&feed),
                values = node.len(),
                "feed ready"
            ),
            Err(e) => tracing::warn!(feed = short_hex(&feed), error = %e, "join failed"),
        }
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                let stats = bloom.stats();
                tracing::info!(
                    feeds = stats.feeds,
                    handed_off = stats.router.handed_off,
                    destroyed = stats.router.destroyed,
                    unknown_feed = stats.router.unknown_feed,
                    timed_out = stats.router.timed_out,
                    "controller snapshot"
                );
            }
        }
    }

    bloom.close().await?;
    tracing::info!("bloomd stopped");
    Ok(())
}

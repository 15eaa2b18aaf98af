// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Long-lived cache groomer task. Wakes on an interval, runs one
//! [`ArtifactCache::groom`] pass, exits on cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ArtifactCache;

/// Spawns the groomer. The handle resolves once the token is cancelled.
pub fn spawn_groomer(
    cache: Arc<ArtifactCache>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so construction-time
        // imports settle before the first sweep.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("cache groomer stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let cache = cache.clone();
                    // Grooming is filesystem-bound; keep it off the runtime.
                    let _ = tokio::task::spawn_blocking(move || cache.groom()).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::CacheConfig;
    use crate::infrastructure::metrics::MetricsService;

    #[tokio::test]
    async fn test_groomer_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let cache = Arc::new(ArtifactCache::new(&config, MetricsService::new().unwrap()).unwrap());
        let cancel = CancellationToken::new();
        let handle = spawn_groomer(cache, Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("groomer did not stop")
            .unwrap();
    }
}

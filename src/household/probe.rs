//! Household warmup probe and session control
//!
//! Before the concurrent simulation, a 10 s bulk download measures the
//! link's achievable rate; the 80th-percentile sample becomes the adaptive
//! `computer` profile's download target, pushed to the server with exactly
//! one POST. Teardown goes through the central stop relay (the per-process
//! direct stop endpoints are dead protocol and are not spoken here).

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::percentile;
use crate::types::TestId;
use futures::StreamExt;
use std::time::{Duration, Instant};

/// Sampling cadence within the bulk download
const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Measure achievable download throughput via the bulk-download endpoint.
///
/// Consumes the stream for the configured window (default 10 s) under an
/// outer deadline that adds the grace period for connect and slow starts.
/// Returns the 80th-percentile throughput in Mbps.
///
/// An unreachable endpoint is fatal: the household run cannot size its bulk
/// user without it.
pub(crate) async fn measure_bulk_download_mbps(
    http: &reqwest::Client,
    config: &Config,
) -> Result<f64> {
    let url = config.endpoints.warmup_bulk_url()?;
    let window = config.timeouts.warmup_download;
    let grace = config.timeouts.warmup_grace;

    let result = tokio::time::timeout(window + grace, async {
        let response = http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Fatal(format!("cannot reach warmup endpoint: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Fatal(format!(
                "warmup endpoint returned {}",
                response.status().as_u16()
            )));
        }

        let mut body = response.bytes_stream();
        let deadline = Instant::now() + window;
        let mut samples: Vec<f64> = Vec::new();
        let mut interval_bytes: u64 = 0;
        let mut interval_start = Instant::now();

        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = tokio::time::sleep_until((interval_start + SAMPLE_INTERVAL).into()) => {
                    let elapsed = interval_start.elapsed().as_secs_f64();
                    samples.push(interval_bytes as f64 * 8.0 / elapsed / 1_000_000.0);
                    interval_bytes = 0;
                    interval_start = Instant::now();
                    if Instant::now() >= deadline {
                        break;
                    }
                    continue;
                }
            };

            match chunk {
                Some(Ok(bytes)) => {
                    interval_bytes += bytes.len() as u64;
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                Some(Err(e)) => {
                    // A mid-stream hiccup ends sampling; whatever was
                    // collected still counts
                    tracing::warn!(error = %e, "bulk download ended early");
                    break;
                }
                None => break,
            }
        }

        // Flush the partial interval so a stream shorter than one sample
        // period (fast links, short bodies) still measures
        if interval_bytes > 0 {
            let elapsed = interval_start.elapsed().as_secs_f64().max(1e-3);
            samples.push(interval_bytes as f64 * 8.0 / elapsed / 1_000_000.0);
        }

        Ok(samples)
    })
    .await;

    let samples = match result {
        Err(_) => {
            return Err(Error::Fatal(format!(
                "warmup download did not finish within {:?}",
                window + grace
            )));
        }
        Ok(samples) => samples?,
    };

    percentile(&samples, 0.8)
        .filter(|mbps| *mbps > 0.0)
        .ok_or_else(|| Error::Fatal("warmup download measured no throughput".into()))
}

/// Push the adaptive profile to the computer user endpoint.
///
/// Exactly one POST, no retry; the caller decides whether a failure keeps
/// the default target. The household phase must not begin until this call
/// has returned.
pub(crate) async fn push_computer_profile(
    http: &reqwest::Client,
    config: &Config,
    download_mbps: f64,
    upload_mbps: f64,
) -> Result<()> {
    let url = config.endpoints.profile_update_url("computer")?;
    let body = serde_json::json!({
        "user_type": "computer",
        "profile_updates": {
            "download_mbps": download_mbps,
            "upload_mbps": upload_mbps,
            "description": format!("Adaptive bulk profile ({download_mbps:.1} Mbps)"),
        }
    });

    let response = http
        .post(url.clone())
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Transport(e.into()))?;

    if !response.status().is_success() {
        return Err(Error::bad_status(response.status().as_u16(), url.path()));
    }
    tracing::info!(download_mbps, upload_mbps, "computer profile update accepted");
    Ok(())
}

/// Ask the central relay to stop this run's user sessions. Best effort:
/// failures are logged, never surfaced.
pub(crate) async fn relay_stop_sessions(
    http: &reqwest::Client,
    config: &Config,
    test_id: Option<TestId>,
) {
    let target = test_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "all".to_string());
    let url = match config.endpoints.stop_sessions_url(&target) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!(error = %e, "cannot build stop relay URL");
            return;
        }
    };

    let mut body = serde_json::json!({
        "action": "stop",
        "reason": "test_complete",
    });
    if let Some(id) = test_id
        && let Some(map) = body.as_object_mut()
    {
        map.insert("test_id".into(), serde_json::json!(id.get()));
    }

    match http.post(url).json(&body).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(target = %target, "stop relay acknowledged");
        }
        Ok(response) => {
            tracing::debug!(status = response.status().as_u16(), "stop relay refused");
        }
        Err(e) => {
            tracing::debug!(error = %e, "stop relay unreachable");
        }
    }
}

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::config::{BenchmarkConfig, RunMode};
use crate::metrics::{aggregate, RequestOutcome};
use crate::report::SummaryReport;

/// Runs one benchmark: warmup, worker pool, outcome collection, then a
/// single aggregation over the collected outcomes and the measured
/// wall-clock duration.
pub async fn run_benchmark(config: BenchmarkConfig) -> Result<SummaryReport> {
    let client = Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("failed to construct HTTP client")?;

    let concurrency = config.concurrency;
    let planned_total = match &config.mode {
        RunMode::Finite {
            requests_per_worker,
        } => Some((concurrency * *requests_per_worker) as u64),
        RunMode::Timed { .. } => None,
    };

    let config = Arc::new(config);

    run_warmup(&client, &config).await;

    let start = Instant::now();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();

    let collector = tokio::spawn(collect_outcomes(outcome_rx, planned_total, status_tx));
    let tracker = tokio::spawn(track_status(status_rx, start));

    let mut join_set = JoinSet::new();
    for worker_id in 0..concurrency {
        let client = client.clone();
        let config = Arc::clone(&config);
        let tx = outcome_tx.clone();
        join_set.spawn(async move { run_worker(worker_id, client, config, tx).await });
    }
    drop(outcome_tx);

    while let Some(join_result) = join_set.join_next().await {
        join_result??;
    }
    let elapsed = start.elapsed();

    // Workers dropped their senders, so the collector drains and returns;
    // its status sender closes in turn and the tracker finishes its redraw.
    let outcomes = collector.await?;
    tracker
        .await
        .map_err(|err| anyhow!("status tracker task failed: {}", err))?;

    Ok(aggregate(&outcomes, Some(elapsed)))
}

async fn run_warmup(client: &Client, config: &BenchmarkConfig) {
    if config.warmup_requests == 0 {
        return;
    }
    println!("Warming up with {} requests...", config.warmup_requests);

    let mut join_set = JoinSet::new();
    for i in 0..config.warmup_requests {
        let body = match config.request_body_for(i % config.concurrency) {
            Ok(body) => body.clone(),
            Err(_) => config.request_body.clone(),
        };
        let client = client.clone();
        let endpoint = config.endpoint.clone();
        let headers = config.headers.clone();
        join_set.spawn(async move {
            let mut request = client.post(endpoint);
            for (name, value) in headers.iter() {
                request = request.header(name, value);
            }
            if let Ok(response) = request.json(&body).send().await {
                let _ = response.bytes().await;
            }
        });
    }
    while join_set.join_next().await.is_some() {}
    println!("Warmup complete.");
}

async fn collect_outcomes(
    mut rx: mpsc::UnboundedReceiver<RequestOutcome>,
    planned_total: Option<u64>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
) -> Vec<RequestOutcome> {
    let mut outcomes = Vec::new();
    let mut successes = 0u64;
    let mut failures = 0u64;
    let mut completion_tokens = 0u64;

    let _ = status_tx.send(StatusUpdate {
        successes,
        failures,
        completion_tokens,
        planned_total,
    });
    while let Some(outcome) = rx.recv().await {
        match &outcome {
            RequestOutcome::Success {
                completion_tokens: tokens,
                ..
            } => {
                successes += 1;
                completion_tokens += tokens;
            }
            RequestOutcome::Failure { .. } => failures += 1,
        }
        outcomes.push(outcome);
        let _ = status_tx.send(StatusUpdate {
            successes,
            failures,
            completion_tokens,
            planned_total,
        });
    }
    outcomes
}

async fn run_worker(
    worker_id: usize,
    client: Client,
    config: Arc<BenchmarkConfig>,
    tx: mpsc::UnboundedSender<RequestOutcome>,
) -> Result<()> {
    match config.mode.clone() {
        RunMode::Finite {
            requests_per_worker,
        } => {
            for _ in 0..requests_per_worker {
                issue_request(worker_id, &client, &config, &tx).await?;
            }
        }
        RunMode::Timed { duration } => {
            let deadline = Instant::now() + duration;
            while Instant::now() < deadline {
                issue_request(worker_id, &client, &config, &tx).await?;
            }
        }
    }

    Ok(())
}

/// Issues one logical request, retrying per the configured policy. Every
/// attempt is timed independently; the request is recorded once, either as
/// the successful attempt's outcome or as a failure carrying the last
/// attempt's error and latency.
async fn issue_request(
    worker_id: usize,
    client: &Client,
    config: &BenchmarkConfig,
    tx: &mpsc::UnboundedSender<RequestOutcome>,
) -> Result<()> {
    let body = config.request_body_for(worker_id)?.clone();
    let retry = config.retry;

    let mut last_error = String::new();
    let mut last_latency = Duration::ZERO;
    for attempt in 1..=retry.max_attempts {
        match single_attempt(client, config, &body).await {
            Ok(outcome) => {
                tx.send(outcome)
                    .map_err(|_| anyhow!("outcome channel closed mid-run"))?;
                return Ok(());
            }
            Err(failed) => {
                eprintln!(
                    "worker {}: attempt {}/{} failed: {}",
                    worker_id, attempt, retry.max_attempts, failed.error
                );
                last_error = failed.error;
                last_latency = failed.latency;
                if attempt < retry.max_attempts && !retry.delay.is_zero() {
                    sleep(retry.delay).await;
                }
            }
        }
    }

    tx.send(RequestOutcome::failure(last_error, last_latency))
        .map_err(|_| anyhow!("outcome channel closed mid-run"))?;
    Ok(())
}

struct AttemptFailure {
    error: String,
    latency: Duration,
}

async fn single_attempt(
    client: &Client,
    config: &BenchmarkConfig,
    body: &Value,
) -> Result<RequestOutcome, AttemptFailure> {
    let start = Instant::now();
    attempt_inner(client, config, body, start)
        .await
        .map_err(|err| AttemptFailure {
            error: err.to_string(),
            latency: start.elapsed(),
        })
}

async fn attempt_inner(
    client: &Client,
    config: &BenchmarkConfig,
    body: &Value,
    start: Instant,
) -> Result<RequestOutcome> {
    let mut request = client.post(config.endpoint.clone());
    for (name, value) in config.headers.iter() {
        request = request.header(name, value);
    }
    let response = request.json(body).send().await?;
    // First response byte: headers have arrived.
    let ttft = start.elapsed();
    let status = response.status();
    let bytes = response.bytes().await?;
    let latency = start.elapsed();

    if !status.is_success() {
        let log_path = log_failed_response(&bytes).await?;
        let snippet = String::from_utf8_lossy(&bytes);
        return Err(anyhow!(
            "request failed ({}) {} (body logged to {})",
            status,
            snippet,
            log_path.display()
        ));
    }

    let payload: CompletionBody = serde_json::from_slice(&bytes)?;
    if let Some(error) = payload.error {
        return Err(anyhow!("API error: {}", error));
    }
    if let Some(expected) = &config.expected_model {
        let routed = payload.model.as_deref().unwrap_or("<unknown>");
        if routed != expected {
            return Err(anyhow!(
                "response served by model {}, expected {}",
                routed,
                expected
            ));
        }
    }
    let usage = payload
        .usage
        .ok_or_else(|| anyhow!("response missing usage field"))?;

    Ok(RequestOutcome::from_timings(
        ttft,
        latency,
        usage.prompt_tokens,
        usage.completion_tokens,
    ))
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    model: Option<String>,
    usage: Option<Usage>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

static FAILURE_LOG_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Saves a failed attempt's response body under `logs/` and returns the
/// path, so the failure string in the report points at the evidence.
async fn log_failed_response(bytes: &[u8]) -> Result<PathBuf> {
    let logs_dir = env::current_dir()
        .context("failed to resolve current directory")?
        .join("logs");
    fs::create_dir_all(&logs_dir)
        .await
        .with_context(|| format!("failed to create {}", logs_dir.display()))?;

    let path = logs_dir.join(failure_log_name());
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn failure_log_name() -> String {
    // Epoch millis plus a process-wide counter keeps names unique even when
    // several attempts fail within the same millisecond.
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    let sequence = FAILURE_LOG_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("failure-{}-{}.json", millis, sequence)
}

#[derive(Debug, Clone, Copy)]
struct StatusUpdate {
    successes: u64,
    failures: u64,
    completion_tokens: u64,
    planned_total: Option<u64>,
}

async fn track_status(mut updates: mpsc::UnboundedReceiver<StatusUpdate>, start: Instant) {
    let mut latest = StatusUpdate {
        successes: 0,
        failures: 0,
        completion_tokens: 0,
        planned_total: None,
    };

    while let Some(update) = updates.recv().await {
        latest = update;
        render_status(&latest, start, true);
    }

    render_status(&latest, start, false);
}

fn render_status(status: &StatusUpdate, start: Instant, stay: bool) {
    let elapsed = start.elapsed().as_secs_f64();
    let throughput = if elapsed > 0.0 {
        status.completion_tokens as f64 / elapsed
    } else {
        0.0
    };
    let completed = status.successes + status.failures;
    let planned_text = status
        .planned_total
        .map(|total| format!(" / {}", total))
        .unwrap_or_default();

    print!(
        "\r\x1b[2KCompletion tokens: {} ({:.2} tok/s)\n\x1b[2KRequests: {}{}\n\x1b[2KFailures: {}\n",
        status.completion_tokens, throughput, completed, planned_text, status.failures
    );

    if stay {
        print!("\x1b[3A\r");
    }

    let _ = io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_body_parses_usage() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "hi"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 34, "total_tokens": 46}
        }"#;
        let body: CompletionBody = serde_json::from_str(raw).expect("valid payload");
        assert_eq!(body.model.as_deref(), Some("gpt-4o-mini"));
        assert!(body.error.is_none());
        let usage = body.usage.expect("usage present");
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 34);
    }

    #[test]
    fn completion_tokens_default_to_zero() {
        let raw = r#"{"usage": {"prompt_tokens": 7}}"#;
        let body: CompletionBody = serde_json::from_str(raw).expect("valid payload");
        assert_eq!(body.usage.expect("usage present").completion_tokens, 0);
    }

    #[test]
    fn error_payloads_are_detected() {
        let raw = r#"{"error": {"message": "model overloaded", "type": "server_error"}}"#;
        let body: CompletionBody = serde_json::from_str(raw).expect("valid payload");
        assert!(body.error.is_some());
        assert!(body.usage.is_none());
    }

    #[test]
    fn failure_log_names_are_unique() {
        let first = failure_log_name();
        let second = failure_log_name();
        assert_ne!(first, second);
        assert!(first.starts_with("failure-"));
        assert!(first.ends_with(".json"));
    }
}

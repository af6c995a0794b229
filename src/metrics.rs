use std::time::Duration;

use crate::report::{Compliance, MetricStats, SummaryReport, Throughput};

/// TTFT p95 ceiling for the standard workload class, in seconds.
pub const STANDARD_TTFT_P95_MAX: f64 = 2.0;
/// TPOT p95 ceiling for the standard workload class, in seconds.
pub const STANDARD_TPOT_P95_MAX: f64 = 0.100;
/// TTFT p95 ceiling for the interactive workload class, in seconds.
pub const INTERACTIVE_TTFT_P95_MAX: f64 = 0.5;
/// TPOT p95 ceiling for the interactive workload class, in seconds.
pub const INTERACTIVE_TPOT_P95_MAX: f64 = 0.030;

/// The measured outcome of one completion request.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Success {
        /// Time from dispatch to the first response byte.
        ttft: Duration,
        /// Average generation time per token after the first.
        tpot: Duration,
        /// Time from dispatch to the fully read response body.
        latency: Duration,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Failure {
        error: String,
        /// Time observed before the request was abandoned.
        latency: Duration,
    },
}

impl RequestOutcome {
    /// Builds a success outcome from raw timings.
    ///
    /// TPOT is `(latency - ttft) / (completion_tokens - 1)`: the first token
    /// is attributed to TTFT, so completions of one token or fewer report a
    /// TPOT of zero.
    pub fn from_timings(
        ttft: Duration,
        latency: Duration,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Self {
        let tpot = if completion_tokens > 1 {
            latency
                .saturating_sub(ttft)
                .div_f64((completion_tokens - 1) as f64)
        } else {
            Duration::ZERO
        };
        RequestOutcome::Success {
            ttft,
            tpot,
            latency,
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn failure(error: impl Into<String>, latency: Duration) -> Self {
        RequestOutcome::Failure {
            error: error.into(),
            latency,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }
}

/// Reduces one run's outcomes to a single summary.
///
/// Pure: the input is only read, and the report is recomputed fresh on every
/// call. Edge cases degrade instead of erroring: empty input yields an
/// all-zero report with `error_rate` 1.0, and a run with no successes yields
/// zeroed percentile and throughput fields. When `elapsed` is absent or zero
/// the throughput figures are estimated from mean request latency and the
/// report marks them as such.
pub fn aggregate(outcomes: &[RequestOutcome], elapsed: Option<Duration>) -> SummaryReport {
    let num_requests = outcomes.len() as u64;

    let mut ttfts = Vec::new();
    let mut tpots = Vec::new();
    let mut latencies = Vec::new();
    let mut total_prompt_tokens = 0u64;
    let mut total_completion_tokens = 0u64;
    let mut failures = Vec::new();

    for outcome in outcomes {
        match outcome {
            RequestOutcome::Success {
                ttft,
                tpot,
                latency,
                prompt_tokens,
                completion_tokens,
            } => {
                ttfts.push(ttft.as_secs_f64());
                tpots.push(tpot.as_secs_f64());
                latencies.push(latency.as_secs_f64());
                total_prompt_tokens += prompt_tokens;
                total_completion_tokens += completion_tokens;
            }
            RequestOutcome::Failure { error, .. } => failures.push(error.clone()),
        }
    }

    let num_successful = latencies.len() as u64;
    let num_failed = num_requests - num_successful;

    // An empty run reports error_rate 1.0: nothing succeeded.
    let (error_rate, success_rate) = if num_requests == 0 {
        (1.0, 0.0)
    } else {
        (
            num_failed as f64 / num_requests as f64,
            num_successful as f64 / num_requests as f64,
        )
    };

    let ttft = summarize(&mut ttfts);
    let tpot = summarize(&mut tpots);
    let latency = summarize(&mut latencies);

    let total_tokens = total_prompt_tokens + total_completion_tokens;
    let (avg_prompt_tokens, avg_completion_tokens, avg_total_tokens) = if num_successful > 0 {
        let n = num_successful as f64;
        (
            total_prompt_tokens as f64 / n,
            total_completion_tokens as f64 / n,
            total_tokens as f64 / n,
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    let throughput = compute_throughput(
        num_successful,
        total_tokens,
        avg_completion_tokens,
        latency.mean,
        elapsed,
    );

    // A run with no successes is never compliant; its zeroed percentiles
    // would pass the ceilings vacuously.
    let compliance = if num_successful == 0 {
        Compliance::default()
    } else {
        Compliance {
            standard: meets_thresholds(ttft.p95, tpot.p95, false),
            interactive: meets_thresholds(ttft.p95, tpot.p95, true),
        }
    };

    SummaryReport {
        num_requests,
        num_successful,
        num_failed,
        error_rate,
        success_rate,
        ttft,
        tpot,
        latency,
        total_prompt_tokens,
        total_completion_tokens,
        total_tokens,
        avg_prompt_tokens,
        avg_completion_tokens,
        avg_total_tokens,
        throughput,
        compliance,
        failures,
    }
}

/// Applies the fixed p95 latency ceilings for a workload class.
///
/// standard: TTFT <= 2.0s and TPOT <= 100ms.
/// interactive: TTFT <= 0.5s and TPOT <= 30ms.
pub fn meets_thresholds(ttft_p95: f64, tpot_p95: f64, interactive: bool) -> bool {
    let (ttft_max, tpot_max) = if interactive {
        (INTERACTIVE_TTFT_P95_MAX, INTERACTIVE_TPOT_P95_MAX)
    } else {
        (STANDARD_TTFT_P95_MAX, STANDARD_TPOT_P95_MAX)
    };
    ttft_p95 <= ttft_max && tpot_p95 <= tpot_max
}

fn compute_throughput(
    num_successful: u64,
    total_tokens: u64,
    avg_completion_tokens: f64,
    mean_latency: f64,
    elapsed: Option<Duration>,
) -> Throughput {
    match elapsed {
        Some(elapsed) if !elapsed.is_zero() => {
            let secs = elapsed.as_secs_f64();
            Throughput {
                tokens_per_sec: total_tokens as f64 / secs,
                requests_per_sec: num_successful as f64 / secs,
                estimated: false,
            }
        }
        // No usable wall-clock duration: approximate from mean latency.
        _ if num_successful > 0 && mean_latency > 0.0 => Throughput {
            tokens_per_sec: avg_completion_tokens / mean_latency,
            requests_per_sec: 1.0 / mean_latency,
            estimated: true,
        },
        _ => Throughput {
            tokens_per_sec: 0.0,
            requests_per_sec: 0.0,
            estimated: false,
        },
    }
}

fn summarize(values: &mut [f64]) -> MetricStats {
    if values.is_empty() {
        return MetricStats::default();
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let median = percentile(values, 50.0);
    MetricStats {
        mean,
        median,
        min: values[0],
        max: values[values.len() - 1],
        p50: median,
        p90: percentile(values, 90.0),
        p95: percentile(values, 95.0),
        p99: percentile(values, 99.0),
    }
}

/// Percentile over a sorted slice by linear interpolation between the two
/// closest ranks. Empty input yields 0.0.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let clamped = pct.clamp(0.0, 100.0) / 100.0;
    let rank = (sorted.len() - 1) as f64 * clamped;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

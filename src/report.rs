use std::fmt;

use serde::Serialize;

use crate::metrics::{
    INTERACTIVE_TPOT_P95_MAX, INTERACTIVE_TTFT_P95_MAX, STANDARD_TPOT_P95_MAX,
    STANDARD_TTFT_P95_MAX,
};

/// Distribution summary for one timing metric, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Run-level throughput figures.
///
/// `estimated` marks figures derived from mean request latency because no
/// wall-clock duration was supplied; those are an approximation and not
/// comparable to wall-clock numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub tokens_per_sec: f64,
    pub requests_per_sec: f64,
    pub estimated: bool,
}

/// Pass/fail against the fixed p95 ceilings for each workload class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Compliance {
    pub standard: bool,
    pub interactive: bool,
}

/// Aggregated view of one benchmark run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SummaryReport {
    pub num_requests: u64,
    pub num_successful: u64,
    pub num_failed: u64,
    pub error_rate: f64,
    pub success_rate: f64,
    pub ttft: MetricStats,
    pub tpot: MetricStats,
    pub latency: MetricStats,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub avg_prompt_tokens: f64,
    pub avg_completion_tokens: f64,
    pub avg_total_tokens: f64,
    pub throughput: Throughput,
    pub compliance: Compliance,
    pub failures: Vec<String>,
}

impl fmt::Display for SummaryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "  Benchmark Results")?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(
            f,
            "Requests: {}/{} succeeded ({:.1}%)",
            self.num_successful,
            self.num_requests,
            self.success_rate * 100.0
        )?;

        writeln!(f, "\nTime to First Token (TTFT):")?;
        write_stats_ms(f, &self.ttft)?;
        writeln!(f, "\nTime Per Output Token (TPOT):")?;
        write_stats_ms(f, &self.tpot)?;
        writeln!(f, "\nEnd-to-End Latency:")?;
        writeln!(
            f,
            "  mean={:.3}s p50={:.3}s p95={:.3}s p99={:.3}s",
            self.latency.mean, self.latency.p50, self.latency.p95, self.latency.p99
        )?;

        let estimate_note = if self.throughput.estimated {
            " (estimated from mean latency)"
        } else {
            ""
        };
        writeln!(f, "\nThroughput:")?;
        writeln!(
            f,
            "  {:.2} tokens/sec, {:.2} requests/sec{}",
            self.throughput.tokens_per_sec, self.throughput.requests_per_sec, estimate_note
        )?;

        writeln!(f, "\nToken Counts:")?;
        writeln!(
            f,
            "  total {} ({:.1} avg/request), prompt {} ({:.1} avg), completion {} ({:.1} avg)",
            self.total_tokens,
            self.avg_total_tokens,
            self.total_prompt_tokens,
            self.avg_prompt_tokens,
            self.total_completion_tokens,
            self.avg_completion_tokens
        )?;

        writeln!(f, "\nCompliance:")?;
        writeln!(
            f,
            "  standard:    {} (TTFT p95 {:.3}s <= {:.1}s, TPOT p95 {:.1}ms <= {:.0}ms)",
            pass_fail(self.compliance.standard),
            self.ttft.p95,
            STANDARD_TTFT_P95_MAX,
            self.tpot.p95 * 1000.0,
            STANDARD_TPOT_P95_MAX * 1000.0
        )?;
        writeln!(
            f,
            "  interactive: {} (TTFT p95 {:.3}s <= {:.1}s, TPOT p95 {:.1}ms <= {:.0}ms)",
            pass_fail(self.compliance.interactive),
            self.ttft.p95,
            INTERACTIVE_TTFT_P95_MAX,
            self.tpot.p95 * 1000.0,
            INTERACTIVE_TPOT_P95_MAX * 1000.0
        )?;

        if !self.failures.is_empty() {
            writeln!(f, "\nFailures: {}", self.failures.len())?;
            for error in &self.failures {
                writeln!(f, "  {}", error)?;
            }
        }

        write!(f, "{}", "=".repeat(60))
    }
}

fn write_stats_ms(f: &mut fmt::Formatter<'_>, stats: &MetricStats) -> fmt::Result {
    writeln!(
        f,
        "  mean={:.1}ms p50={:.1}ms p95={:.1}ms p99={:.1}ms",
        stats.mean * 1000.0,
        stats.p50 * 1000.0,
        stats.p95 * 1000.0,
        stats.p99 * 1000.0
    )
}

fn pass_fail(compliant: bool) -> &'static str {
    if compliant {
        "PASS"
    } else {
        "FAIL"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> SummaryReport {
        SummaryReport {
            num_requests: 10,
            num_successful: 9,
            num_failed: 1,
            error_rate: 0.1,
            success_rate: 0.9,
            ttft: MetricStats {
                mean: 0.2,
                median: 0.2,
                min: 0.1,
                max: 0.4,
                p50: 0.2,
                p90: 0.35,
                p95: 0.38,
                p99: 0.4,
            },
            tpot: MetricStats {
                p95: 0.02,
                ..MetricStats::default()
            },
            latency: MetricStats {
                mean: 1.5,
                ..MetricStats::default()
            },
            total_prompt_tokens: 900,
            total_completion_tokens: 450,
            total_tokens: 1350,
            avg_prompt_tokens: 100.0,
            avg_completion_tokens: 50.0,
            avg_total_tokens: 150.0,
            throughput: Throughput {
                tokens_per_sec: 135.0,
                requests_per_sec: 0.9,
                estimated: false,
            },
            compliance: Compliance {
                standard: true,
                interactive: true,
            },
            failures: vec!["timeout".to_string()],
        }
    }

    #[test]
    fn render_includes_every_section() {
        let rendered = sample_report().to_string();
        assert!(rendered.contains("Benchmark Results"));
        assert!(rendered.contains("Requests: 9/10 succeeded (90.0%)"));
        assert!(rendered.contains("Time to First Token (TTFT):"));
        assert!(rendered.contains("Time Per Output Token (TPOT):"));
        assert!(rendered.contains("135.00 tokens/sec, 0.90 requests/sec"));
        assert!(rendered.contains("standard:    PASS"));
        assert!(rendered.contains("interactive: PASS"));
        assert!(rendered.contains("Failures: 1"));
        assert!(rendered.contains("timeout"));
    }

    #[test]
    fn render_marks_estimated_throughput() {
        let mut report = sample_report();
        report.throughput.estimated = true;
        report.compliance.interactive = false;
        let rendered = report.to_string();
        assert!(rendered.contains("(estimated from mean latency)"));
        assert!(rendered.contains("interactive: FAIL"));
    }

    #[test]
    fn serializes_with_nested_sections() {
        let value = serde_json::to_value(sample_report()).expect("report serializes");
        assert_eq!(value["num_requests"], 10);
        assert_eq!(value["ttft"]["p95"], 0.38);
        assert_eq!(value["throughput"]["estimated"], false);
        assert_eq!(value["compliance"]["standard"], true);
        assert_eq!(value["failures"][0], "timeout");
    }
}

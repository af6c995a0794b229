mod config;
mod metrics;
mod report;
mod runner;

pub use config::{BenchmarkConfig, RetryPolicy, RunMode};
pub use metrics::{
    aggregate, meets_thresholds, RequestOutcome, INTERACTIVE_TPOT_P95_MAX,
    INTERACTIVE_TTFT_P95_MAX, STANDARD_TPOT_P95_MAX, STANDARD_TTFT_P95_MAX,
};
pub use report::{Compliance, MetricStats, SummaryReport, Throughput};
pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use runner::run_benchmark;

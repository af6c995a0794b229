use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokenbench::{run_benchmark, BenchmarkConfig, RetryPolicy, RunMode, SummaryReport};

#[derive(Parser, Debug)]
#[command(
    name = "tokenbench",
    about = "Benchmark OpenAI-compatible completion APIs"
)]
struct Args {
    /// Path to the JSONL file whose objects contain a `text` field
    #[arg(long)]
    jsonl: PathBuf,

    /// Number of concurrent workers to spawn (defaults to the number of JSONL rows)
    #[arg(long)]
    workers: Option<usize>,

    /// OpenAI-style model identifier to embed in each request body
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// Treat responses served by any other model as failures
    #[arg(long)]
    check_model_routing: bool,

    /// Host to target (e.g. https://api.openai.com)
    #[arg(long, default_value = "https://api.openai.com")]
    host: String,

    /// Endpoint path or full URL (e.g. /v1/chat/completions)
    #[arg(long, default_value = "/v1/chat/completions")]
    endpoint: String,

    /// Requests per worker in finite mode
    #[arg(long, default_value_t = 1)]
    requests_per_worker: usize,

    /// Run for this many seconds instead of a fixed request count
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Requests issued before measurement starts, excluded from the report
    #[arg(long, default_value_t = 0)]
    warmup: usize,

    /// API key to use; if omitted an environment variable is read
    #[arg(long)]
    api_key: Option<String>,

    /// Environment variable name to read the API key from when --api-key is not supplied
    #[arg(long, default_value = "OPENAI_API_KEY")]
    api_key_env: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 300)]
    request_timeout_secs: u64,

    /// Attempts per request before recording a failure
    #[arg(long, default_value_t = 3)]
    max_attempts: usize,

    /// Delay between attempts in milliseconds
    #[arg(long, default_value_t = 250)]
    retry_delay_ms: u64,

    /// Force the model to emit exactly this many new tokens
    #[arg(long)]
    output_tokens: Option<usize>,

    /// Apply a +/- uniform variation when --output-tokens is provided
    #[arg(long)]
    output_vary: Option<usize>,

    /// Write the summary, wrapped with run metadata, to this JSON file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Exit non-zero when the run misses the standard latency ceilings
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    validate_output_flags(args.output_tokens, args.output_vary)?;

    let api_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var(&args.api_key_env).ok());

    let mut request_bodies = load_request_bodies(&args)
        .with_context(|| format!("failed to load requests from {}", args.jsonl.display()))?;
    let default_body = request_bodies.first().cloned().ok_or_else(|| {
        anyhow!(
            "{} contained no JSON records with a `text` field",
            args.jsonl.display()
        )
    })?;

    let worker_count = args.workers.unwrap_or(request_bodies.len());
    if worker_count == 0 {
        return Err(anyhow!("cannot run with zero workers"));
    }
    if request_bodies.len() < worker_count {
        return Err(anyhow!(
            "{} workers requested but {} only provided {} records",
            worker_count,
            args.jsonl.display(),
            request_bodies.len()
        ));
    }
    request_bodies.truncate(worker_count);

    let endpoint = resolve_endpoint(&args.host, &args.endpoint);
    let mode = match args.duration_secs {
        Some(secs) => RunMode::Timed {
            duration: Duration::from_secs(secs),
        },
        None => RunMode::Finite {
            requests_per_worker: args.requests_per_worker,
        },
    };

    let mut config = BenchmarkConfig::try_new(&endpoint, api_key, worker_count, mode, default_body)?
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs))
        .with_retry(RetryPolicy::new(
            args.max_attempts,
            Duration::from_millis(args.retry_delay_ms),
        ))
        .with_warmup(args.warmup)
        .with_per_worker_bodies(request_bodies)?;

    if args.check_model_routing {
        config = config.with_expected_model(&args.model);
    }

    let report = run_benchmark(config).await?;

    println!("{}", report);

    if let Some(path) = &args.output {
        let metadata = json!({
            "endpoint": endpoint,
            "model": args.model,
            "workers": worker_count,
            "requests_per_worker": args.requests_per_worker,
            "duration_secs": args.duration_secs,
            "warmup_requests": args.warmup,
        });
        write_json_report(path, &report, &metadata)?;
    }

    if args.check && !report.compliance.standard {
        std::process::exit(1);
    }

    Ok(())
}

fn validate_output_flags(tokens: Option<usize>, vary: Option<usize>) -> Result<()> {
    if vary.is_some() && tokens.is_none() {
        return Err(anyhow!("--output-vary requires --output-tokens"));
    }
    if tokens == Some(0) {
        return Err(anyhow!("--output-tokens must be greater than zero"));
    }
    if vary == Some(0) {
        return Err(anyhow!("--output-vary must be greater than zero"));
    }
    Ok(())
}

/// One row of the input file. Extra fields are ignored.
#[derive(Debug, Deserialize)]
struct PromptRecord {
    text: String,
}

fn load_request_bodies(args: &Args) -> Result<Vec<Value>> {
    let file = File::open(&args.jsonl)
        .with_context(|| format!("unable to open {}", args.jsonl.display()))?;

    let mut bodies = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: PromptRecord = serde_json::from_str(&line).with_context(|| {
            format!(
                "line {} is not a JSON object with a string `text` field",
                line_no + 1
            )
        })?;
        bodies.push(chat_body(&args.model, &record.text, forced_output_tokens(args)));
    }

    Ok(bodies)
}

fn chat_body(model: &str, text: &str, forced_tokens: Option<usize>) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [
            {
                "role": "user",
                "content": text,
            }
        ]
    });
    if let Some(tokens) = forced_tokens {
        body["max_tokens"] = json!(tokens);
        body["min_tokens"] = json!(tokens);
    }
    body
}

fn forced_output_tokens(args: &Args) -> Option<usize> {
    let base = args.output_tokens?;
    Some(match args.output_vary {
        Some(vary) => jittered_token_count(base, vary),
        None => base,
    })
}

/// Uniform jitter in [base - vary, base + vary], floored at one token.
fn jittered_token_count(base: usize, vary: usize) -> usize {
    let base = base.min(i64::MAX as usize) as i64;
    let vary = vary.min(i64::MAX as usize) as i64;
    let delta = rand::thread_rng().gen_range(-vary..=vary);
    base.saturating_add(delta).max(1) as usize
}

fn resolve_endpoint(host: &str, path: &str) -> String {
    // A full URL in --endpoint wins over --host.
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }

    let mut base = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    };
    while base.ends_with('/') {
        base.pop();
    }

    format!("{}/{}", base, path.trim_start_matches('/'))
}

fn write_json_report(path: &Path, report: &SummaryReport, metadata: &Value) -> Result<()> {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock set before UNIX_EPOCH")?
        .as_millis() as u64;
    let envelope = json!({
        "timestamp_ms": timestamp_ms,
        "metadata": metadata,
        "metrics": report,
    });

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create report directory {}", parent.display())
            })?;
        }
    }

    let payload = serde_json::to_string_pretty(&envelope)?;
    std::fs::write(path, payload)
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    println!("JSON report saved to {}", path.display());

    Ok(())
}

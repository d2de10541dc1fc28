use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ratewindow::config::{LoggingConfig, RateWindowConfig};
use ratewindow::ratelimit::{resolve_request_id, Admission, LimitRule};
use ratewindow::store::{shared_store, CounterStore};
use ratewindow::{AdmissionGate, RequestContext};

/// Operate sliding window rate limits stored in Redis.
#[derive(Debug, Parser)]
#[command(name = "ratewindow", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate synthetic requests against a rule
    Check {
        #[command(flatten)]
        request: RequestArgs,

        /// Number of requests to send concurrently
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Show the live count for a rule's scope
    Inspect(RequestArgs),
    /// Clear the window for a rule's scope
    Reset(RequestArgs),
    /// List configured rules
    Rules,
}

#[derive(Debug, Args)]
struct RequestArgs {
    /// Name of the configured limit rule
    #[arg(short, long)]
    rule: String,

    /// Request path
    #[arg(short, long, default_value = "/")]
    path: String,

    /// Client address, possibly a comma-separated forwarded-for list
    #[arg(long, default_value = "")]
    client_ip: String,

    /// Propagated request id (X-Request-ID)
    #[arg(long)]
    request_id: Option<String>,
}

impl RequestArgs {
    fn context(&self) -> RequestContext {
        let ctx = RequestContext::new(self.path.clone()).with_client_addr(self.client_ip.clone());
        match &self.request_id {
            Some(id) => ctx.with_header("X-Request-ID", id.clone()),
            None => ctx,
        }
    }
}

#[derive(Debug, Serialize)]
struct CheckLine {
    index: usize,
    admitted: Option<bool>,
    count: Option<u64>,
    remaining: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ScopeLine<'a> {
    rule: &'a str,
    key: String,
    live: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RateWindowConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    init_tracing(&config.logging)?;

    debug!(version = env!("CARGO_PKG_VERSION"), store = %config.store.url, "Configuration loaded");

    match &cli.command {
        Command::Check { request, count } => check(&cli, &config, request, *count).await,
        Command::Inspect(request) => inspect(&cli, &config, request).await,
        Command::Reset(request) => reset(&cli, &config, request).await,
        Command::Rules => list_rules(&cli, &config),
    }
}

/// Initialize tracing from the logging section, letting `RUST_LOG` win.
fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("failed to initialize tracing: {}", e))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("failed to initialize tracing: {}", e))?;
    }

    Ok(())
}

fn find_rule<'a>(config: &'a RateWindowConfig, name: &str) -> anyhow::Result<&'a LimitRule> {
    config
        .limits
        .iter()
        .find(|rule| rule.name == name)
        .ok_or_else(|| anyhow!("no limit rule named '{}'", name))
}

fn gate_for(config: &RateWindowConfig, rule: &LimitRule) -> anyhow::Result<AdmissionGate<()>> {
    let store: Arc<dyn CounterStore> = shared_store(&config.store.options());
    Ok(AdmissionGate::from_rule(rule, store, &config.store, |_| ())?)
}

async fn check(
    cli: &Cli,
    config: &RateWindowConfig,
    args: &RequestArgs,
    count: usize,
) -> anyhow::Result<()> {
    let rule = find_rule(config, &args.rule)?;
    let gate = gate_for(config, rule)?;
    let ctx = args.context();
    let key = gate.scope_key(&ctx);

    info!(rule = %rule.name, key = %key, count = count, "Evaluating requests");

    let (ctx, key, limiter) = (&ctx, &key, gate.limiter());
    let results = join_all((0..count).map(|_| async move {
        let request_id = resolve_request_id(ctx);
        limiter.evaluate(key, &request_id).await
    }))
    .await;

    let mut failed = 0;
    let lines: Vec<CheckLine> = results
        .into_iter()
        .enumerate()
        .map(|(index, result)| match result {
            Ok(admission) => {
                let usage = admission.usage();
                CheckLine {
                    index,
                    admitted: Some(matches!(admission, Admission::Admitted(_))),
                    count: Some(usage.count),
                    remaining: Some(usage.remaining()),
                    error: None,
                }
            }
            Err(err) => {
                failed += 1;
                CheckLine {
                    index,
                    admitted: None,
                    count: None,
                    remaining: None,
                    error: Some(err.to_string()),
                }
            }
        })
        .collect();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
    } else {
        for line in &lines {
            match (&line.error, line.admitted) {
                (Some(err), _) => println!("#{:<4} error     {}", line.index, err),
                (None, Some(true)) => println!(
                    "#{:<4} admitted  count={} remaining={}",
                    line.index,
                    line.count.unwrap_or_default(),
                    line.remaining.unwrap_or_default()
                ),
                (None, _) => println!(
                    "#{:<4} denied    count={}",
                    line.index,
                    line.count.unwrap_or_default()
                ),
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} evaluations failed", failed, count));
    }
    Ok(())
}

async fn inspect(cli: &Cli, config: &RateWindowConfig, args: &RequestArgs) -> anyhow::Result<()> {
    let rule = find_rule(config, &args.rule)?;
    let gate = gate_for(config, rule)?;
    let key = gate.scope_key(&args.context());

    let live = gate.limiter().live_count(&key).await?;
    let line = ScopeLine {
        rule: &rule.name,
        key: key.to_string(),
        live: Some(live),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&line)?);
    } else {
        println!("{} live={} threshold={}", line.key, live, rule.threshold);
    }
    Ok(())
}

async fn reset(cli: &Cli, config: &RateWindowConfig, args: &RequestArgs) -> anyhow::Result<()> {
    let rule = find_rule(config, &args.rule)?;
    let gate = gate_for(config, rule)?;
    let key = gate.scope_key(&args.context());

    gate.limiter().reset(&key).await?;
    info!(rule = %rule.name, key = %key, "Window cleared");

    let line = ScopeLine {
        rule: &rule.name,
        key: key.to_string(),
        live: None,
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&line)?);
    } else {
        println!("cleared {}", line.key);
    }
    Ok(())
}

fn list_rules(cli: &Cli, config: &RateWindowConfig) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&config.limits)?);
        return Ok(());
    }

    if config.limits.is_empty() {
        println!("no limit rules configured");
    }
    for rule in &config.limits {
        println!(
            "{:<20} {:<14} window={}ms threshold={}",
            rule.name,
            format!("{:?}", rule.scope),
            rule.window_ms,
            rule.threshold
        );
    }
    Ok(())
}

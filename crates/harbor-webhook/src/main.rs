//! Harbor webhook - routes pod image pulls through Harbor proxy caches

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use tracing::{error, info, warn};

use harbor_mutate::config::DEFAULT_PAGE_SIZE;
use harbor_mutate::telemetry::{init_tracing, TelemetryConfig};
use harbor_mutate::{
    metrics_router, webhook_router, HarborClient, HarborConfig, ImageRewriter, Metrics,
    PodMutator, ProjectsCache, RefreshTask, RegistryPolicy, WebhookState,
};

/// Default webhook listen address
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9443";

/// Default metrics listen address
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

/// How long in-flight requests get to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Mutating admission webhook that rewrites pod images onto Harbor proxy-cache projects
#[derive(Parser, Debug)]
#[command(name = "harbor-webhook", version, about, long_about = None)]
struct Cli {
    /// Harbor address; its host is also the registry images are rewritten to
    #[arg(long, env = "HARBOR_ADDR")]
    harbor_addr: String,

    /// Harbor API username
    #[arg(long, env = "HARBOR_USER", default_value = "")]
    harbor_user: String,

    /// Harbor API password
    #[arg(long, env = "HARBOR_PASS", default_value = "", hide_env_values = true)]
    harbor_pass: String,

    /// How often projects and proxy-cache registries are refreshed (e.g. 1m, 90s, 1h30m)
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    resync_interval: Duration,

    /// Timeout for each Harbor API call (e.g. 1m, 30s, 500ms)
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    timeout: Duration,

    /// Items per page when listing Harbor projects and registries
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,

    /// Skip TLS certificate verification when talking to Harbor
    #[arg(long)]
    skip_verify: bool,

    /// Address the webhook listens on
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen_addr: SocketAddr,

    /// Address the Prometheus metrics endpoint listens on
    #[arg(long, default_value = DEFAULT_METRICS_ADDR)]
    metrics_addr: SocketAddr,

    /// Directory holding tls.crt and tls.key; plain HTTP when omitted
    #[arg(long, env = "CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn harbor_config(&self) -> HarborConfig {
        HarborConfig {
            address: self.harbor_addr.clone(),
            username: self.harbor_user.clone(),
            password: self.harbor_pass.clone(),
            resync_interval: self.resync_interval,
            timeout: self.timeout,
            skip_verify: self.skip_verify,
            page_size: self.page_size,
            policy: RegistryPolicy::docker_hub(),
        }
    }
}

/// Parse a human-friendly duration such as `1m`, `90s`, `1h30m` or `500ms`
///
/// A bare number is read as seconds.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    let invalid = || format!("invalid duration '{raw}', expected e.g. 1m, 30s, 1h30m, 500ms");

    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let n: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::from_secs(n.saturating_mul(3600)),
            "m" => Duration::from_secs(n.saturating_mul(60)),
            "s" => Duration::from_secs(n),
            "ms" => Duration::from_millis(n),
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total = total.saturating_add(part);
    }
    Ok(total)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_tracing(TelemetryConfig {
        json: cli.log_json,
        ..Default::default()
    })?;

    let config = cli.harbor_config();
    config.validate().context("invalid harbor configuration")?;
    let proxy_host = config.proxy_host()?;

    info!(
        harbor = %config.address,
        proxy_host = %proxy_host,
        resync_interval = ?config.resync_interval,
        timeout = ?config.timeout,
        skip_verify = config.skip_verify,
        "Starting harbor webhook"
    );
    if config.skip_verify {
        warn!("TLS verification of Harbor is disabled");
    }

    let metrics = Arc::new(Metrics::new()?);

    let client = HarborClient::new(&config)?;
    let cache = Arc::new(
        ProjectsCache::new(
            Arc::new(client),
            config.policy.clone(),
            config.refresh_deadline(),
        )
        .with_metrics(metrics.clone()),
    );
    let refresh = RefreshTask::spawn(cache.clone(), config.resync_interval);

    let rewriter = ImageRewriter::new(proxy_host, config.policy.clone());
    let mutator = PodMutator::new(cache, rewriter).with_metrics(metrics.clone());
    let app = webhook_router(Arc::new(WebhookState::new(mutator)));

    let handle = Handle::new();
    let metrics_handle = Handle::new();
    tokio::spawn(shutdown_on_signal(vec![handle.clone(), metrics_handle.clone()]));

    let metrics_addr = cli.metrics_addr;
    let metrics_server = tokio::spawn(async move {
        info!(addr = %metrics_addr, "Serving metrics");
        if let Err(e) = axum_server::bind(metrics_addr)
            .handle(metrics_handle)
            .serve(metrics_router(metrics).into_make_service())
            .await
        {
            error!(error = %e, "Metrics server failed");
        }
    });

    let served = match &cli.cert_dir {
        Some(dir) => {
            let tls_config =
                RustlsConfig::from_pem_file(dir.join("tls.crt"), dir.join("tls.key"))
                    .await
                    .with_context(|| format!("failed to load TLS material from {}", dir.display()))?;
            info!(addr = %cli.listen_addr, "Serving admission webhook over HTTPS");
            axum_server::bind_rustls(cli.listen_addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        None => {
            warn!(
                addr = %cli.listen_addr,
                "No --cert-dir given, serving plain HTTP; the API server will not accept this"
            );
            axum_server::bind(cli.listen_addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    };

    refresh.shutdown().await;
    metrics_server.abort();

    if let Err(e) = &served {
        error!(error = %e, "Webhook server failed");
    }
    served.context("webhook server error")?;

    info!("Harbor webhook stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then drain every server
async fn shutdown_on_signal(handles: Vec<Handle>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Shutdown signal received, draining");
    for handle in handles {
        handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use harbor_mutate::config::{DEFAULT_RESYNC_INTERVAL, DEFAULT_TIMEOUT};

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_library_defaults() {
        let cli = Cli::try_parse_from(["harbor-webhook", "--harbor-addr", "harbor.example.com"]).unwrap();
        let config = cli.harbor_config();

        assert_eq!(config.resync_interval, DEFAULT_RESYNC_INTERVAL);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert!(!config.skip_verify);
        assert_eq!(cli.listen_addr, "0.0.0.0:9443".parse().unwrap());
        assert_eq!(cli.metrics_addr, "0.0.0.0:8080".parse().unwrap());
        assert!(cli.cert_dir.is_none());
    }

    #[test]
    fn flags_map_onto_harbor_config() {
        let cli = Cli::try_parse_from([
            "harbor-webhook",
            "--harbor-addr",
            "https://harbor.example.com",
            "--harbor-user",
            "robot$webhook",
            "--harbor-pass",
            "s3cret",
            "--resync-interval",
            "30s",
            "--timeout",
            "5s",
            "--page-size",
            "50",
            "--skip-verify",
            "--metrics-addr",
            "127.0.0.1:9090",
            "--cert-dir",
            "/etc/webhook/certs",
        ])
        .unwrap();
        let config = cli.harbor_config();

        config.validate().unwrap();
        assert_eq!(config.username, "robot$webhook");
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.page_size, 50);
        assert!(config.skip_verify);
        assert_eq!(config.proxy_host().unwrap(), "harbor.example.com");
        assert_eq!(cli.metrics_addr, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(cli.cert_dir, Some(PathBuf::from("/etc/webhook/certs")));
    }

    #[rstest]
    #[case::minutes("1m", Duration::from_secs(60))]
    #[case::seconds("90s", Duration::from_secs(90))]
    #[case::hours("2h", Duration::from_secs(7200))]
    #[case::compound("1h30m", Duration::from_secs(5400))]
    #[case::millis("500ms", Duration::from_millis(500))]
    #[case::mixed("1m30s250ms", Duration::from_millis(90_250))]
    #[case::bare_seconds("45", Duration::from_secs(45))]
    #[case::padded(" 5m ", Duration::from_secs(300))]
    fn parses_human_durations(#[case] raw: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(raw).unwrap(), expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_number("m")]
    #[case::unknown_unit("5d")]
    #[case::fraction("1.5m")]
    #[case::trailing_digits_only_unit("1m30")]
    fn rejects_malformed_durations(#[case] raw: &str) {
        assert!(parse_duration(raw).is_err());
    }

    #[test]
    fn malformed_duration_flag_is_a_usage_error() {
        let err = Cli::try_parse_from([
            "harbor-webhook",
            "--harbor-addr",
            "harbor.example.com",
            "--resync-interval",
            "soon",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }
}

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{LoggingConfig, RateKeeperConfig};
use ratekeeper::gate::{Gate, GateAction};
use ratekeeper::ratelimit::RequestParts;

#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about = "Adaptive per-route rate limiting")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "ratekeeper.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load the configuration and print the resolved policies and routes
    Validate,

    /// Send synthetic requests through the gate and print each decision
    Probe {
        /// Route identifier to hit
        #[arg(long)]
        route: String,

        /// Client address of the synthetic request
        #[arg(long)]
        ip: IpAddr,

        /// Request header, as NAME=VALUE
        #[arg(long = "header", value_parser = parse_pair)]
        headers: Vec<(String, String)>,

        /// Path variable, as NAME=VALUE
        #[arg(long = "param", value_parser = parse_pair)]
        params: Vec<(String, String)>,

        /// JSON request body
        #[arg(long)]
        body: Option<String>,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got `{}`", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RateKeeperConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    init_tracing(&config.logging);

    info!("Ratekeeper {}", env!("CARGO_PKG_VERSION"));
    info!(
        path = %cli.config.display(),
        backend = ?config.store.backend,
        routes = config.rate_limiting.routes.len(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Validate => validate(&config),
        Command::Probe {
            route,
            ip,
            headers,
            params,
            body,
            count,
        } => {
            let mut request = RequestParts::new().with_peer_addr(SocketAddr::new(ip, 0));
            for (name, value) in headers {
                request = request.with_header(name, value);
            }
            for (name, value) in params {
                request = request.with_path_param(name, value);
            }
            if let Some(body) = body {
                request = request.with_body(body);
            }
            probe(&config, &route, request, count).await
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

fn validate(config: &RateKeeperConfig) -> anyhow::Result<()> {
    let registry = config.build_registry()?;
    let routes = config.build_routes()?;

    println!("default policy: {}", registry.default_policy());
    for (route, policy) in registry.overrides() {
        println!("override {}: {}", route, policy);
    }
    for spec in routes.routes() {
        let keys: Vec<String> = spec
            .keys
            .sources()
            .iter()
            .map(|s| format!("{}[{}]", s.source, s.names.join(",")))
            .collect();
        let limit = match &spec.limit {
            Some(policy) => format!("inline {}", policy),
            None => format!("registry {}", registry.get_policy(&spec.route)),
        };
        println!("route {}: {}; keys: ip {}", spec.route, limit, keys.join(" "));
    }
    println!(
        "store: {:?}, ttl {}s, {:?}",
        config.store.backend, config.store.bucket_ttl_secs, config.store.on_unavailable
    );
    Ok(())
}

async fn probe(
    config: &RateKeeperConfig,
    route: &str,
    request: RequestParts,
    count: u32,
) -> anyhow::Result<()> {
    let limiter = Arc::new(config.build_limiter().await?);
    if limiter.routes().get(route).is_none() {
        bail!("route `{}` is not rate limited", route);
    }
    let gate = Gate::new(limiter);

    for i in 1..=count {
        // Each iteration is a distinct request with its own evaluation marker
        let request = request.clone();
        match gate.check(&request, route).await? {
            GateAction::Continue => println!("#{} allowed", i),
            GateAction::Reject(rejection) => {
                println!("#{} rejected {} {}", i, rejection.status, rejection.body_json())
            }
        }
    }

    let remaining = gate.limiter().available_tokens(&request, route).await?;
    if let Some(tokens) = remaining {
        println!("remaining tokens: {}", tokens);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            parse_pair("X-Client-Id=alice").unwrap(),
            ("X-Client-Id".to_string(), "alice".to_string())
        );
        assert_eq!(parse_pair("q=a=b").unwrap().1, "a=b");
        assert!(parse_pair("novalue").is_err());
        assert!(parse_pair("=x").is_err());
    }

    #[test]
    fn test_synthetic_request_arguments() {
        let cli = Cli::try_parse_from([
            "ratekeeper",
            "--config",
            "rk.yaml",
            "probe",
            "--route",
            "login",
            "--ip",
            "1.2.3.4",
            "--header",
            "X-Client-Id=alice",
            "--count",
            "3",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("rk.yaml"));
        match cli.command {
            Command::Probe {
                route,
                ip,
                headers,
                count,
                ..
            } => {
                assert_eq!(route, "login");
                assert_eq!(ip, "1.2.3.4".parse::<IpAddr>().unwrap());
                assert_eq!(headers, vec![("X-Client-Id".to_string(), "alice".to_string())]);
                assert_eq!(count, 3);
            }
            Command::Validate => panic!("wrong subcommand parsed"),
        }
    }

    #[test]
    fn test_missing_config_is_an_error_before_logging() {
        let err = RateKeeperConfig::from_file("/nonexistent/ratekeeper.yaml").unwrap_err();
        assert!(err.to_string().contains("Configuration error"));
    }
}

//! Process wrapper: flags and environment variables in, a running gateway
//! out. The core never reads the environment itself — everything funnels
//! through the same key-value parameter map the bus adapter would deliver.

use std::{collections::HashMap, sync::Arc};

use {
    anyhow::Context,
    clap::Parser,
    tokio::net::TcpListener,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {wsbridge_bus::TcpBus, wsbridge_config::GatewayConfig, wsbridge_gateway::GatewayServer};

#[derive(Parser)]
#[command(name = "wsbridge", about = "WebSocket to message-bus gateway", version)]
struct Cli {
    /// Bus host to connect to.
    #[arg(long, env = "GATEWAY_BUS_HOST")]
    bus_host: String,

    /// Bus port.
    #[arg(long, env = "GATEWAY_BUS_PORT")]
    bus_port: u16,

    /// Shared HS512 secret for handshake tokens.
    #[arg(long, env = "GATEWAY_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Check token expiration claims during validation.
    #[arg(long, env = "GATEWAY_JWT_VALIDATE_EXPIRY", default_value_t = false)]
    jwt_validate_expiry: bool,

    /// Advisory maximum number of connections.
    #[arg(long, env = "GATEWAY_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Endpoint to channel map (`endpoint:channel;…`).
    #[arg(long, env = "GATEWAY_ENDPOINTS_MAP")]
    endpoints_map: Option<String>,

    /// Reject handshakes without a validated identity.
    #[arg(
        long,
        env = "GATEWAY_ONLY_AUTHORIZED_REQUESTS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    only_authorized_requests: bool,

    /// Route HTTP requests through the endpoints map.
    #[arg(long, env = "GATEWAY_ENABLE_ROUTING", default_value_t = false)]
    enable_routing: bool,

    /// Log every upgrade request.
    #[arg(long, env = "GATEWAY_DEV", default_value_t = false)]
    dev: bool,

    /// Port to listen on (default 80).
    #[arg(long, env = "GATEWAY_PORT")]
    port: Option<u16>,

    /// Per-frame size ceiling in bytes (default 100 MiB).
    #[arg(long, env = "GATEWAY_MAX_FRAME_BYTES")]
    max_frame_bytes: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

impl Cli {
    /// The key-value shape the bus adapter's parameter store delivers.
    fn params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        let mut set = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                params.insert(key.to_string(), value);
            }
        };
        set("jwtSecret", self.jwt_secret.clone());
        set(
            "jwtValidateExpiry",
            Some(self.jwt_validate_expiry.to_string()),
        );
        set(
            "maxConnections",
            self.max_connections.map(|v| v.to_string()),
        );
        set("endpointsMap", self.endpoints_map.clone());
        set(
            "onlyAuthorizedRequests",
            Some(self.only_authorized_requests.to_string()),
        );
        set("enableRouting", Some(self.enable_routing.to_string()));
        set("dev", Some(self.dev.to_string()));
        set("port", self.port.map(|p| p.to_string()));
        set(
            "maxFrameBytes",
            self.max_frame_bytes.map(|v| v.to_string()),
        );
        params
    }
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = GatewayConfig::from_params(&cli.params()).context("resolving configuration")?;
    let port = config.port;

    let bus = TcpBus::connect(&cli.bus_host, cli.bus_port)
        .await
        .with_context(|| format!("connecting to bus at {}:{}", cli.bus_host, cli.bus_port))?;

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;

    let server = GatewayServer::new(config, Arc::new(bus));
    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            stopper.shutdown();
        }
    });

    server.run(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_mirror_the_flags() {
        let cli = Cli::parse_from([
            "wsbridge",
            "--bus-host",
            "bus.internal",
            "--bus-port",
            "4444",
            "--jwt-secret",
            "s",
            "--port",
            "9090",
            "--only-authorized-requests",
            "false",
            "--dev",
        ]);
        let params = cli.params();
        assert_eq!(params["jwtSecret"], "s");
        assert_eq!(params["port"], "9090");
        assert_eq!(params["onlyAuthorizedRequests"], "false");
        assert_eq!(params["dev"], "true");
        assert!(!params.contains_key("endpointsMap"));

        let config = GatewayConfig::from_params(&params).unwrap();
        assert_eq!(config.port, 9090);
        assert!(!config.only_authorized_requests);
        assert!(config.dev);
    }

    #[test]
    fn only_authorized_requests_defaults_to_true() {
        let cli = Cli::parse_from(["wsbridge", "--bus-host", "h", "--bus-port", "1"]);
        assert!(cli.only_authorized_requests);
        let config = GatewayConfig::from_params(&cli.params()).unwrap();
        assert!(config.only_authorized_requests);
        assert_eq!(config.port, wsbridge_config::DEFAULT_PORT);
    }
}

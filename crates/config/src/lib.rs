//! Gateway configuration.
//!
//! The gateway is configured through a flat string key-value map, the shape
//! the bus adapter's parameter store delivers. The CLI builds the same map
//! from flags and environment variables. Unset and empty values fall back to
//! documented defaults.

pub mod routing;

use std::{collections::HashMap, time::Duration};

pub use routing::RoutingTable;

// ── Defaults ─────────────────────────────────────────────────────────────────

pub const DEFAULT_PORT: u16 = 80;
/// Per-frame read ceiling (100 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;
/// Anonymous-connection count above which the admission sweeper runs.
pub const DEFAULT_SWEEP_NOT_LOGGED_THRESHOLD: usize = 200;
/// Minimum age of an anonymous connection before the sweeper may cull it.
pub const DEFAULT_SWEEP_MIN_AGE: Duration = Duration::from_secs(60);

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("endpointsMap entry {0:?} is not an endpoint:channel pair")]
    InvalidEndpoint(String),
    #[error("enableRouting is set but endpointsMap is empty")]
    MissingEndpointsMap,
}

// ── Gateway configuration ────────────────────────────────────────────────────

/// Everything the gateway core needs to run, resolved from the parameter map.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Shared HS512 secret. When absent, tokens are not validated.
    pub jwt_secret: Option<String>,
    /// Check the `exp` claim during token validation.
    pub jwt_validate_expiry: bool,
    /// Reject handshakes that carry no validated identity.
    pub only_authorized_requests: bool,
    /// Verbose per-request logging.
    pub dev: bool,
    pub port: u16,
    /// Advisory upper bound, surfaced to operators; not enforced.
    pub max_connections: Option<usize>,
    pub enable_routing: bool,
    /// URI → bus channel table for the optional HTTP-dispatch feature.
    pub routing: Option<RoutingTable>,
    pub max_frame_bytes: usize,
    pub sweep_not_logged_threshold: usize,
    pub sweep_min_age: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_validate_expiry: false,
            only_authorized_requests: false,
            dev: false,
            port: DEFAULT_PORT,
            max_connections: None,
            enable_routing: false,
            routing: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            sweep_not_logged_threshold: DEFAULT_SWEEP_NOT_LOGGED_THRESHOLD,
            sweep_min_age: DEFAULT_SWEEP_MIN_AGE,
        }
    }
}

impl GatewayConfig {
    /// Resolve a configuration from the adapter's parameter map.
    ///
    /// An absent key and an empty value are equivalent. Booleans follow the
    /// adapter convention: the literal `"true"` and nothing else.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| params.get(key).map(String::as_str).filter(|v| !v.is_empty());
        let flag = |key: &str| get(key) == Some("true");

        let port = match get("port") {
            Some(raw) => parse_number(raw, "port")?,
            None => DEFAULT_PORT,
        };

        let max_connections = get("maxConnections")
            .map(|raw| parse_number(raw, "maxConnections"))
            .transpose()?;

        let max_frame_bytes = match get("maxFrameBytes") {
            Some(raw) => parse_number(raw, "maxFrameBytes")?,
            None => DEFAULT_MAX_FRAME_BYTES,
        };

        let sweep_not_logged_threshold = match get("sweepNotLoggedThreshold") {
            Some(raw) => parse_number(raw, "sweepNotLoggedThreshold")?,
            None => DEFAULT_SWEEP_NOT_LOGGED_THRESHOLD,
        };

        let sweep_min_age = match get("sweepMinAgeSecs") {
            Some(raw) => Duration::from_secs(parse_number(raw, "sweepMinAgeSecs")?),
            None => DEFAULT_SWEEP_MIN_AGE,
        };

        let enable_routing = flag("enableRouting");
        let routing = get("endpointsMap")
            .map(RoutingTable::parse)
            .transpose()?;
        if enable_routing && routing.is_none() {
            return Err(ConfigError::MissingEndpointsMap);
        }

        Ok(Self {
            jwt_secret: get("jwtSecret").map(String::from),
            jwt_validate_expiry: flag("jwtValidateExpiry"),
            only_authorized_requests: flag("onlyAuthorizedRequests"),
            dev: flag("dev"),
            port,
            max_connections,
            enable_routing,
            routing,
            max_frame_bytes,
            sweep_not_logged_threshold,
            sweep_min_age,
        })
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_map_yields_defaults() {
        let config = GatewayConfig::from_params(&HashMap::new()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.jwt_secret, None);
        assert!(!config.only_authorized_requests);
        assert!(!config.dev);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(
            config.sweep_not_logged_threshold,
            DEFAULT_SWEEP_NOT_LOGGED_THRESHOLD
        );
        assert_eq!(config.sweep_min_age, DEFAULT_SWEEP_MIN_AGE);
    }

    #[test]
    fn empty_value_counts_as_unset() {
        let config = GatewayConfig::from_params(&params(&[("port", ""), ("jwtSecret", "")]))
            .unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.jwt_secret, None);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = GatewayConfig::from_params(&params(&[
            ("jwtSecret", "s"),
            ("onlyAuthorizedRequests", "true"),
            ("dev", "true"),
            ("port", "9090"),
            ("maxConnections", "5000"),
            ("maxFrameBytes", "1048576"),
            ("sweepNotLoggedThreshold", "10"),
            ("sweepMinAgeSecs", "5"),
        ]))
        .unwrap();
        assert_eq!(config.jwt_secret.as_deref(), Some("s"));
        assert!(config.only_authorized_requests);
        assert!(config.dev);
        assert_eq!(config.port, 9090);
        assert_eq!(config.max_connections, Some(5000));
        assert_eq!(config.max_frame_bytes, 1_048_576);
        assert_eq!(config.sweep_not_logged_threshold, 10);
        assert_eq!(config.sweep_min_age, Duration::from_secs(5));
    }

    #[test]
    fn non_true_booleans_are_false() {
        let config =
            GatewayConfig::from_params(&params(&[("onlyAuthorizedRequests", "yes")])).unwrap();
        assert!(!config.only_authorized_requests);
    }

    #[test]
    fn invalid_port_is_an_error() {
        let err = GatewayConfig::from_params(&params(&[("port", "eighty")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "port".into(),
                value: "eighty".into(),
            }
        );
    }

    #[test]
    fn routing_requires_endpoints_map() {
        let err = GatewayConfig::from_params(&params(&[("enableRouting", "true")])).unwrap_err();
        assert_eq!(err, ConfigError::MissingEndpointsMap);

        let config = GatewayConfig::from_params(&params(&[
            ("enableRouting", "true"),
            ("endpointsMap", "/api:apiChannel"),
        ]))
        .unwrap();
        assert!(config.enable_routing);
        assert_eq!(config.routing.unwrap().lookup("/api"), Some("apiChannel"));
    }
}

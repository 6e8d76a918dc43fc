//! URI → bus-channel routing table.
//!
//! Parsed from the `endpointsMap` parameter: semicolon-separated
//! `endpoint:channel` pairs, e.g. `/orders:orderChannel;/users:userChannel`.
//! Only the lookup contract is part of the gateway core; request dispatch
//! itself lives outside it.

use std::collections::HashMap;

use crate::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: HashMap<String, String>,
}

impl RoutingTable {
    /// Parse an `endpoint:channel;…` spec. Empty segments are skipped;
    /// a segment without both sides is an error.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut routes = HashMap::new();
        for entry in spec.split(';').filter(|e| !e.trim().is_empty()) {
            let Some((endpoint, channel)) = entry.split_once(':') else {
                return Err(ConfigError::InvalidEndpoint(entry.to_string()));
            };
            let (endpoint, channel) = (endpoint.trim(), channel.trim());
            if endpoint.is_empty() || channel.is_empty() {
                return Err(ConfigError::InvalidEndpoint(entry.to_string()));
            }
            routes.insert(endpoint.to_string(), channel.to_string());
        }
        Ok(Self { routes })
    }

    /// Channel the given request URI maps to, if any.
    pub fn lookup(&self, uri: &str) -> Option<&str> {
        self.routes.get(uri).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

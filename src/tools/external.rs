//! Opaque string→string tools (spec §4.4): web search, weather, email,
//! geocode, ip location, POI search, route planning. The core imposes no
//! semantics on these beyond "POST the arguments, return the body as text" —
//! they're external collaborators, not modelled further here.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::{ArgSpec, ArgType, ToolHandler};

/// Generic HTTP-backed tool: serialises its arguments as a JSON body, POSTs
/// to a configured endpoint, and returns the response body as the
/// observation text. One instance per opaque tool (`web_search`, `geocode`, ...).
pub struct ExternalEndpointTool {
    http: reqwest::Client,
    endpoint: String,
}

impl ExternalEndpointTool {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(ragchat_core::DEFAULT_TOOL_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, endpoint: endpoint.into() }
    }
}

#[async_trait]
impl ToolHandler for ExternalEndpointTool {
    async fn call(&self, args: HashMap<String, Value>) -> anyhow::Result<String> {
        let resp = self.http.post(&self.endpoint).json(&args).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("endpoint returned status {}", resp.status()));
        }
        Ok(resp.text().await?)
    }
}

/// Schema for each opaque tool, kept here so the registry wiring in `main`
/// stays a short list of `(name, description, args, endpoint)` tuples.
pub fn web_search_args() -> Vec<ArgSpec> {
    vec![ArgSpec { name: "query", ty: ArgType::String, required: true }]
}

pub fn weather_query_args() -> Vec<ArgSpec> {
    vec![ArgSpec { name: "location", ty: ArgType::String, required: true }]
}

pub fn email_sender_args() -> Vec<ArgSpec> {
    vec![
        ArgSpec { name: "to", ty: ArgType::String, required: true },
        ArgSpec { name: "subject", ty: ArgType::String, required: true },
        ArgSpec { name: "body", ty: ArgType::String, required: true },
    ]
}

pub fn geocode_args() -> Vec<ArgSpec> {
    vec![ArgSpec { name: "address", ty: ArgType::String, required: true }]
}

pub fn ip_location_args() -> Vec<ArgSpec> {
    vec![ArgSpec { name: "ip", ty: ArgType::String, required: true }]
}

pub fn poi_search_args() -> Vec<ArgSpec> {
    vec![
        ArgSpec { name: "query", ty: ArgType::String, required: true },
        ArgSpec { name: "radius_m", ty: ArgType::Integer, required: false },
    ]
}

pub fn route_planning_args() -> Vec<ArgSpec> {
    vec![
        ArgSpec { name: "origin", ty: ArgType::String, required: true },
        ArgSpec { name: "destination", ty: ArgType::String, required: true },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemas_mark_required_args() {
        assert!(web_search_args()[0].required);
        assert!(!poi_search_args()[1].required);
    }
}

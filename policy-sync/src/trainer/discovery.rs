//! Where the trainer learns about predictors and gateways.

use async_trait::async_trait;

use policy_sync_core::config::EndpointsConfig;
use policy_sync_core::traits::Role;
use policy_sync_net::traits::Endpoint;

/// Source of participant endpoints
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Every endpoint that should currently be part of the job
    async fn discover(&self) -> Vec<(Role, Endpoint)>;
}

/// Fixed endpoint list
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    endpoints: Vec<(Role, Endpoint)>,
}

impl StaticDiscovery {
    pub fn new(
        predictors: impl IntoIterator<Item = Endpoint>,
        gateways: impl IntoIterator<Item = Endpoint>,
    ) -> Self {
        let endpoints = predictors
            .into_iter()
            .map(|e| (Role::Predictor, e))
            .chain(gateways.into_iter().map(|e| (Role::Gateway, e)))
            .collect();
        Self { endpoints }
    }

    pub fn from_config(config: &EndpointsConfig) -> Self {
        Self::new(
            config.predictors.iter().map(|s| Endpoint::new(s.as_str())),
            config.gateways.iter().map(|s| Endpoint::new(s.as_str())),
        )
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Vec<(Role, Endpoint)> {
        self.endpoints.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn config_endpoints_keep_their_roles() {
        let config = EndpointsConfig {
            predictors: vec!["10.0.0.1:7000".into(), "10.0.0.2:7000".into()],
            gateways: vec!["10.0.1.1:7100".into()],
        };
        let found = StaticDiscovery::from_config(&config).discover().await;
        assert_eq!(found.len(), 3);
        assert_eq!(found.iter().filter(|(r, _)| *r == Role::Predictor).count(), 2);
        assert_eq!(found[2], (Role::Gateway, Endpoint::from("10.0.1.1:7100")));
    }
}

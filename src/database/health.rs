use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use super::connector::Connector;
use super::pool::ConnectionPool;

pub const HEALTH_QUERY: &str = "SELECT 1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthStatus;
}

/// Round-trips a trivial query through the pool.
pub struct HealthProbe<C: Connector> {
    pool: ConnectionPool<C>,
    timeout: Duration,
}

impl<C: Connector> HealthProbe<C> {
    pub fn new(pool: ConnectionPool<C>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl<C: Connector> HealthCheck for HealthProbe<C> {
    async fn check(&self) -> HealthStatus {
        let reason = match tokio::time::timeout(self.timeout, self.pool.query(HEALTH_QUERY, &[])).await {
            Ok(Ok(_)) => return HealthStatus::Healthy,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("health check timed out after {:?}", self.timeout),
        };
        warn!(error = %reason, "database health check failed");
        HealthStatus::Unhealthy { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::credential::CredentialProvider;
    use crate::database::pool::PoolConfig;
    use crate::testing::{MockConnector, MockSigner};

    fn probe(connector: MockConnector, timeout: Duration) -> HealthProbe<MockConnector> {
        let pool = ConnectionPool::new(
            connector,
            CredentialProvider::new(MockSigner::new()),
            PoolConfig::default(),
        );
        HealthProbe::new(pool, timeout)
    }

    #[tokio::test]
    async fn healthy_when_query_succeeds() {
        let connector = MockConnector::new();
        let probe = probe(connector.clone(), Duration::from_secs(1));

        assert_eq!(probe.check().await, HealthStatus::Healthy);
        assert_eq!(connector.statements(), vec![HEALTH_QUERY.to_string()]);
        assert_eq!(probe.pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn unhealthy_when_store_is_unreachable() {
        let connector = MockConnector::new();
        connector.fail_connects(true);
        let probe = probe(connector.clone(), Duration::from_secs(1));

        let status = probe.check().await;
        assert!(!status.is_healthy());

        // Recovers once the store comes back.
        connector.fail_connects(false);
        assert!(probe.check().await.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_query_is_unhealthy() {
        let connector = MockConnector::new();
        connector.set_query_delay(Duration::from_secs(60));
        let probe = probe(connector, Duration::from_millis(500));

        match probe.check().await {
            HealthStatus::Unhealthy { reason } => assert!(reason.contains("timed out")),
            HealthStatus::Healthy => panic!("expected unhealthy"),
        }
    }
}

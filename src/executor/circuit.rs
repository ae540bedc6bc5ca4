//! Circuit breaker backed by the integration row.
//!
//! Storage is the source of truth; nothing is cached here. A breaker opens
//! after `threshold` exhausted executions in a row and closes again on the
//! next success or a manual reset.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::ActionError;
use crate::engine::storage::RemediationStore;
use crate::models::Integration;

pub struct CircuitBreaker {
    store: Arc<dyn RemediationStore>,
    threshold: i32,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn RemediationStore>, threshold: i32) -> Self {
        Self {
            store,
            threshold: threshold.max(1),
        }
    }

    /// Fail fast when the breaker is open.
    pub async fn check(&self, integration: &Integration) -> Result<(), ActionError> {
        let state = self
            .store
            .circuit_state(integration.id)
            .await
            .map_err(|e| ActionError::Storage(e.to_string()))?;
        if state.is_open() {
            warn!(
                integration = %integration.name,
                failures = state.consecutive_failures,
                "Circuit open, skipping execution"
            );
            return Err(ActionError::CircuitOpen {
                integration: integration.name.clone(),
            });
        }
        Ok(())
    }

    /// Close the breaker after a successful call, if anything was recorded.
    pub async fn record_success(&self, integration: &Integration) {
        let state = match self.store.circuit_state(integration.id).await {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to read circuit state for {}: {}", integration.name, e);
                return;
            }
        };
        if !state.needs_reset() {
            return;
        }
        match self.store.reset_circuit(integration.id).await {
            Ok(()) => info!("Circuit reset for {} after successful call", integration.name),
            Err(e) => error!("Failed to reset circuit for {}: {}", integration.name, e),
        }
    }

    /// Count one exhausted execution.
    pub async fn record_failure(&self, integration: &Integration) {
        match self.store.record_circuit_failure(integration.id, self.threshold).await {
            Ok(state) if state.is_open() => warn!(
                integration = %integration.name,
                failures = state.consecutive_failures,
                "Circuit tripped, integration marked unavailable"
            ),
            Ok(_) => {}
            Err(e) => error!("Failed to record circuit failure for {}: {}", integration.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStore;
    use crate::models::ProtocolKind;

    async fn setup() -> (Arc<InMemoryStore>, Integration) {
        let store = Arc::new(InMemoryStore::new());
        let integration = store
            .upsert_integration(Integration::new(0, 1, "Okta", ProtocolKind::Rest, "https://okta.test"))
            .await
            .unwrap();
        (store, integration)
    }

    #[tokio::test]
    async fn trips_at_threshold_and_resets_on_success() {
        let (store, integration) = setup().await;
        let breaker = CircuitBreaker::new(store.clone(), 5);

        for _ in 0..4 {
            breaker.record_failure(&integration).await;
        }
        assert!(breaker.check(&integration).await.is_ok());

        breaker.record_failure(&integration).await;
        let state = store.circuit_state(integration.id).await.unwrap();
        assert_eq!(state.consecutive_failures, 5);
        assert!(!state.is_available);
        assert!(matches!(
            breaker.check(&integration).await,
            Err(ActionError::CircuitOpen { .. })
        ));

        // A call that was already in flight when the breaker opened
        breaker.record_success(&integration).await;
        let state = store.circuit_state(integration.id).await.unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.is_available);
    }
}

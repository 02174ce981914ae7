//! Health reporting.
//!
//! Health follows the dead-letter queue depth — fewer than 100 entries is
//! healthy, fewer than 1000 degraded, anything more unhealthy — and a
//! faulted background processor forces unhealthy regardless of depth.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::db::ConnectionPool;
use crate::error::Result;
use crate::journal;
use crate::processor::ProcessorState;

const DEGRADED_THRESHOLD: i64 = 100;
const UNHEALTHY_THRESHOLD: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub dlq_depth: i64,
    pub processor_state: Option<ProcessorState>,
}

pub struct HealthCheck {
    pool: Arc<ConnectionPool>,
    processor_state: Option<watch::Receiver<ProcessorState>>,
}

impl HealthCheck {
    pub fn new(
        pool: Arc<ConnectionPool>,
        processor_state: Option<watch::Receiver<ProcessorState>>,
    ) -> Self {
        Self {
            pool,
            processor_state,
        }
    }

    pub async fn check(&self) -> Result<HealthReport> {
        let handle = self.pool.handle().await;
        let dlq_depth = journal::dlq_depth(&handle).await?;
        let processor_state = self.processor_state.as_ref().map(|rx| *rx.borrow());

        let mut status = status_for_depth(dlq_depth);
        if processor_state == Some(ProcessorState::Faulted) {
            status = HealthStatus::Unhealthy;
        }

        Ok(HealthReport {
            status,
            dlq_depth,
            processor_state,
        })
    }
}

fn status_for_depth(depth: i64) -> HealthStatus {
    if depth < DEGRADED_THRESHOLD {
        HealthStatus::Healthy
    } else if depth < UNHEALTHY_THRESHOLD {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_follow_dlq_depth() {
        assert_eq!(status_for_depth(0), HealthStatus::Healthy);
        assert_eq!(status_for_depth(99), HealthStatus::Healthy);
        assert_eq!(status_for_depth(100), HealthStatus::Degraded);
        assert_eq!(status_for_depth(999), HealthStatus::Degraded);
        assert_eq!(status_for_depth(1000), HealthStatus::Unhealthy);
    }
}

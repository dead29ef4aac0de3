//! Push notification processor.

use super::{Processor, ProcessorMetrics, TransportError};
use crate::error::ProcessError;
use crate::job::{Job, JobId};
use crate::payload::{DeviceToken, JobPayload, JobType, PushPlatform};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A notification addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
    /// `{job_id}:{token}`, stable across redeliveries.
    pub idempotency_key: String,
}

/// Gateway to the FCM/APNs delivery services.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, platform: PushPlatform, message: &PushMessage) -> Result<(), TransportError>;
}

/// Gateway that only logs, for development setups.
#[derive(Debug, Default)]
pub struct LoggingPushGateway;

#[async_trait]
impl PushGateway for LoggingPushGateway {
    async fn send(&self, platform: PushPlatform, message: &PushMessage) -> Result<(), TransportError> {
        info!(
            platform = ?platform,
            idempotency_key = %message.idempotency_key,
            title = %message.title,
            "Push delivered (logging gateway)"
        );
        Ok(())
    }
}

/// Fans a notification out to every device token of the job.
///
/// Tokens already delivered for a job id are skipped on redelivery, and every
/// gateway call carries a per-token idempotency key. A token the gateway
/// rejects as invalid is dropped; a retryable gateway error fails the job
/// transiently against that platform's dependency key.
pub struct PushProcessor {
    gateway: Arc<dyn PushGateway>,
    delivered: Mutex<HashSet<(JobId, String)>>,
    metrics: ProcessorMetrics,
}

impl PushProcessor {
    pub fn new(gateway: Arc<dyn PushGateway>) -> Self {
        Self {
            gateway,
            delivered: Mutex::new(HashSet::new()),
            metrics: ProcessorMetrics::new(),
        }
    }

    fn already_delivered(&self, job_id: &JobId, token: &DeviceToken) -> bool {
        self.delivered.lock().contains(&(job_id.clone(), token.token.clone()))
    }

    fn forget(&self, job_id: &JobId) {
        self.delivered.lock().retain(|(id, _)| id != job_id);
    }
}

#[async_trait]
impl Processor for PushProcessor {
    fn job_type(&self) -> JobType {
        JobType::PushNotification
    }

    fn dependency_keys(&self, job: &Job) -> Vec<String> {
        let JobPayload::PushNotification(payload) = &job.payload else {
            return Vec::new();
        };
        payload
            .tokens
            .iter()
            .map(|t| t.platform.dependency_key())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    async fn process(&self, job: &Job) -> Result<(), ProcessError> {
        let JobPayload::PushNotification(payload) = &job.payload else {
            return Err(ProcessError::permanent("push processor received a non-push payload"));
        };

        let mut rejected = 0usize;
        for device in &payload.tokens {
            if self.already_delivered(&job.id, device) {
                debug!(job_id = %job.id, platform = ?device.platform, "Skipping already delivered token");
                continue;
            }

            let message = PushMessage {
                token: device.token.clone(),
                title: payload.title.clone(),
                body: payload.body.clone(),
                data: payload.data.clone(),
                idempotency_key: format!("{}:{}", job.id, device.token),
            };

            match self.gateway.send(device.platform, &message).await {
                Ok(()) => {
                    self.delivered
                        .lock()
                        .insert((job.id.clone(), device.token.clone()));
                }
                Err(e) if e.retryable => {
                    return Err(ProcessError::transient(e.message)
                        .with_dependency(device.platform.dependency_key()));
                }
                Err(e) => {
                    rejected += 1;
                    warn!(job_id = %job.id, platform = ?device.platform, error = %e, "Dropping rejected device token");
                }
            }
        }

        self.forget(&job.id);

        if rejected == payload.tokens.len() {
            return Err(ProcessError::permanent("every device token was rejected"));
        }
        Ok(())
    }

    fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }
}

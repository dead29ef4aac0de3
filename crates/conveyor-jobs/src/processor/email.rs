//! Email processor.

use super::{Processor, ProcessorMetrics, TransportError};
use crate::error::ProcessError;
use crate::job::Job;
use crate::payload::{EmailPayload, JobPayload, JobType};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Subject and body with `{{name}}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

impl EmailTemplate {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Named email templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, EmailTemplate>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in account templates.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_template(
                "welcome",
                EmailTemplate::new(
                    "Welcome to {{app_name}}, {{name}}!",
                    "Hi {{name}},\n\nThanks for joining {{app_name}}.",
                ),
            )
            .with_template(
                "password_reset",
                EmailTemplate::new(
                    "Reset your password",
                    "Hi {{name}},\n\nUse this link to reset your password: {{reset_url}}",
                ),
            )
            .with_template(
                "notification",
                EmailTemplate::new("{{title}}", "{{message}}"),
            )
    }

    pub fn with_template(mut self, name: impl Into<String>, template: EmailTemplate) -> Self {
        self.templates.insert(name.into(), template);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EmailTemplate> {
        self.templates.get(name)
    }
}

/// Replaces `{{name}}` placeholders. Whitespace inside the braces is ignored.
///
/// Returns the name of the first placeholder without a value on failure.
fn render(template: &str, variables: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = rest[start + 2..start + 2 + len].trim();
        match variables.get(name) {
            Some(value) => out.push_str(value),
            None => return Err(name.to_string()),
        }
        rest = &rest[start + 2 + len + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// A rendered email ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Stable across redeliveries of the same job.
    pub idempotency_key: String,
}

/// Outbound mail transport.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError>;
}

/// Transport that only logs, for development setups.
#[derive(Debug, Default)]
pub struct LoggingEmailTransport;

#[async_trait]
impl EmailTransport for LoggingEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            idempotency_key = %message.idempotency_key,
            "Email delivered (logging transport)"
        );
        Ok(())
    }
}

/// Renders a template and hands the message to an [`EmailTransport`].
pub struct EmailProcessor {
    catalog: TemplateCatalog,
    transport: Arc<dyn EmailTransport>,
    dependency_key: String,
    metrics: ProcessorMetrics,
}

impl EmailProcessor {
    pub const DEFAULT_DEPENDENCY: &'static str = "smtp:primary";

    pub fn new(catalog: TemplateCatalog, transport: Arc<dyn EmailTransport>) -> Self {
        Self {
            catalog,
            transport,
            dependency_key: Self::DEFAULT_DEPENDENCY.to_string(),
            metrics: ProcessorMetrics::new(),
        }
    }

    /// Uses a different dependency key, e.g. for a backup relay.
    pub fn with_dependency_key(mut self, key: impl Into<String>) -> Self {
        self.dependency_key = key.into();
        self
    }

    fn compose(&self, job: &Job, payload: &EmailPayload) -> Result<EmailMessage, ProcessError> {
        let template = self
            .catalog
            .get(&payload.template)
            .ok_or_else(|| ProcessError::permanent(format!("template not found: {}", payload.template)))?;

        let missing = |name: String| {
            ProcessError::permanent(format!(
                "template '{}' needs variable '{}'",
                payload.template, name
            ))
        };

        let subject = match &payload.subject {
            Some(subject) => subject.clone(),
            None => render(&template.subject, &payload.variables).map_err(missing)?,
        };
        let body = render(&template.body, &payload.variables).map_err(missing)?;

        Ok(EmailMessage {
            to: payload.to.clone(),
            subject,
            body,
            idempotency_key: job.id.to_string(),
        })
    }
}

#[async_trait]
impl Processor for EmailProcessor {
    fn job_type(&self) -> JobType {
        JobType::Email
    }

    fn dependency_keys(&self, _job: &Job) -> Vec<String> {
        vec![self.dependency_key.clone()]
    }

    async fn process(&self, job: &Job) -> Result<(), ProcessError> {
        let JobPayload::Email(payload) = &job.payload else {
            return Err(ProcessError::permanent("email processor received a non-email payload"));
        };

        let message = self.compose(job, payload)?;
        debug!(job_id = %job.id, template = %payload.template, "Sending email");

        self.transport.send(&message).await.map_err(|e| {
            let error = if e.retryable {
                ProcessError::transient(e.message)
            } else {
                ProcessError::permanent(e.message)
            };
            error.with_dependency(self.dependency_key.clone())
        })
    }

    fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }
}

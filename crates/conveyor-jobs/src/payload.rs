//! Typed job payloads.
//!
//! Each job type carries one payload variant, validated when the job is
//! enqueued so that malformed work never reaches a worker.

use chrono::{DateTime, Utc};
use conveyor_core::rules;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use validator::{Validate, ValidationError, ValidationErrors};

/// Job types known to the system. Each type drains its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Email,
    PushNotification,
    Media,
    Moderation,
    Analytics,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::Email,
        JobType::PushNotification,
        JobType::Media,
        JobType::Moderation,
        JobType::Analytics,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            JobType::Email => "email",
            JobType::PushNotification => "push_notification",
            JobType::Media => "media",
            JobType::Moderation => "moderation",
            JobType::Analytics => "analytics",
        }
    }

    /// Name of the queue this job type is drained from.
    pub const fn queue_name(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown job type '{}'", s))
    }
}

/// Payload of an email job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct EmailPayload {
    #[validate(email(message = "Invalid recipient address"))]
    pub to: String,

    /// Name of a registered template.
    #[validate(custom(function = "rules::not_blank"))]
    pub template: String,

    /// Values substituted into `{{name}}` placeholders.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Overrides the template's subject line.
    #[validate(length(max = 255))]
    pub subject: Option<String>,
}

/// Push platform a device token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPlatform {
    Fcm,
    Apns,
}

impl PushPlatform {
    /// Dependency key of the gateway serving this platform.
    pub const fn dependency_key(self) -> &'static str {
        match self {
            PushPlatform::Fcm => "push:fcm",
            PushPlatform::Apns => "push:apns",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DeviceToken {
    #[validate(custom(function = "rules::not_blank"))]
    pub token: String,
    pub platform: PushPlatform,
}

/// Payload of a push notification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PushNotificationPayload {
    #[validate(length(min = 1, message = "At least one device token is required"))]
    #[validate(nested)]
    pub tokens: Vec<DeviceToken>,

    #[validate(length(min = 1, max = 256))]
    pub title: String,

    #[validate(length(max = 4096))]
    pub body: String,

    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// One transformation applied to a media object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MediaOperation {
    Transcode { format: String },
    Thumbnail { width: u32, height: u32 },
    Resize { width: u32, height: u32 },
}

/// Payload of a media processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_media_operations"))]
pub struct MediaPayload {
    #[validate(custom(function = "rules::not_blank"))]
    pub media_id: String,

    #[validate(url(message = "Invalid source URL"))]
    pub source_url: String,

    #[validate(length(min = 1, message = "At least one operation is required"))]
    pub operations: Vec<MediaOperation>,
}

fn validate_media_operations(payload: &MediaPayload) -> Result<(), ValidationError> {
    for op in &payload.operations {
        match op {
            MediaOperation::Transcode { format } if format.trim().is_empty() => {
                return Err(ValidationError::new("transcode_format_required"));
            }
            MediaOperation::Thumbnail { width, height } | MediaOperation::Resize { width, height }
                if *width == 0 || *height == 0 =>
            {
                return Err(ValidationError::new("zero_dimension"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Kind of content submitted for moderation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Post,
    Comment,
    Message,
    Profile,
}

/// Payload of a content moderation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_moderation_content"))]
pub struct ModerationPayload {
    #[validate(custom(function = "rules::not_blank"))]
    pub content_id: String,

    pub content_kind: ContentKind,

    #[validate(length(max = 65536))]
    pub text: Option<String>,

    #[serde(default)]
    #[validate(custom(function = "rules::no_blank_entries"))]
    pub media_urls: Vec<String>,
}

fn validate_moderation_content(payload: &ModerationPayload) -> Result<(), ValidationError> {
    let has_text = payload.text.as_deref().is_some_and(|t| !t.trim().is_empty());
    if !has_text && payload.media_urls.is_empty() {
        return Err(ValidationError::new("empty_content"));
    }
    Ok(())
}

/// Aggregation granularity of an analytics job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsPeriod {
    Hourly,
    Daily,
    Weekly,
}

/// Payload of an analytics aggregation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_analytics_window"))]
pub struct AnalyticsPayload {
    #[validate(custom(function = "rules::not_blank"))]
    pub metric: String,

    pub period: AnalyticsPeriod,

    pub window_start: DateTime<Utc>,

    pub window_end: DateTime<Utc>,

    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

fn validate_analytics_window(payload: &AnalyticsPayload) -> Result<(), ValidationError> {
    if payload.window_end <= payload.window_start {
        return Err(ValidationError::new("window_end_before_start"));
    }
    Ok(())
}

/// Payload of any job, tagged by job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    Email(EmailPayload),
    PushNotification(PushNotificationPayload),
    Media(MediaPayload),
    Moderation(ModerationPayload),
    Analytics(AnalyticsPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Email(_) => JobType::Email,
            JobPayload::PushNotification(_) => JobType::PushNotification,
            JobPayload::Media(_) => JobType::Media,
            JobPayload::Moderation(_) => JobType::Moderation,
            JobPayload::Analytics(_) => JobType::Analytics,
        }
    }

    /// Validates the inner payload against its schema.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            JobPayload::Email(p) => p.validate(),
            JobPayload::PushNotification(p) => p.validate(),
            JobPayload::Media(p) => p.validate(),
            JobPayload::Moderation(p) => p.validate(),
            JobPayload::Analytics(p) => p.validate(),
        }
    }
}

impl From<EmailPayload> for JobPayload {
    fn from(p: EmailPayload) -> Self {
        JobPayload::Email(p)
    }
}

impl From<PushNotificationPayload> for JobPayload {
    fn from(p: PushNotificationPayload) -> Self {
        JobPayload::PushNotification(p)
    }
}

impl From<MediaPayload> for JobPayload {
    fn from(p: MediaPayload) -> Self {
        JobPayload::Media(p)
    }
}

impl From<ModerationPayload> for JobPayload {
    fn from(p: ModerationPayload) -> Self {
        JobPayload::Moderation(p)
    }
}

impl From<AnalyticsPayload> for JobPayload {
    fn from(p: AnalyticsPayload) -> Self {
        JobPayload::Analytics(p)
    }
}

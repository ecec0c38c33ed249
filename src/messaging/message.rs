//! # Message Structures
//!
//! Envelope, priority and delivery status for inter-module messages, plus the
//! options and receipts exchanged with senders.

use super::errors::DeliveryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Who sent a message.
///
/// Module senders are subject to the target's dependency policy. System senders
/// are orchestration components (workflow engine, shared models) and only need
/// a registered target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum MessageSource {
    Module(String),
    System(String),
}

impl MessageSource {
    pub fn module(name: impl Into<String>) -> Self {
        Self::Module(name.into())
    }

    pub fn system(component: impl Into<String>) -> Self {
        Self::System(component.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Module(name) | Self::System(name) => name,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(name) => write!(f, "{name}"),
            Self::System(name) => write!(f, "system:{name}"),
        }
    }
}

impl From<&str> for MessageSource {
    fn from(name: &str) -> Self {
        Self::Module(name.to_string())
    }
}

impl From<String> for MessageSource {
    fn from(name: String) -> Self {
        Self::Module(name)
    }
}

impl From<&String> for MessageSource {
    fn from(name: &String) -> Self {
        Self::Module(name.clone())
    }
}

/// Delivery priority; declaration order is ascending
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for MessagePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid message priority: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Delivered,
    /// Permanently refused by the target; not retried
    Failed,
    /// Retries exhausted; parked for operator handling
    DeadLettered,
}

impl DeliveryStatus {
    /// Terminal states are immutable
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            _ => Err(format!("Invalid delivery status: {s}")),
        }
    }
}

/// A message as persisted in the `messages` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: MessageSource,
    pub target: String,
    pub message_type: String,
    pub payload: Value,
    pub priority: MessagePriority,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub reply: Option<Value>,
    /// Times an operator moved this message back out of the dead letter set
    #[serde(default)]
    pub requeues: u32,
    /// Enqueue order within the sending process; breaks `created_at` ties on recovery
    #[serde(default)]
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Message {
    pub(crate) fn new(
        sender: MessageSource,
        target: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
        options: &SendOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            target: target.into(),
            message_type: message_type.into(),
            payload,
            priority: options.priority,
            correlation_id: options.correlation_id.clone(),
            reply_to: options.reply_to.clone(),
            status: DeliveryStatus::Queued,
            attempts: 0,
            last_error: None,
            reply: None,
            requeues: 0,
            sequence: 0,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        }
    }

    pub fn ordering_key(&self) -> OrderingKey {
        OrderingKey {
            sender: self.sender.clone(),
            target: self.target.clone(),
        }
    }
}

/// The (sender, target) pair within which delivery is FIFO
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderingKey {
    pub sender: MessageSource,
    pub target: String,
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.sender, self.target)
    }
}

/// Per-send options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub priority: MessagePriority,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Wait for the handler's reply
    pub synchronous: bool,
    /// Overrides `message_bus.default_sync_timeout_ms` for synchronous sends
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous send with the configured default timeout
    pub fn sync() -> Self {
        Self {
            synchronous: true,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.synchronous = true;
        self.timeout = Some(timeout);
        self
    }
}

/// Result of an accepted send
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    /// Handler reply, present only for synchronous sends
    pub reply: Option<Value>,
}

/// Per-target outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub results: BTreeMap<String, Result<MessageId, DeliveryError>>,
}

impl BroadcastReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(Result::is_ok)
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(t, _)| t.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<(&str, &DeliveryError)> {
        self.results
            .iter()
            .filter_map(|(t, r)| r.as_ref().err().map(|e| (t.as_str(), e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Critical > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
        assert_eq!("critical".parse::<MessagePriority>().unwrap(), MessagePriority::Critical);
    }

    #[test]
    fn test_only_queued_is_non_terminal() {
        assert!(!DeliveryStatus::Queued.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(DeliveryStatus::DeadLettered.is_terminal());
    }

    #[test]
    fn test_message_source_serialization() {
        let source = MessageSource::system("workflow_engine");
        assert_eq!(
            serde_json::to_value(&source).unwrap(),
            json!({"kind": "system", "name": "workflow_engine"})
        );
        assert_eq!(source.to_string(), "system:workflow_engine");
        assert_eq!(MessageSource::from("Billing").to_string(), "Billing");
    }

    #[test]
    fn test_with_timeout_implies_synchronous() {
        let options = SendOptions::new().with_timeout(Duration::from_millis(5));
        assert!(options.synchronous);
        assert_eq!(options.timeout, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_broadcast_report() {
        let mut report = BroadcastReport::default();
        report.results.insert("A".to_string(), Ok(MessageId::new()));
        assert!(report.all_succeeded());
        report
            .results
            .insert("B".to_string(), Err(DeliveryError::target_not_registered("B")));
        assert!(!report.all_succeeded());
        assert_eq!(report.succeeded(), vec!["A"]);
        assert_eq!(report.failed().len(), 1);
    }
}

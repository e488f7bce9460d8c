//! Collaborator services: the background job queue and the push channel.
//!
//! Both are narrow async traits so the engine can run against the real
//! job service in production and cheap fakes in tests. Every call from
//! the engine is best-effort: failures are logged by the caller and
//! never abort event processing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::ids::{NodeId, PathId, PromptId, TraceId, UserId};
use crate::state::{PromptReason, PromptType};

/// Kinds of side jobs the engine enqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Build missing documents for upcoming nodes
    NodeDocProgressiveBuild,
    /// Select probe questions for a node
    DocProbeSelect,
    /// Refresh off-policy evaluation metrics
    PolicyEvalRefresh,
    /// Retrain the prompt policy
    PolicyTrain,
}

impl JobKind {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeDocProgressiveBuild => "node_doc_progressive_build",
            Self::DocProbeSelect => "doc_probe_select",
            Self::PolicyEvalRefresh => "policy_eval_refresh",
            Self::PolicyTrain => "policy_train",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A debounced side-job request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebouncedJob {
    /// Job kind
    pub kind: JobKind,
    /// Owning user
    pub user_id: UserId,
    /// Path context, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_id: Option<PathId>,
    /// Node context, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Policy key, for policy jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_key: Option<String>,
    /// Decision trace, for policy jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
}

impl DebouncedJob {
    /// Create a job for a user.
    pub fn new(kind: JobKind, user_id: UserId) -> Self {
        Self {
            kind,
            user_id,
            path_id: None,
            node_id: None,
            policy_key: None,
            trace_id: None,
        }
    }

    /// Set the path context.
    pub fn with_path(mut self, path_id: PathId) -> Self {
        self.path_id = Some(path_id);
        self
    }

    /// Set the node context.
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Set the policy key.
    pub fn with_policy_key(mut self, key: impl Into<String>) -> Self {
        self.policy_key = Some(key.into());
        self
    }

    /// Set the trace id.
    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Server-side debounce key: identical requests inside the debounce
    /// window collapse to one job.
    pub fn debounce_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(self.user_id.to_string().as_bytes());
        if let Some(path_id) = self.path_id {
            hasher.update(b":path:");
            hasher.update(path_id.to_string().as_bytes());
        }
        if let Some(node_id) = self.node_id {
            hasher.update(b":node:");
            hasher.update(node_id.to_string().as_bytes());
        }
        if let Some(key) = &self.policy_key {
            hasher.update(b":policy:");
            hasher.update(key.as_bytes());
        }
        let hash = hasher.finalize();
        format!("{:x}", hash)
    }
}

/// Background job queue consumed by the engine for side jobs.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Enqueue a debounced job. Idempotent server-side per debounce key.
    async fn enqueue_debounced(&self, job: DebouncedJob) -> Result<()>;
}

/// Payload pushed to the client when a prompt is emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPayload {
    /// Path context
    pub path_id: PathId,
    /// Node context
    pub node_id: NodeId,
    /// Backing block; absent for breaks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    /// Prompt kind
    #[serde(rename = "type")]
    pub prompt_type: PromptType,
    /// Selection reason
    pub reason: PromptReason,
    /// Prompt id the client echoes back in outcome events
    pub prompt_id: PromptId,
    /// Emission time
    pub created_at: DateTime<Utc>,
    /// Suggested break length lower bound, minutes; breaks only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub break_min: Option<u32>,
    /// Suggested break length upper bound, minutes; breaks only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub break_max: Option<u32>,
}

/// Push channel delivering prompts to connected clients.
///
/// Delivery is fire-and-forget: the pending prompt is also persisted, so
/// a lost notification is reconciled on the next document read.
#[async_trait]
pub trait RuntimeNotifier: Send + Sync {
    /// Push a prompt payload to the user's active sessions.
    async fn runtime_prompt(&self, user_id: UserId, payload: PromptPayload) -> Result<()>;
}

/// Job service that drops every request. For tests and detached runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJobService;

#[async_trait]
impl JobService for NoopJobService {
    async fn enqueue_debounced(&self, _job: DebouncedJob) -> Result<()> {
        Ok(())
    }
}

/// Notifier that drops every payload. For tests and detached runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl RuntimeNotifier for NoopNotifier {
    async fn runtime_prompt(&self, _user_id: UserId, _payload: PromptPayload) -> Result<()> {
        Ok(())
    }
}

/// Webhook-backed notifier: POSTs prompt payloads as JSON.
#[cfg(feature = "webhook")]
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

#[cfg(feature = "webhook")]
impl WebhookNotifier {
    /// Create a notifier posting to `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| crate::error::Error::notify(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[cfg(feature = "webhook")]
#[async_trait]
impl RuntimeNotifier for WebhookNotifier {
    async fn runtime_prompt(&self, user_id: UserId, payload: PromptPayload) -> Result<()> {
        let body = serde_json::json!({
            "user_id": user_id,
            "prompt": payload,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| crate::error::Error::notify(e.to_string()))?;
        if !response.status().is_success() {
            return Err(crate::error::Error::notify(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debounce_key_is_stable() {
        let user = UserId::new();
        let node = NodeId::new();
        let a = DebouncedJob::new(JobKind::NodeDocProgressiveBuild, user).with_node(node);
        let b = DebouncedJob::new(JobKind::NodeDocProgressiveBuild, user).with_node(node);
        assert_eq!(a.debounce_key(), b.debounce_key());
    }

    #[test]
    fn test_debounce_key_separates_kinds_and_context() {
        let user = UserId::new();
        let node = NodeId::new();
        let build = DebouncedJob::new(JobKind::NodeDocProgressiveBuild, user).with_node(node);
        let probe = DebouncedJob::new(JobKind::DocProbeSelect, user).with_node(node);
        let elsewhere =
            DebouncedJob::new(JobKind::NodeDocProgressiveBuild, user).with_node(NodeId::new());
        assert_ne!(build.debounce_key(), probe.debounce_key());
        assert_ne!(build.debounce_key(), elsewhere.debounce_key());
    }

    #[test]
    fn test_prompt_payload_wire_shape() {
        let payload = PromptPayload {
            path_id: PathId::new(),
            node_id: NodeId::new(),
            block_id: Some("q1".to_string()),
            prompt_type: PromptType::QuickCheck,
            reason: PromptReason::Cadence,
            prompt_id: PromptId::new(),
            created_at: Utc::now(),
            break_min: None,
            break_max: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "quick_check");
        assert_eq!(json["reason"], "cadence");
        assert!(json.get("break_min").is_none());
    }
}

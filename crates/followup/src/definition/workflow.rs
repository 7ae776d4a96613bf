//! Workflow and step definitions

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Channel;

/// Validation errors for a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("step sequence {0} is used more than once")]
    DuplicateSequence(i32),

    #[error("step {step_id} belongs to workflow {actual}, not {expected}")]
    ForeignStep {
        step_id: Uuid,
        expected: Uuid,
        actual: Uuid,
    },
}

/// One delayed action within a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub workflow_id: Uuid,

    /// Ordering key, unique within the workflow but not necessarily contiguous
    pub sequence: i32,

    /// Wait after the previous step ran (or after start, for the first step)
    #[serde(with = "duration_secs")]
    pub delay: Duration,

    pub channel: Channel,
    pub template_id: Option<Uuid>,
    pub active: bool,

    /// Free-form settings merged into the dispatch payload
    pub metadata: serde_json::Value,
}

impl Step {
    /// Create an active step; the workflow id is assigned by
    /// [`WorkflowDefinition::with_step`]
    pub fn new(sequence: i32, delay: Duration, channel: Channel) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: Uuid::nil(),
            sequence,
            delay,
            channel,
            template_id: None,
            active: true,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_template(mut self, template_id: Uuid) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// String value from the step metadata
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Instant this step becomes due when scheduled at `from`
    pub fn due_from(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay)
            .ok()
            .and_then(|delay| from.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Named, ordered template of steps applied to recipients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub active: bool,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(tenant_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            name: name.into(),
            active: true,
            steps: vec![],
            created_at: Utc::now(),
        }
    }

    /// Add a step, binding it to this workflow
    pub fn with_step(mut self, mut step: Step) -> Self {
        step.workflow_id = self.id;
        self.steps.push(step);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Active steps ordered by sequence
    ///
    /// An inactive workflow has no active steps, so in-flight instances
    /// complete on their next run.
    pub fn active_steps(&self) -> Vec<&Step> {
        if !self.active {
            return vec![];
        }

        let mut steps: Vec<&Step> = self.steps.iter().filter(|s| s.active).collect();
        steps.sort_by_key(|s| s.sequence);
        steps
    }

    pub fn first_active_step(&self) -> Option<&Step> {
        self.active_steps().into_iter().next()
    }

    /// First active step with a sequence strictly greater than `sequence`
    pub fn next_active_after(&self, sequence: i32) -> Option<&Step> {
        self.active_steps()
            .into_iter()
            .find(|s| s.sequence > sequence)
    }

    /// Look up a step by id among the active steps
    pub fn active_step(&self, step_id: Uuid) -> Option<&Step> {
        self.active_steps().into_iter().find(|s| s.id == step_id)
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.workflow_id != self.id {
                return Err(DefinitionError::ForeignStep {
                    step_id: step.id,
                    expected: self.id,
                    actual: step.workflow_id,
                });
            }
            if !seen.insert(step.sequence) {
                return Err(DefinitionError::DuplicateSequence(step.sequence));
            }
        }

        Ok(())
    }
}

/// Serde support for Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

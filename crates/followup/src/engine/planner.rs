//! Pure step planning
//!
//! Given a loaded instance, a snapshot of its workflow and the current time,
//! decide which step runs (if any), what the instance becomes, and which log
//! entry records it. Nothing here touches storage or the network.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::definition::{ChannelKind, Step, WorkflowDefinition};
use crate::instance::{ExecutionLogEntry, FollowupInstance, InstanceState, NO_DELIVERY_NOTE};
use crate::notify::{MessageTemplate, Recipient};

/// Role notified by staff steps that do not name one
pub const DEFAULT_STAFF_ROLE: &str = "followup_coordinator";

/// Delivery work left after planning
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchIntent {
    /// The log entry is already final
    None,

    /// Notify staff; `address` comes from the step, otherwise `role` is looked up
    Staff {
        step: Step,
        address: Option<String>,
        role: String,
    },

    /// Notify the recipient through the step's channel
    Member { step: Step },
}

/// Everything one executor run will write
#[derive(Debug, Clone, PartialEq)]
pub struct StepPlan {
    /// Instance as it should be stored; the version is the loaded one
    pub instance: FollowupInstance,
    pub log: ExecutionLogEntry,
    pub dispatch: DispatchIntent,
}

impl StepPlan {
    pub fn completes(&self) -> bool {
        matches!(self.instance.state, InstanceState::Completed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct StepPlanner {
    default_staff_role: String,
}

impl Default for StepPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_STAFF_ROLE)
    }
}

impl StepPlanner {
    pub fn new(default_staff_role: impl Into<String>) -> Self {
        Self {
            default_staff_role: default_staff_role.into(),
        }
    }

    pub fn default_staff_role(&self) -> &str {
        &self.default_staff_role
    }

    /// Plan the next run of `instance`
    ///
    /// A missing workflow plans like one without active steps. The current
    /// step is located among the active steps only, so a step that was
    /// deleted or deactivated since it ran restarts the sequence.
    pub fn plan(
        &self,
        instance: &FollowupInstance,
        workflow: Option<&WorkflowDefinition>,
        now: DateTime<Utc>,
    ) -> StepPlan {
        let candidate = workflow.and_then(|workflow| {
            match instance
                .state
                .current_step()
                .and_then(|id| workflow.active_step(id))
            {
                None => workflow.first_active_step(),
                Some(current) => workflow.next_active_after(current.sequence),
            }
        });

        let mut next = instance.clone();

        let Some(step) = candidate else {
            next.state = InstanceState::Completed { completed_at: now };
            return StepPlan {
                instance: next,
                log: ExecutionLogEntry::workflow_completed(instance.id, now),
                dispatch: DispatchIntent::None,
            };
        };

        let next_run_at = workflow
            .and_then(|w| w.next_active_after(step.sequence))
            .map(|following| following.due_from(now));

        next.state = InstanceState::InProgress {
            current_step: Some(step.id),
            next_run_at,
        };
        next.last_step_run_at = Some(now);

        let mut log = ExecutionLogEntry::queued(instance.id, step, now);

        let dispatch = match step.channel.kind() {
            ChannelKind::Staff => DispatchIntent::Staff {
                step: (*step).clone(),
                address: step.metadata_str("notify_email").map(str::to_string),
                role: step
                    .metadata_str("notify_role")
                    .unwrap_or(&self.default_staff_role)
                    .to_string(),
            },
            ChannelKind::MemberFacing => DispatchIntent::Member {
                step: (*step).clone(),
            },
            ChannelKind::NoDelivery => {
                log.mark_skipped(NO_DELIVERY_NOTE);
                DispatchIntent::None
            }
        };

        StepPlan {
            instance: next,
            log,
            dispatch,
        }
    }
}

/// Gateway payload: step metadata plus recipient and template fields
pub fn build_payload(
    step: &Step,
    recipient: Option<&Recipient>,
    template: Option<&MessageTemplate>,
) -> Value {
    let mut payload = match &step.metadata {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    payload.insert("step_sequence".to_string(), Value::from(step.sequence));
    payload.insert("channel".to_string(), Value::from(step.channel.as_str()));

    if let Some(recipient) = recipient {
        payload.insert("recipient_name".to_string(), Value::from(recipient.full_name()));
        payload.insert(
            "recipient_first_name".to_string(),
            Value::from(recipient.first_name.clone()),
        );
    }

    if let Some(template) = template {
        payload.insert("template_id".to_string(), Value::from(template.id.to_string()));
        payload.insert("template_name".to_string(), Value::from(template.name.clone()));
        if let Some(subject) = &template.subject {
            payload.insert("subject".to_string(), Value::from(subject.clone()));
        }
        payload.insert("body".to_string(), Value::from(template.body.clone()));
    }

    Value::Object(payload)
}

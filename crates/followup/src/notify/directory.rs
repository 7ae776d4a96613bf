//! Recipient, staff and template lookups

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::Channel;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Person a workflow is run for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,

    /// Account id for in-app notifications, if the recipient has one
    pub user_id: Option<Uuid>,
}

impl Recipient {
    pub fn new(tenant_id: Uuid, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: None,
            phone: None,
            user_id: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Address for a member-facing channel; blank values count as missing
    pub fn contact_for(&self, channel: &Channel) -> Option<String> {
        let contact = match channel {
            Channel::Email => self.email.clone(),
            Channel::Sms => self.phone.clone(),
            Channel::InApp => self.user_id.map(|id| id.to_string()),
            Channel::StaffNotification | Channel::Other(_) => None,
        };
        contact.filter(|c| !c.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub subject: Option<String>,
    pub body: String,
}

/// Read access to tenant directory data
#[async_trait]
pub trait Directory: Send + Sync {
    async fn recipient(
        &self,
        tenant_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Option<Recipient>, DirectoryError>;

    /// Address of a staff member holding `role` in the tenant
    async fn staff_address_for_role(
        &self,
        tenant_id: Uuid,
        role: &str,
    ) -> Result<Option<String>, DirectoryError>;

    async fn template(
        &self,
        tenant_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<MessageTemplate>, DirectoryError>;
}

/// In-memory directory
#[derive(Default)]
pub struct StaticDirectory {
    recipients: RwLock<HashMap<(Uuid, Uuid), Recipient>>,
    staff: RwLock<HashMap<(Uuid, String), String>>,
    templates: RwLock<HashMap<(Uuid, Uuid), MessageTemplate>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_recipient(&self, recipient: Recipient) {
        self.recipients
            .write()
            .insert((recipient.tenant_id, recipient.id), recipient);
    }

    pub fn add_staff(&self, tenant_id: Uuid, role: impl Into<String>, address: impl Into<String>) {
        self.staff
            .write()
            .insert((tenant_id, role.into()), address.into());
    }

    pub fn add_template(&self, template: MessageTemplate) {
        self.templates
            .write()
            .insert((template.tenant_id, template.id), template);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn recipient(
        &self,
        tenant_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Option<Recipient>, DirectoryError> {
        Ok(self
            .recipients
            .read()
            .get(&(tenant_id, recipient_id))
            .cloned())
    }

    async fn staff_address_for_role(
        &self,
        tenant_id: Uuid,
        role: &str,
    ) -> Result<Option<String>, DirectoryError> {
        Ok(self
            .staff
            .read()
            .get(&(tenant_id, role.to_string()))
            .cloned())
    }

    async fn template(
        &self,
        tenant_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<MessageTemplate>, DirectoryError> {
        Ok(self
            .templates
            .read()
            .get(&(tenant_id, template_id))
            .cloned())
    }
}

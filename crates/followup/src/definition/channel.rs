//! Delivery channels

use std::convert::Infallible;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Channel a step is delivered through
///
/// Unknown names are preserved as [`Channel::Other`] so operators can add
/// manual steps (calls, tasks) that need no automated delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Channel {
    Email,
    Sms,
    InApp,
    StaffNotification,
    Other(String),
}

/// How the executor treats a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Delivered to the recipient themselves
    MemberFacing,
    /// Delivered to a staff member about the recipient
    Staff,
    /// Recorded only
    NoDelivery,
}

impl Channel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Email | Self::Sms | Self::InApp => ChannelKind::MemberFacing,
            Self::StaffNotification => ChannelKind::Staff,
            Self::Other(_) => ChannelKind::NoDelivery,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::InApp => "in_app",
            Self::StaffNotification => "staff_notification",
            Self::Other(name) => name,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "email" => Self::Email,
            "sms" => Self::Sms,
            "in_app" => Self::InApp,
            "staff_notification" => Self::StaffNotification,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<String> for Channel {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(channel) => channel,
            Err(infallible) => match infallible {},
        }
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        value.as_str().to_string()
    }
}

//! External collaborators: notification delivery and directory lookups

mod directory;
mod gateway;
mod http;

pub use directory::{Directory, DirectoryError, MessageTemplate, Recipient, StaticDirectory};
pub use gateway::{
    DeliveryId, DispatchRequest, GatewayError, LogOnlyGateway, NotificationGateway,
    RecordingGateway,
};
pub use http::HttpNotificationGateway;

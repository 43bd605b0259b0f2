pub mod broker;
pub mod message;
pub mod publisher;
pub mod store;

pub use broker::{BrokerError, MessageBroker, OutboxBroker, PublishOptions, Publisher};
pub use message::{build_object_link, LinkError, StatusTransitionMessage};
pub use publisher::{MessengerError, StatusMessenger, CONTENT_TYPE_JSON};
pub use store::{FileObjectStore, ObjectStore, PatchOperation, StoreError};

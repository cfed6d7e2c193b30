pub mod conversation;
pub mod document;
pub mod session;
pub mod status;

pub use conversation::{Conversation, DocumentSnapshot, Message, MessageRole};
pub use document::Document;
pub use session::{ContainerConfig, Session, SessionCredentials, SessionDescriptor};
pub use status::{HealthReport, ProcessStatus, RuntimeContainer, SessionState, TtlStatus};

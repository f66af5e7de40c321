//! Concrete collaborators for the chain engine: SendGrid delivery with
//! webhook ingestion, the interaction log, profile tags, the operator inbox,
//! draft generation and snapshots of that state.

pub mod drafts;
pub mod email;
pub mod interactions;
pub mod operator;
pub mod snapshot;
pub mod tags;

pub use drafts::TemplateDraftGenerator;
pub use email::{EmailWebhookEvent, SendGridMailer};
pub use interactions::InteractionLog;
pub use operator::OperatorInbox;
pub use snapshot::ChannelSnapshot;
pub use tags::ProfileTags;

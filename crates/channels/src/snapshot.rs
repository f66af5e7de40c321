//! Durable image of the channel-side state the engine depends on after a
//! restart: the interaction log (unsubscribes and conversions gate every
//! send), the mailer's suppression list and profile tags.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use dripline_core::types::InteractionEvent;

use crate::email::SendGridMailer;
use crate::interactions::InteractionLog;
use crate::tags::ProfileTags;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interactions: Vec<InteractionEvent>,
    #[serde(default)]
    pub suppressed: Vec<String>,
    #[serde(default)]
    pub tags: Vec<(String, Vec<String>)>,
}

impl ChannelSnapshot {
    pub fn capture(log: &InteractionLog, mailer: &SendGridMailer, tags: &ProfileTags) -> Self {
        Self {
            taken_at: Some(Utc::now()),
            interactions: log.all(),
            suppressed: mailer.suppressed_addresses(),
            tags: tags.entries(),
        }
    }

    pub fn restore(self, log: &InteractionLog, mailer: &SendGridMailer, tags: &ProfileTags) {
        let events = self.interactions.len();
        for event in self.interactions {
            log.record(event);
        }
        for address in &self.suppressed {
            mailer.suppress(address);
        }
        for (subscriber_id, set) in self.tags {
            tags.set_tags(&subscriber_id, set);
        }
        info!(
            interactions = events,
            suppressed = self.suppressed.len(),
            "Channel state restored from snapshot"
        );
    }

    /// Writes the snapshot next to `path` and renames it into place.
    pub fn save_to(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Channel snapshot written");
        Ok(())
    }

    /// Loads a snapshot file, or an empty one when none exists yet.
    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No channel snapshot found, starting empty");
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}

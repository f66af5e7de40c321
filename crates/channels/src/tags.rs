//! Subscriber profile tags.

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use dripline_core::delivery::TagWriter;

/// Tag sets per subscriber.
#[derive(Default)]
pub struct ProfileTags {
    tags: DashMap<String, BTreeSet<String>>,
}

impl ProfileTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags_for(&self, subscriber_id: &str) -> Vec<String> {
        self.tags
            .get(subscriber_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every subscriber that carries at least one tag.
    pub fn entries(&self) -> Vec<(String, Vec<String>)> {
        self.tags
            .iter()
            .filter(|r| !r.value().is_empty())
            .map(|r| (r.key().clone(), r.value().iter().cloned().collect()))
            .collect()
    }

    /// Replaces a subscriber's tag set.
    pub fn set_tags(&self, subscriber_id: &str, tags: impl IntoIterator<Item = String>) {
        self.tags
            .insert(subscriber_id.to_string(), tags.into_iter().collect());
    }

    pub fn has_tag(&self, subscriber_id: &str, tag: &str) -> bool {
        self.tags
            .get(subscriber_id)
            .map(|set| set.contains(tag))
            .unwrap_or(false)
    }
}

#[async_trait]
impl TagWriter for ProfileTags {
    async fn add_tag(&self, subscriber_id: &str, tag: &str) -> anyhow::Result<()> {
        if tag.trim().is_empty() {
            anyhow::bail!("tag must not be empty");
        }
        let added = self
            .tags
            .entry(subscriber_id.to_string())
            .or_default()
            .insert(tag.to_string());
        if added {
            metrics::counter!("tags.added").increment(1);
            debug!(subscriber_id, tag, "Tag added");
        }
        Ok(())
    }

    async fn remove_tag(&self, subscriber_id: &str, tag: &str) -> anyhow::Result<()> {
        if let Some(mut set) = self.tags.get_mut(subscriber_id) {
            if set.remove(tag) {
                debug!(subscriber_id, tag, "Tag removed");
            }
        }
        Ok(())
    }
}

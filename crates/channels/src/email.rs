//! SendGrid email delivery with webhook-driven engagement tracking.
//!
//! Sends chain messages through the SendGrid mail API and turns inbound
//! webhook events (opened, clicked, unsubscribed, bounced) into interaction
//! events in the [`InteractionLog`] the chain engine reads.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dripline_core::config::EmailConfig;
use dripline_core::delivery::{DeliveryReceipt, MessageBody, MessageSender, OutboundMessage};
use dripline_core::types::{InteractionEvent, InteractionKind};
use dripline_core::Clock;

use crate::interactions::InteractionLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Processed,
    Dropped,
    Delivered,
    Deferred,
    Bounce,
    Open,
    Click,
    SpamReport,
    Unsubscribe,
    GroupUnsubscribe,
    GroupResubscribe,
}

/// One SendGrid event webhook record. `subscriber_id` and `checkpoint` come
/// back from the custom args set on send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailWebhookEvent {
    pub email: String,
    pub event: EmailEventType,
    #[serde(default)]
    pub sg_event_id: Option<String>,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(default)]
    pub subscriber_id: Option<String>,
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Delivery and engagement counts for one template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailAnalytics {
    pub template: String,
    pub total_sent: u64,
    pub delivered: u64,
    pub opens: u64,
    pub unique_opens: u64,
    pub clicks: u64,
    pub unique_clicks: u64,
    pub bounces: u64,
    pub unsubscribes: u64,
    pub open_rate: f64,
    pub click_rate: f64,
}

struct SentMessage {
    subscriber_id: String,
    template: String,
    checkpoint: String,
}

pub struct SendGridMailer {
    config: EmailConfig,
    log: Arc<InteractionLog>,
    clock: Arc<dyn Clock>,
    analytics: DashMap<String, EmailAnalytics>,
    unique_opens: DashMap<String, HashSet<String>>,
    unique_clicks: DashMap<String, HashSet<String>>,
    messages: DashMap<String, SentMessage>,
    /// Hard-bounced or dropped addresses. Sends to them fail fast.
    suppressed: DashMap<String, ()>,
    seen_events: DashMap<String, ()>,
}

impl SendGridMailer {
    pub fn new(config: EmailConfig, log: Arc<InteractionLog>, clock: Arc<dyn Clock>) -> Self {
        info!(
            from = %config.from_email,
            open_tracking = config.open_tracking,
            click_tracking = config.click_tracking,
            "SendGrid mailer initialized"
        );
        Self {
            config,
            log,
            clock,
            analytics: DashMap::new(),
            unique_opens: DashMap::new(),
            unique_clicks: DashMap::new(),
            messages: DashMap::new(),
            suppressed: DashMap::new(),
            seen_events: DashMap::new(),
        }
    }

    fn template_of(body: &MessageBody) -> String {
        match body {
            MessageBody::Template(key) => key.clone(),
            MessageBody::Content(_) => "approved_draft".to_string(),
        }
    }

    /// SendGrid v3 mail/send payload for `message`.
    pub fn build_payload(&self, message: &OutboundMessage) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "personalizations": [{
                "to": [{"email": message.to_email}],
                "dynamic_template_data": message.personalization,
                "custom_args": {
                    "subscriber_id": message.subscriber_id,
                    "checkpoint": message.idempotency_key
                }
            }],
            "from": {
                "email": self.config.from_email,
                "name": self.config.from_name
            },
            "headers": {"Idempotency-Key": message.idempotency_key},
            "tracking_settings": {
                "click_tracking": {"enable": self.config.click_tracking},
                "open_tracking": {"enable": self.config.open_tracking}
            }
        });
        match &message.body {
            MessageBody::Template(key) => {
                payload["template_id"] = serde_json::json!(key);
            }
            MessageBody::Content(text) => {
                payload["content"] = serde_json::json!([{"type": "text/plain", "value": text}]);
            }
        }
        payload
    }

    /// Applies a webhook event: updates analytics and records the matching
    /// interaction. Returns the interaction when one was recorded.
    pub fn process_webhook(&self, event: &EmailWebhookEvent) -> Option<InteractionEvent> {
        if let Some(id) = &event.sg_event_id {
            if self.seen_events.insert(id.clone(), ()).is_some() {
                debug!(sg_event_id = %id, "Webhook event already processed");
                return None;
            }
        }

        metrics::counter!(
            "sendgrid.webhook_events",
            "type" => format!("{:?}", event.event)
        )
        .increment(1);

        let sent = event
            .sg_message_id
            .as_ref()
            .and_then(|id| self.messages.get(id));
        let subscriber_id = event
            .subscriber_id
            .clone()
            .or_else(|| sent.as_ref().map(|m| m.subscriber_id.clone()));
        let checkpoint = event
            .checkpoint
            .clone()
            .or_else(|| sent.as_ref().map(|m| m.checkpoint.clone()));
        let template = sent.as_ref().map(|m| m.template.clone());
        drop(sent);

        if let Some(template) = &template {
            self.update_analytics(template, event);
        }

        let kind = match event.event {
            EmailEventType::Open => InteractionKind::Open,
            EmailEventType::Click => InteractionKind::Click,
            EmailEventType::Unsubscribe
            | EmailEventType::GroupUnsubscribe
            | EmailEventType::SpamReport => InteractionKind::Unsubscribe,
            EmailEventType::Bounce | EmailEventType::Dropped => {
                warn!(email = %event.email, event = ?event.event, "Address suppressed");
                self.suppress(&event.email);
                return None;
            }
            _ => return None,
        };

        let Some(subscriber_id) = subscriber_id else {
            warn!(event = ?event.event, email = %event.email, "Webhook event without subscriber, skipping");
            return None;
        };

        let mut interaction = InteractionEvent::new(subscriber_id, kind, event.timestamp);
        if let Some(checkpoint) = checkpoint {
            interaction = interaction.with_reference(checkpoint);
        }
        if let Some(url) = &event.url {
            interaction.metadata = serde_json::json!({ "url": url });
        }
        self.log.record(interaction.clone());
        Some(interaction)
    }

    fn update_analytics(&self, template: &str, event: &EmailWebhookEvent) {
        let mut a = self.analytics.entry(template.to_string()).or_default();
        match event.event {
            EmailEventType::Delivered => a.delivered += 1,
            EmailEventType::Open => {
                a.opens += 1;
                let mut unique = self.unique_opens.entry(template.to_string()).or_default();
                if unique.insert(event.email.clone()) {
                    a.unique_opens += 1;
                }
            }
            EmailEventType::Click => {
                a.clicks += 1;
                let mut unique = self.unique_clicks.entry(template.to_string()).or_default();
                if unique.insert(event.email.clone()) {
                    a.unique_clicks += 1;
                }
            }
            EmailEventType::Bounce => a.bounces += 1,
            EmailEventType::Unsubscribe | EmailEventType::GroupUnsubscribe => a.unsubscribes += 1,
            _ => {}
        }
        if a.total_sent > 0 {
            let sent = a.total_sent as f64;
            a.open_rate = a.unique_opens as f64 / sent;
            a.click_rate = a.unique_clicks as f64 / sent;
        }
    }

    pub fn analytics(&self, template: &str) -> Option<EmailAnalytics> {
        self.analytics.get(template).map(|a| a.clone())
    }

    pub fn suppress(&self, email: &str) {
        self.suppressed.insert(email.to_lowercase(), ());
    }

    pub fn suppressed_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.suppressed.iter().map(|r| r.key().clone()).collect();
        addresses.sort();
        addresses
    }

    pub fn is_suppressed(&self, email: &str) -> bool {
        self.suppressed.contains_key(&email.to_lowercase())
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }
}

#[async_trait]
impl MessageSender for SendGridMailer {
    /// In production: POST the payload to https://api.sendgrid.com/v3/mail/send
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, String> {
        if !message.to_email.contains('@') {
            return Err(format!("invalid recipient '{}'", message.to_email));
        }
        if self.is_suppressed(&message.to_email) {
            metrics::counter!("sendgrid.suppressed").increment(1);
            return Err(format!("recipient {} is suppressed", message.to_email));
        }

        let template = Self::template_of(&message.body);
        let _payload = self.build_payload(message);
        debug!(
            subscriber_id = %message.subscriber_id,
            to = %message.to_email,
            template = %template,
            checkpoint = %message.idempotency_key,
            "Sending email via SendGrid"
        );
        metrics::counter!("sendgrid.emails_sent", "template" => template.clone()).increment(1);

        let now = self.clock.now();
        let sg_message_id = format!("sg-{}", uuid::Uuid::new_v4());
        self.analytics
            .entry(template.clone())
            .or_insert_with(|| EmailAnalytics {
                template: template.clone(),
                ..Default::default()
            })
            .total_sent += 1;
        self.messages.insert(
            sg_message_id.clone(),
            SentMessage {
                subscriber_id: message.subscriber_id.clone(),
                template,
                checkpoint: message.idempotency_key.clone(),
            },
        );
        self.log.record(
            InteractionEvent::new(&message.subscriber_id, InteractionKind::Sent, now)
                .with_reference(&message.idempotency_key),
        );

        Ok(DeliveryReceipt {
            provider_message_id: sg_message_id,
            accepted_at: now,
        })
    }
}

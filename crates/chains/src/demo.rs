//! Chains seeded into development setups.

use dripline_core::config::PacingConfig;
use dripline_core::ChainResult;

use crate::catalog::ChainCatalog;
use crate::policy::engagement_branches;
use crate::types::{
    ApprovalStep, BranchAction, BranchCondition, ChainBranch, ChainDefinition, ChainStep,
    DripSchedule, StepKind,
};

pub const WELCOME_SERIES: &str = "welcome-series";
pub const RE_ENGAGEMENT: &str = "re-engagement";
pub const NEWSLETTER: &str = "newsletter";
pub const VIP_OUTREACH: &str = "vip-outreach";

const DAY: u64 = 86_400;

fn step(position: u32, label: &str, template_key: &str, wait_days: Option<u64>) -> ChainStep {
    ChainStep {
        position,
        label: label.to_string(),
        template_key: template_key.to_string(),
        wait_after_secs: wait_days.map(|d| d * DAY),
        kind: StepKind::Send,
    }
}

pub fn demo_chains(pacing: &PacingConfig) -> Vec<ChainDefinition> {
    vec![
        ChainDefinition {
            id: WELCOME_SERIES.to_string(),
            name: "Welcome Series".to_string(),
            description: "Onboarding sequence; splits on engagement after the third email".to_string(),
            trigger_event: "subscriber.created".to_string(),
            steps: vec![
                step(0, "Welcome", "welcome_email", Some(2)),
                step(1, "Getting Started", "getting_started_email", Some(3)),
                step(2, "Feature Highlights", "feature_highlights_email", Some(2)),
                step(3, "Customer Stories", "customer_stories_email", None),
            ],
            branches: engagement_branches(2, RE_ENGAGEMENT),
            version: 1,
        },
        ChainDefinition {
            id: RE_ENGAGEMENT.to_string(),
            name: "Re-engagement".to_string(),
            description: "Win-back sequence for subscribers who stopped engaging".to_string(),
            trigger_event: "subscriber.inactive".to_string(),
            steps: vec![
                step(0, "We Miss You", "we_miss_you_email", Some(3)),
                step(1, "Last Chance", "last_chance_email", Some(4)),
            ],
            branches: vec![ChainBranch {
                position: 1,
                label: "dormant".to_string(),
                condition: BranchCondition::Ghosted,
                action: BranchAction::Halt {
                    reason: "no engagement after win-back".to_string(),
                },
                tag: Some("dormant".to_string()),
                description: "Stop mailing subscribers who ignore the win-back".to_string(),
            }],
            version: 1,
        },
        ChainDefinition {
            id: NEWSLETTER.to_string(),
            name: "Newsletter".to_string(),
            description: "Recurring newsletter that backs off when ignored".to_string(),
            trigger_event: "newsletter.opt_in".to_string(),
            steps: vec![ChainStep {
                position: 0,
                label: "Issue".to_string(),
                template_key: "newsletter_issue".to_string(),
                wait_after_secs: None,
                kind: StepKind::Drip(DripSchedule {
                    initial_wait_secs: pacing.initial_wait_secs,
                    escalated_wait_secs: pacing.escalated_wait_secs,
                    miss_threshold: pacing.miss_threshold,
                    max_sends: 26,
                }),
            }],
            branches: Vec::new(),
            version: 1,
        },
        ChainDefinition {
            id: VIP_OUTREACH.to_string(),
            name: "VIP Outreach".to_string(),
            description: "Personal note reviewed by an operator before it goes out".to_string(),
            trigger_event: "subscriber.vip".to_string(),
            steps: vec![
                ChainStep {
                    position: 0,
                    label: "Personal Note".to_string(),
                    template_key: "vip_fallback_email".to_string(),
                    wait_after_secs: Some(5 * DAY),
                    kind: StepKind::Approval(ApprovalStep {
                        instructions: "Thank the subscriber for their loyalty and mention their \
                                       most recent purchase."
                            .to_string(),
                        timeout_secs: None,
                    }),
                },
                step(1, "VIP Perks", "vip_perks_email", None),
            ],
            branches: Vec::new(),
            version: 1,
        },
    ]
}

/// Registers the demo chains. Returns how many were added.
pub fn seed(catalog: &ChainCatalog, pacing: &PacingConfig) -> ChainResult<usize> {
    let chains = demo_chains(pacing);
    let count = chains.len();
    for chain in chains {
        catalog.register(chain)?;
    }
    Ok(count)
}

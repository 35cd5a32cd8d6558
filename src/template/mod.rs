//! Declarative daily-quota templates for posting and warmup campaigns.
//!
//! A template says *how much* of each action kind a device should perform
//! per day and where the content comes from; the mapper turns it into an
//! ordered action stream and the executor paces that stream against the
//! device. Templates are copied when a run starts, so later edits never
//! affect an in-flight run.

mod mapper;

pub use mapper::{Action, MAX_SCROLL_ACTIONS, SCROLLS_PER_MINUTE, map};

use serde::{Deserialize, Serialize};

/// Per-day action counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionQuotas {
    pub posts_per_day: u32,
    pub likes_per_day: u32,
    pub follows_per_day: u32,
    pub comments_per_day: u32,
    pub story_views_per_day: u32,
    pub scroll_minutes_per_day: u32,
}

/// References to the content pools actions draw from.
///
/// These are opaque identifiers (folder names, list ids) resolved by the
/// on-device automation driver, not by the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentRefs {
    pub caption_sources: Vec<String>,
    pub media_sources: Vec<String>,
    pub comment_sources: Vec<String>,
    pub target_lists: Vec<String>,
}

/// A declarative quota configuration for one campaign day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Target platform (e.g. "instagram", "tiktok").
    pub platform: String,
    pub quotas: ActionQuotas,
    pub content: ContentRefs,
    /// Minutes between paced actions during execution.
    pub interval_minutes: u64,
}

impl Template {
    /// Create a template with empty content refs and the given quotas.
    pub fn new(platform: impl Into<String>, quotas: ActionQuotas, interval_minutes: u64) -> Self {
        Self {
            platform: platform.into(),
            quotas,
            content: ContentRefs::default(),
            interval_minutes,
        }
    }

    /// Total number of actions this template maps to.
    pub fn action_count(&self) -> usize {
        map(self).len()
    }
}

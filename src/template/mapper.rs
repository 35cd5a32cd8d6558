//! Template-to-action-stream mapping.
//!
//! `map` is a pure function: same template in, same action sequence out.
//! Emission order follows the declaration order of the quota fields and is
//! never shuffled here — humanized pacing between actions is the run
//! executor's concern, not the mapper's.

use serde::{Deserialize, Serialize};

use crate::template::Template;

/// Discrete scroll actions emitted per quota minute.
pub const SCROLLS_PER_MINUTE: u32 = 2;

/// Ceiling on scroll actions from a single template.
pub const MAX_SCROLL_ACTIONS: u32 = 120;

/// One abstract UI action, dispatched to a device as a job payload.
///
/// A closed set: the action executor pattern-matches exhaustively, so adding
/// a variant is a compile-visible change for every driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Post {
        caption_source: Option<String>,
        media_source: Option<String>,
    },
    Like {
        target_list: Option<String>,
    },
    Follow {
        target_list: Option<String>,
    },
    Comment {
        target_list: Option<String>,
        comment_source: Option<String>,
    },
    ViewStory {
        target_list: Option<String>,
    },
    Scroll {
        seconds: u32,
    },
}

impl Action {
    /// Stable kind label used in logs and job summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Post { .. } => "post",
            Action::Like { .. } => "like",
            Action::Follow { .. } => "follow",
            Action::Comment { .. } => "comment",
            Action::ViewStory { .. } => "view_story",
            Action::Scroll { .. } => "scroll",
        }
    }
}

/// Map a template into its ordered action sequence.
///
/// Each quota field with a count above zero contributes that many actions,
/// with content references assigned round-robin from the template's pools.
/// Scroll minutes become discrete scroll actions: `SCROLLS_PER_MINUTE` per
/// minute, at least one when any minutes are configured, capped at
/// `MAX_SCROLL_ACTIONS`.
pub fn map(template: &Template) -> Vec<Action> {
    let quotas = &template.quotas;
    let content = &template.content;
    let mut actions = Vec::new();

    for i in 0..quotas.posts_per_day {
        actions.push(Action::Post {
            caption_source: pick(&content.caption_sources, i),
            media_source: pick(&content.media_sources, i),
        });
    }

    for i in 0..quotas.likes_per_day {
        actions.push(Action::Like {
            target_list: pick(&content.target_lists, i),
        });
    }

    for i in 0..quotas.follows_per_day {
        actions.push(Action::Follow {
            target_list: pick(&content.target_lists, i),
        });
    }

    for i in 0..quotas.comments_per_day {
        actions.push(Action::Comment {
            target_list: pick(&content.target_lists, i),
            comment_source: pick(&content.comment_sources, i),
        });
    }

    for i in 0..quotas.story_views_per_day {
        actions.push(Action::ViewStory {
            target_list: pick(&content.target_lists, i),
        });
    }

    if quotas.scroll_minutes_per_day > 0 {
        let count = (quotas.scroll_minutes_per_day * SCROLLS_PER_MINUTE)
            .clamp(1, MAX_SCROLL_ACTIONS);
        let seconds_each = (quotas.scroll_minutes_per_day * 60).div_ceil(count);
        for _ in 0..count {
            actions.push(Action::Scroll {
                seconds: seconds_each,
            });
        }
    }

    actions
}

/// Round-robin pick from a content pool; `None` when the pool is empty.
fn pick(pool: &[String], index: u32) -> Option<String> {
    if pool.is_empty() {
        None
    } else {
        Some(pool[index as usize % pool.len()].clone())
    }
}

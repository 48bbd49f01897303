//! History management: retention, truncation, orphan repair, cache hints.
//!
//! `manage` is pure: given a message sequence and a soft character budget
//! it returns a pruned sequence. Messages survive either because a
//! retention rule names them (forced, allowed to exceed the budget) or
//! because the greedy newest-first fill had room. A cleanup pass then
//! restores tool-call/tool-result pairing, and cache hints are placed on
//! the stable prefix and the current turn.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use side::{CacheHint, ChatMessage, ChatRole, ContextTag, MessageContent};

/// Report lines look like `edit_block:3 application SUCCESS`.
static REPORT_SEQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"edit_block:(\d+)\s+application").unwrap());

/// Proposal fences open with ```` ```edit_block:3 update path ````.
static PROPOSAL_SEQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^```edit_block:(\d+)\b").unwrap());

/// Why a message survived. Ordered so reason sets can be compared when
/// computing contiguous blocks for cache-hint placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RetainReason {
    LastMessage,
    InitialInstructions,
    UserFeedback,
    LatestTestResult,
    LatestSelfReview,
    LatestSummary,
    EditBlockReport,
    Budget,
}

/// Provider ceiling on cache markers.
const MAX_CACHE_HINTS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct ManageOptions {
    /// Place additional cache hints at ranked block starts beyond the two
    /// endpoints. Off pending validation; the four-marker ceiling applies
    /// either way.
    pub extra_cache_hints: bool,
}

pub fn manage(messages: &[ChatMessage], soft_limit_chars: usize) -> Vec<ChatMessage> {
    manage_with(messages, soft_limit_chars, &ManageOptions::default())
}

pub fn manage_with(
    messages: &[ChatMessage],
    soft_limit_chars: usize,
    options: &ManageOptions,
) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return Vec::new();
    }
    let n = messages.len();
    let total: usize = messages.iter().map(ChatMessage::char_len).sum();

    // When the input already fits, the full soft limit is the budget.
    // Otherwise keep 10% headroom so appends after this pass still land
    // cache-compatible.
    let budget = if total <= soft_limit_chars {
        soft_limit_chars
    } else {
        soft_limit_chars * 9 / 10
    };

    let mut reasons: Vec<BTreeSet<RetainReason>> = vec![BTreeSet::new(); n];

    // Rule 1: the last message always survives. A trailing tool result
    // pulls in its assistant tool-call message and every sibling result
    // after it, so the cleanup pass cannot cascade into dropping the tail.
    reasons[n - 1].insert(RetainReason::LastMessage);
    if messages[n - 1].is_tool_result() {
        if let Some(a) = (0..n - 1)
            .rev()
            .find(|&i| messages[i].role == ChatRole::Assistant && !messages[i].tool_calls.is_empty())
        {
            for slot in reasons.iter_mut().take(n).skip(a) {
                slot.insert(RetainReason::LastMessage);
            }
        }
    }

    // Rule 2: initial instructions are permanent.
    for (i, msg) in messages.iter().enumerate() {
        if msg.context_tag == Some(ContextTag::InitialInstructions) {
            reasons[i].insert(RetainReason::InitialInstructions);
        }
    }

    // Rule 3: every user-feedback message plus its forward block.
    for i in 0..n {
        if messages[i].context_tag == Some(ContextTag::UserFeedback) {
            retain_with_forward_block(messages, &mut reasons, i, RetainReason::UserFeedback);
        }
    }

    // Rule 4: latest-only tags keep their most recent instance plus its
    // forward block.
    for (tag, reason) in [
        (ContextTag::TestResult, RetainReason::LatestTestResult),
        (ContextTag::SelfReviewFeedback, RetainReason::LatestSelfReview),
        (ContextTag::Summary, RetainReason::LatestSummary),
    ] {
        if let Some(i) = messages.iter().rposition(|m| m.context_tag == Some(tag)) {
            retain_with_forward_block(messages, &mut reasons, i, reason);
        }
    }

    // Rule 5: the latest edit-block report keeps everything from itself to
    // the end, plus each cited proposal and the span between proposal and
    // report.
    if let Some(r) = messages
        .iter()
        .rposition(|m| m.context_tag == Some(ContextTag::EditBlockReport))
    {
        for slot in reasons.iter_mut().take(n).skip(r) {
            slot.insert(RetainReason::EditBlockReport);
        }
        for seq in report_sequence_numbers(&messages[r].content.as_text()) {
            if let Some(p) = (0..r)
                .rev()
                .find(|&i| proposal_sequence_numbers(&messages[i].content.as_text()).contains(&seq))
            {
                for slot in reasons.iter_mut().take(r).skip(p) {
                    slot.insert(RetainReason::EditBlockReport);
                }
            }
        }
    }

    // Rule 6: truncate oversize unretained tool results, oldest first,
    // stopping once the whole sequence fits the budget.
    let mut working: Vec<ChatMessage> = messages.to_vec();
    let cap = budget / 20;
    let mut total_now = total;
    for i in 0..n {
        if total_now <= budget {
            break;
        }
        if !reasons[i].is_empty() || !working[i].is_tool_result() {
            continue;
        }
        let len = working[i].char_len();
        if len > cap {
            let text = working[i].content.as_text();
            let kept: String = text.chars().take(cap).collect();
            working[i].content = MessageContent::Text(format!("{kept}\n[truncated]"));
            total_now -= len.saturating_sub(working[i].char_len());
        }
    }

    // Rule 8: greedy fill, newest to oldest. The first miss ends the fill;
    // older messages are not reconsidered.
    let mut remaining = budget;
    for i in (0..n).rev() {
        if !reasons[i].is_empty() {
            continue;
        }
        let len = working[i].char_len();
        if len <= remaining {
            reasons[i].insert(RetainReason::Budget);
            remaining -= len;
        } else {
            break;
        }
    }

    // Assemble, then rule 9: repair orphaned pairings in lockstep with the
    // reason array until stable.
    let mut kept: Vec<(ChatMessage, BTreeSet<RetainReason>)> = working
        .into_iter()
        .zip(reasons)
        .filter(|(_, r)| !r.is_empty())
        .collect();
    cleanup_orphans(&mut kept);

    // Rule 10: cache hints. Two endpoint markers always; ranked block
    // starts only when enabled, never exceeding the provider ceiling.
    for (msg, _) in kept.iter_mut() {
        msg.cache_hint = None;
    }
    if !kept.is_empty() {
        let last = kept.len() - 1;
        kept[0].0.cache_hint = Some(CacheHint::Ephemeral);
        kept[last].0.cache_hint = Some(CacheHint::Ephemeral);

        if options.extra_cache_hints {
            let mut used = if last == 0 { 1 } else { 2 };
            for start in ranked_block_starts(&kept) {
                if used >= MAX_CACHE_HINTS {
                    break;
                }
                if kept[start].0.cache_hint.is_none() {
                    kept[start].0.cache_hint = Some(CacheHint::Ephemeral);
                    used += 1;
                }
            }
        }
    }

    kept.into_iter().map(|(m, _)| m).collect()
}

/// Retain `i` and the contiguous run of untagged messages after it, up to
/// but excluding the next tagged message.
fn retain_with_forward_block(
    messages: &[ChatMessage],
    reasons: &mut [BTreeSet<RetainReason>],
    i: usize,
    reason: RetainReason,
) {
    reasons[i].insert(reason);
    for j in i + 1..messages.len() {
        if messages[j].context_tag.is_some() {
            break;
        }
        reasons[j].insert(reason);
    }
}

fn report_sequence_numbers(content: &str) -> Vec<u32> {
    REPORT_SEQ_RE
        .captures_iter(content)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

fn proposal_sequence_numbers(content: &str) -> Vec<u32> {
    PROPOSAL_SEQ_RE
        .captures_iter(content)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Drop (a) assistant messages whose tool calls are not all answered by a
/// following retained tool result and (b) tool results with no preceding
/// retained tool call, repeating until stable.
fn cleanup_orphans(kept: &mut Vec<(ChatMessage, BTreeSet<RetainReason>)>) {
    loop {
        let mut drop_flags = vec![false; kept.len()];
        for idx in 0..kept.len() {
            let msg = &kept[idx].0;
            if msg.role == ChatRole::Assistant && !msg.tool_calls.is_empty() {
                let all_answered = msg.tool_calls.iter().all(|call| {
                    kept[idx + 1..]
                        .iter()
                        .any(|(m, _)| m.tool_call_id.as_deref() == Some(call.id.as_str()))
                });
                if !all_answered {
                    drop_flags[idx] = true;
                }
            }
            if msg.is_tool_result() {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let bound = kept[..idx]
                    .iter()
                    .any(|(m, _)| m.tool_calls.iter().any(|c| c.id == id));
                if !bound {
                    drop_flags[idx] = true;
                }
            }
        }
        if !drop_flags.iter().any(|&d| d) {
            return;
        }
        let mut i = 0;
        kept.retain(|_| {
            let keep = !drop_flags[i];
            i += 1;
            keep
        });
    }
}

/// Contiguous blocks of messages sharing at least one retain reason with
/// their neighbor, ranked by size descending; returns block start indices.
fn ranked_block_starts(kept: &[(ChatMessage, BTreeSet<RetainReason>)]) -> Vec<usize> {
    let mut blocks: Vec<(usize, usize)> = Vec::new(); // (start, len)
    let mut start = 0;
    for i in 1..=kept.len() {
        let connected = i < kept.len() && !kept[i].1.is_disjoint(&kept[i - 1].1);
        if !connected {
            blocks.push((start, i - start));
            start = i;
        }
    }
    blocks.sort_by(|a, b| b.1.cmp(&a.1));
    blocks.into_iter().map(|(s, _)| s).collect()
}

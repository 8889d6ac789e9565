//! Token-budget compaction for a session's blocks.
//!
//! Architectural blocks are pinned; everything else is ranked by the chosen
//! [`CompactionStrategy`] and kept greedily until the budget runs out. Each
//! dropped block leaves a `- [label] excerpt` line in a new episodic summary
//! block, written in the same transaction that deletes the dropped blocks.
//!
//! A session holds at most one summary. Earlier summaries are never ranked
//! or excerpted: their cost is reserved out of the budget and their lines
//! are carried verbatim into the next summary, so repeated compaction only
//! ever appends.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::CompactionConfig;
use crate::error::{MemoryError, Result};
use crate::memory::store::{self, MemoryStore};
use crate::memory::types::{BlockType, MemoryBlock, NewBlock, SessionRecord};
use crate::memory::{estimate_tokens, truncate_preview};

/// How non-pinned blocks are ranked for retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    /// Keep the most recently created.
    Fifo,
    /// Keep the most recently accessed, falling back to creation time.
    Lru,
    /// Keep the most important.
    #[default]
    Importance,
}

impl CompactionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Lru => "lru",
            Self::Importance => "importance",
        }
    }
}

impl std::str::FromStr for CompactionStrategy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "lru" => Ok(Self::Lru),
            "importance" => Ok(Self::Importance),
            _ => Err(MemoryError::validation(format!("unknown compaction strategy: {s}"))),
        }
    }
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata key marking a block as a compaction summary.
pub const SUMMARY_METADATA_KEY: &str = "compaction";

/// Per-call overrides. `None` falls back to the [`CompactionConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactOptions {
    pub strategy: Option<CompactionStrategy>,
    /// Fraction of the budget at which `compact_if_needed` fires, in `(0, 1]`.
    pub threshold_fraction: Option<f64>,
}

/// The pinned architectural set alone does not fit the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetExceededWarning {
    pub required_tokens: usize,
    pub budget_tokens: usize,
}

impl std::fmt::Display for BudgetExceededWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "architectural blocks need {} tokens but the budget is {}",
            self.required_tokens, self.budget_tokens
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionResult {
    pub retained_ids: Vec<String>,
    pub dropped_ids: Vec<String>,
    /// One `- [label] excerpt` line per dropped block. Empty if nothing dropped.
    pub dropped_summary: String,
    /// The session's summary block after this call, if it has one. Holds
    /// the lines of every earlier compaction followed by `dropped_summary`.
    pub summary_block_id: Option<String>,
    /// Estimated tokens of the retained blocks.
    pub token_estimate: usize,
    /// Estimated tokens of the summary block.
    pub summary_tokens: usize,
    pub warning: Option<BudgetExceededWarning>,
}

/// Which blocks survive a budget, before anything is written.
#[derive(Debug)]
struct Plan {
    retained: Vec<MemoryBlock>,
    dropped: Vec<MemoryBlock>,
    /// Existing summaries, oldest first. Carried, never ranked.
    summaries: Vec<MemoryBlock>,
    token_estimate: usize,
    warning: Option<BudgetExceededWarning>,
}

pub struct Compactor {
    store: Arc<MemoryStore>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(store: Arc<MemoryStore>, config: CompactionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Estimated tokens currently held by a session's blocks.
    pub fn session_usage(&self, session_id: &str) -> Result<usize> {
        self.store.get_session(session_id)?;
        let blocks = self.store.get_blocks_by_session(session_id)?;
        Ok(blocks.iter().map(|b| self.cost(b)).sum())
    }

    /// Compact with the configured strategy.
    pub fn compact(&self, session_id: &str, budget_tokens: usize) -> Result<CompactionResult> {
        self.compact_with(session_id, budget_tokens, &CompactOptions::default())
    }

    pub fn compact_with(
        &self,
        session_id: &str,
        budget_tokens: usize,
        options: &CompactOptions,
    ) -> Result<CompactionResult> {
        let strategy = options.strategy.unwrap_or(self.config.strategy);
        self.store.get_session(session_id)?;
        let blocks = self.store.get_blocks_by_session(session_id)?;
        let plan = self.plan(blocks, budget_tokens, strategy);

        if let Some(warning) = &plan.warning {
            tracing::warn!(
                session = session_id,
                required_tokens = warning.required_tokens,
                budget_tokens = warning.budget_tokens,
                "architectural blocks exceed compaction budget"
            );
        }

        let dropped_summary = plan
            .dropped
            .iter()
            .map(|b| self.summary_line(b))
            .collect::<Vec<_>>()
            .join("\n");

        let summary = if plan.dropped.is_empty() {
            plan.summaries.last().cloned()
        } else {
            Some(self.persist(session_id, &plan, &dropped_summary, strategy)?)
        };

        tracing::info!(
            session = session_id,
            %strategy,
            retained = plan.retained.len(),
            dropped = plan.dropped.len(),
            token_estimate = plan.token_estimate,
            "compaction complete"
        );

        Ok(CompactionResult {
            retained_ids: plan.retained.into_iter().map(|b| b.id).collect(),
            dropped_ids: plan.dropped.into_iter().map(|b| b.id).collect(),
            dropped_summary,
            summary_tokens: summary.as_ref().map_or(0, |b| self.cost(b)),
            summary_block_id: summary.map(|b| b.id),
            token_estimate: plan.token_estimate,
            warning: plan.warning,
        })
    }

    /// Compact only once usage, summary included, reaches the threshold
    /// fraction of the budget.
    pub fn compact_if_needed(
        &self,
        session_id: &str,
        budget_tokens: usize,
        options: &CompactOptions,
    ) -> Result<Option<CompactionResult>> {
        let fraction = options
            .threshold_fraction
            .unwrap_or(self.config.threshold_fraction);
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(MemoryError::validation(format!(
                "threshold_fraction must be in (0, 1], got {fraction}"
            )));
        }
        let usage = self.session_usage(session_id)?;
        let threshold = fraction * budget_tokens as f64;
        if (usage as f64) < threshold {
            tracing::debug!(session = session_id, usage, threshold, "compaction not needed");
            return Ok(None);
        }
        self.compact_with(session_id, budget_tokens, options).map(Some)
    }

    /// Compact, then close the session with its full summary: every line
    /// demoted during the session, not only this call's.
    pub fn finalize_session(
        &self,
        session_id: &str,
        budget_tokens: usize,
        options: &CompactOptions,
    ) -> Result<(CompactionResult, SessionRecord)> {
        let result = self.compact_with(session_id, budget_tokens, options)?;
        let summary = match &result.summary_block_id {
            Some(id) => Some(self.store.get_block(id)?.content),
            None => None,
        };
        let session = self.store.end_session(session_id, summary.as_deref())?;
        Ok((result, session))
    }

    fn cost(&self, block: &MemoryBlock) -> usize {
        estimate_tokens(&block.content, self.config.chars_per_token)
    }

    fn summary_line(&self, block: &MemoryBlock) -> String {
        let flat = block.content.split_whitespace().collect::<Vec<_>>().join(" ");
        format!(
            "- [{}] {}",
            block.label,
            truncate_preview(&flat, self.config.excerpt_chars)
        )
    }

    fn plan(&self, blocks: Vec<MemoryBlock>, budget: usize, strategy: CompactionStrategy) -> Plan {
        let (mut pinned, rest): (Vec<_>, Vec<_>) = blocks
            .into_iter()
            .partition(|b| b.block_type == BlockType::Architectural);
        let (mut summaries, mut rest): (Vec<_>, Vec<_>) = rest.into_iter().partition(is_summary);
        pinned.sort_by(by_importance);
        summaries.sort_by(|a, b| by_recency(b, a));

        let pinned_cost: usize = pinned.iter().map(|b| self.cost(b)).sum();
        if pinned_cost > budget {
            return Plan {
                retained: pinned,
                dropped: rest,
                summaries,
                token_estimate: pinned_cost,
                warning: Some(BudgetExceededWarning {
                    required_tokens: pinned_cost,
                    budget_tokens: budget,
                }),
            };
        }

        match strategy {
            CompactionStrategy::Fifo => rest.sort_by(by_recency),
            CompactionStrategy::Lru => rest.sort_by(|a, b| {
                let a_seen = a.last_accessed.unwrap_or(a.created_at);
                let b_seen = b.last_accessed.unwrap_or(b.created_at);
                b_seen.cmp(&a_seen).then_with(|| by_recency(a, b))
            }),
            CompactionStrategy::Importance => rest.sort_by(by_importance),
        }

        let reserved: usize = summaries.iter().map(|b| self.cost(b)).sum();
        let mut used = pinned_cost;
        let mut retained = pinned;
        let mut dropped = Vec::new();
        let mut full = false;
        for block in rest {
            let cost = self.cost(&block);
            if !full && used + reserved + cost <= budget {
                used += cost;
                retained.push(block);
            } else {
                // first miss closes the budget; lower-ranked blocks never jump ahead
                full = true;
                dropped.push(block);
            }
        }

        Plan {
            retained,
            dropped,
            summaries,
            token_estimate: used,
            warning: None,
        }
    }

    /// Write the merged summary, then delete the earlier summaries and the
    /// dropped blocks, all in one transaction.
    fn persist(
        &self,
        session_id: &str,
        plan: &Plan,
        new_lines: &str,
        strategy: CompactionStrategy,
    ) -> Result<MemoryBlock> {
        let dropped_ids: Vec<&str> = plan.dropped.iter().map(|b| b.id.as_str()).collect();
        let previous_ids: Vec<&str> = plan.summaries.iter().map(|b| b.id.as_str()).collect();

        let mut lines: Vec<&str> = plan.summaries.iter().map(|b| b.content.as_str()).collect();
        lines.push(new_lines);
        let content = lines.join("\n");

        let mut demoted: Vec<serde_json::Value> = plan
            .summaries
            .iter()
            .flat_map(|b| summarized_ids(b))
            .collect();
        demoted.extend(dropped_ids.iter().map(|id| serde_json::json!(id)));

        let carried = plan.summaries.iter().chain(&plan.dropped);
        let importance = carried.clone().map(|b| b.importance).fold(0.0, f64::max);
        let all: Vec<MemoryBlock> = carried.cloned().collect();

        let mut new = NewBlock::new(session_id, content)
            .block_type(BlockType::Episodic)
            .label(format!("compaction summary ({} blocks)", demoted.len()))
            .importance(importance);
        new.task_id = shared_task(&all);
        new.metadata = BTreeMap::from([(
            SUMMARY_METADATA_KEY.to_string(),
            serde_json::json!({"strategy": strategy.as_str(), "dropped": demoted}),
        )]);
        let summary_block = store::prepare_block(new)?;
        let boost = self.store.reference_boost();

        self.store.write(|tx| {
            store::insert_block_in_tx(tx, &summary_block, boost)?;
            store::write_audit_log(
                tx,
                "compact",
                &summary_block.id,
                Some(&serde_json::json!({
                    "strategy": strategy.as_str(),
                    "dropped": dropped_ids,
                    "merged": previous_ids,
                })),
            )?;
            let evicted = previous_ids
                .iter()
                .map(|id| (id, "merged into compaction summary"))
                .chain(dropped_ids.iter().map(|id| (id, "compacted")));
            for (id, reason) in evicted {
                match store::delete_block_in_tx(tx, id, boost, Some(reason)) {
                    // deleted concurrently; nothing left to evict
                    Err(MemoryError::NotFound { .. }) => continue,
                    other => other?,
                }
            }
            Ok(())
        })?;

        Ok(summary_block)
    }
}

fn is_summary(block: &MemoryBlock) -> bool {
    block.metadata.contains_key(SUMMARY_METADATA_KEY)
}

/// Ids recorded as dropped in a summary's metadata.
fn summarized_ids(block: &MemoryBlock) -> Vec<serde_json::Value> {
    block
        .metadata
        .get(SUMMARY_METADATA_KEY)
        .and_then(|m| m.get("dropped"))
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default()
}

fn by_importance(a: &MemoryBlock, b: &MemoryBlock) -> Ordering {
    b.importance
        .partial_cmp(&a.importance)
        .unwrap_or(Ordering::Equal)
        .then_with(|| by_recency(a, b))
}

fn by_recency(a: &MemoryBlock, b: &MemoryBlock) -> Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
}

/// The task every dropped block belongs to, if they agree.
fn shared_task(blocks: &[MemoryBlock]) -> Option<String> {
    let first = blocks.first()?.task_id.clone()?;
    blocks
        .iter()
        .all(|b| b.task_id.as_deref() == Some(first.as_str()))
        .then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn setup() -> (Arc<MemoryStore>, Compactor) {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let compactor = Compactor::new(Arc::clone(&store), CompactionConfig::default());
        (store, compactor)
    }

    /// 40 chars = 10 tokens at the default 4 chars/token.
    fn forty(tag: char) -> String {
        std::iter::repeat(tag).take(40).collect()
    }

    fn put(store: &MemoryStore, id: &str, content: String, importance: f64, block_type: BlockType) {
        let mut new = NewBlock::new("s1", content)
            .importance(importance)
            .block_type(block_type)
            .label(id);
        new.id = Some(id.into());
        store.store_block(new).unwrap();
    }

    #[test]
    fn importance_keeps_top_blocks_and_summarizes_the_rest() {
        let (store, compactor) = setup();
        put(&store, "high", forty('a'), 0.9, BlockType::Semantic);
        put(&store, "mid", forty('b'), 0.5, BlockType::Semantic);
        put(&store, "low", forty('c'), 0.1, BlockType::Semantic);

        let result = compactor.compact("s1", 20).unwrap();
        assert_eq!(result.retained_ids, vec!["high", "mid"]);
        assert_eq!(result.dropped_ids, vec!["low"]);
        assert!(result.dropped_summary.starts_with("- [low] ccc"));
        assert_eq!(result.token_estimate, 20);
        assert!(result.warning.is_none());

        assert!(matches!(store.get_block("low"), Err(MemoryError::NotFound { .. })));
        let summary = store.get_block(result.summary_block_id.as_deref().unwrap()).unwrap();
        assert_eq!(summary.block_type, BlockType::Episodic);
        assert_eq!(summary.content, result.dropped_summary);
        assert_eq!(summary.importance, 0.1);
    }

    #[test]
    fn architectural_blocks_are_pinned() {
        let (store, compactor) = setup();
        put(&store, "arch", forty('a'), 0.1, BlockType::Architectural);
        put(&store, "important", forty('b'), 1.0, BlockType::Working);

        let result = compactor.compact("s1", 10).unwrap();
        assert_eq!(result.retained_ids, vec!["arch"]);
        assert_eq!(result.dropped_ids, vec!["important"]);
    }

    #[test]
    fn oversized_architectural_set_returns_warning() {
        let (store, compactor) = setup();
        put(&store, "a1", forty('a'), 0.5, BlockType::Architectural);
        put(&store, "a2", forty('b'), 0.6, BlockType::Architectural);
        put(&store, "w", forty('c'), 0.9, BlockType::Working);

        let result = compactor.compact("s1", 15).unwrap();
        assert_eq!(result.retained_ids, vec!["a2", "a1"]);
        assert_eq!(result.dropped_ids, vec!["w"]);
        assert_eq!(
            result.warning,
            Some(BudgetExceededWarning {
                required_tokens: 20,
                budget_tokens: 15
            })
        );
        assert!(store.get_block("a1").is_ok());
    }

    #[test]
    fn fifo_keeps_newest() {
        let (store, _) = setup();
        let base = Utc::now() - Duration::hours(1);
        for (i, id) in ["old", "newer", "newest"].into_iter().enumerate() {
            let mut new = NewBlock::new("s1", forty('x')).label(id);
            new.id = Some(id.into());
            new.created_at = Some(base + Duration::minutes(i as i64));
            store.store_block(new).unwrap();
        }
        let compactor = Compactor::new(
            Arc::clone(&store),
            CompactionConfig {
                strategy: CompactionStrategy::Fifo,
                ..Default::default()
            },
        );
        let result = compactor.compact("s1", 20).unwrap();
        assert_eq!(result.retained_ids, vec!["newest", "newer"]);
        assert_eq!(result.dropped_ids, vec!["old"]);
    }

    #[test]
    fn lru_prefers_recently_accessed() {
        let (store, compactor) = setup();
        put(&store, "touched", forty('a'), 0.1, BlockType::Semantic);
        put(&store, "fresh", forty('b'), 0.9, BlockType::Semantic);
        store.touch_access(&["touched".to_string()]).unwrap();

        let options = CompactOptions {
            strategy: Some(CompactionStrategy::Lru),
            ..Default::default()
        };
        let result = compactor.compact_with("s1", 10, &options).unwrap();
        assert_eq!(result.retained_ids, vec!["touched"]);
    }

    #[test]
    fn threshold_gates_automatic_compaction() {
        let (store, compactor) = setup();
        put(&store, "a", forty('a'), 0.5, BlockType::Semantic);
        put(&store, "b", forty('b'), 0.5, BlockType::Semantic);

        let defaults = CompactOptions::default();
        // 20 tokens used; 0.8 * 100 = 80
        assert!(compactor.compact_if_needed("s1", 100, &defaults).unwrap().is_none());
        // 0.8 * 22 = 17.6
        let result = compactor.compact_if_needed("s1", 22, &defaults).unwrap().unwrap();
        assert_eq!(result.retained_ids.len(), 2);
        assert!(result.dropped_ids.is_empty());
        assert!(result.summary_block_id.is_none());

        // a per-call threshold overrides the configured one
        let eager = CompactOptions {
            threshold_fraction: Some(0.1),
            ..Default::default()
        };
        assert!(compactor.compact_if_needed("s1", 100, &eager).unwrap().is_some());
        let invalid = CompactOptions {
            threshold_fraction: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(
            compactor.compact_if_needed("s1", 100, &invalid),
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn repeated_compaction_carries_earlier_lines_verbatim() {
        let (store, compactor) = setup();
        put(&store, "high", forty('a'), 0.9, BlockType::Semantic);
        put(&store, "mid", forty('b'), 0.5, BlockType::Semantic);
        put(&store, "low", forty('c'), 0.1, BlockType::Semantic);
        let low_line = format!("- [low] {}", forty('c'));

        let defaults = CompactOptions::default();
        let mut summary_ids = Vec::new();
        for _ in 0..4 {
            if let Some(result) = compactor.compact_if_needed("s1", 20, &defaults).unwrap() {
                summary_ids.push(result.summary_block_id.clone());
            }
        }

        let blocks = store.get_blocks_by_session("s1").unwrap();
        let summaries: Vec<_> = blocks.iter().filter(|b| is_summary(b)).collect();
        assert_eq!(summaries.len(), 1, "one summary per session");
        let summary = summaries[0];
        assert_eq!(summary.content.lines().next(), Some(low_line.as_str()));
        assert_eq!(summary.content.matches("- [low] ").count(), 1);
        assert!(summary.content.contains("- [high] "));
        assert!(summary.content.contains("- [mid] "));
        assert!(!summary.content.contains("compaction summary"));
        assert_eq!(summarized_ids(summary).len(), 3);

        // once the session has settled, further calls write nothing new
        let last = summary_ids.last().cloned().flatten();
        assert_eq!(last.as_deref(), Some(summary.id.as_str()));
        let again = compactor.compact("s1", 20).unwrap();
        assert!(again.dropped_ids.is_empty());
        assert_eq!(again.summary_block_id.as_deref(), Some(summary.id.as_str()));
        assert_eq!(again.summary_tokens, compactor.cost(summary));
    }

    #[test]
    fn summary_cost_is_reserved_from_the_budget() {
        let (store, compactor) = setup();
        put(&store, "old", forty('o'), 0.9, BlockType::Semantic);
        let first = compactor.compact("s1", 0).unwrap();
        assert_eq!(first.dropped_ids, vec!["old"]);
        // "- [old] " + 40 chars = 48 chars = 12 tokens
        assert_eq!(first.summary_tokens, 12);

        put(&store, "new", forty('n'), 0.9, BlockType::Semantic);
        // 12 reserved + 10 for "new" fits 22 exactly
        let kept = compactor.compact("s1", 22).unwrap();
        assert_eq!(kept.retained_ids, vec!["new"]);
        assert!(kept.dropped_ids.is_empty());
        // one token short: "new" is demoted and appended
        let result = compactor.compact("s1", 21).unwrap();
        assert_eq!(result.dropped_ids, vec!["new"]);
        let summary = store.get_block(result.summary_block_id.as_deref().unwrap()).unwrap();
        assert_eq!(
            summary.content,
            format!("- [old] {}\n- [new] {}", forty('o'), forty('n'))
        );
    }

    #[test]
    fn finalize_writes_session_summary() {
        let (store, compactor) = setup();
        put(&store, "keep", forty('a'), 0.9, BlockType::Semantic);
        put(&store, "drop", forty('b'), 0.2, BlockType::Semantic);

        let (result, session) = compactor
            .finalize_session("s1", 10, &CompactOptions::default())
            .unwrap();
        assert_eq!(result.dropped_ids, vec!["drop"]);
        assert!(session.ended_at.is_some());
        assert_eq!(session.summary.as_deref(), Some(result.dropped_summary.as_str()));
    }

    #[test]
    fn unknown_session_is_not_found() {
        let (_, compactor) = setup();
        assert!(matches!(
            compactor.compact("ghost", 100),
            Err(MemoryError::NotFound { .. })
        ));
    }

    #[test]
    fn summary_lines_flatten_and_truncate() {
        let (_, compactor) = setup();
        let mut block = NewBlock::new("s", "line one\n\nline   two");
        block.label = Some("notes".into());
        let block = store::prepare_block(block).unwrap();
        assert_eq!(compactor.summary_line(&block), "- [notes] line one line two");
    }
}

//! # Protocol Flow
//!
//! The human-oriented task / evidence-pack / proposal triple the brain emits
//! per event, persisted as `(kind, payload_json)` rows in `protocol_flow`.

use crate::memory::{FactHit, VectorHit};
use crate::state::Action;
use crate::util::{clamp01, clip, now_iso};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub created_at: String,
    pub source_event_id: i64,
    pub title: String,
    pub objective: String,
    pub priority: String,
    pub constraints: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub kind: String,
    pub content: String,
    pub confidence: f64,
    pub source: String,
    pub ref_event_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePack {
    pub pack_id: String,
    pub created_at: String,
    pub source_task_id: String,
    pub items: Vec<EvidenceItem>,
    pub retrieval: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: String,
    pub created_at: String,
    pub source_task_id: String,
    pub action: String,
    pub rationale: String,
    pub risk_level: String,
    pub rollback_plan: String,
    pub requires_approval: bool,
    pub status: String,
}

pub fn make_task(event_id: i64, content: &str, source: &str, priority: &str) -> Task {
    let trimmed = content.trim();
    let title = trimmed
        .lines()
        .next()
        .map(|line| clip(line, 72).to_string())
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| format!("event-{event_id}"));
    let priority = match priority {
        "low" | "mid" | "high" => priority,
        _ => "mid",
    };
    Task {
        task_id: format!("task-{event_id}"),
        created_at: now_iso(),
        source_event_id: event_id,
        title,
        objective: clip(trimmed, 400).to_string(),
        priority: priority.to_string(),
        constraints: vec![
            "keep_state_consistent".to_string(),
            "prefer_reversible_changes".to_string(),
            "emit_actionable_output".to_string(),
        ],
        tags: vec![
            if source.is_empty() { "unknown".to_string() } else { source.to_string() },
            "runtime".to_string(),
        ],
    }
}

/// Top-6 facts, top-6 vectors, and the clipped raw observation.
pub fn make_evidence_pack(
    source_task_id: &str,
    facts: &[FactHit],
    vectors: &[VectorHit],
    observation: &str,
    event_id: i64,
) -> EvidencePack {
    let mut items = Vec::new();
    for (i, fact) in facts.iter().take(6).enumerate() {
        items.push(EvidenceItem {
            evidence_id: format!("{}-fact-{}", source_task_id, i + 1),
            kind: "fact".to_string(),
            content: clip(&fact.claim_text, 400).to_string(),
            confidence: clamp01(fact.confidence),
            source: fact.source.clone(),
            ref_event_id: if fact.last_seen_event_id > 0 {
                Some(fact.last_seen_event_id)
            } else {
                None
            },
        });
    }
    for (i, vector) in vectors.iter().take(6).enumerate() {
        items.push(EvidenceItem {
            evidence_id: format!("{}-mem-{}", source_task_id, i + 1),
            kind: "memory".to_string(),
            content: clip(&vector.content, 400).to_string(),
            confidence: clamp01(vector.score),
            source: vector.source.clone(),
            ref_event_id: if vector.event_id > 0 { Some(vector.event_id) } else { None },
        });
    }
    if !observation.is_empty() {
        items.push(EvidenceItem {
            evidence_id: format!("{source_task_id}-obs-1"),
            kind: "observation".to_string(),
            content: clip(observation, 400).to_string(),
            confidence: 0.5,
            source: "event".to_string(),
            ref_event_id: Some(event_id),
        });
    }
    EvidencePack {
        pack_id: format!("pack-{source_task_id}"),
        created_at: now_iso(),
        source_task_id: source_task_id.to_string(),
        items,
        retrieval: serde_json::json!({
            "fact_hits": facts.len(),
            "memory_hits": vectors.len(),
        }),
    }
}

pub fn make_proposal(
    source_task_id: &str,
    action: Action,
    rationale: &str,
    risk_level: &str,
    requires_approval: bool,
    rollback_plan: &str,
) -> Proposal {
    let risk_level = match risk_level {
        "low" | "mid" | "high" => risk_level,
        _ => "mid",
    };
    Proposal {
        proposal_id: format!("proposal-{source_task_id}"),
        created_at: now_iso(),
        source_task_id: source_task_id.to_string(),
        action: action.as_str().to_string(),
        rationale: clip(rationale, 600).to_string(),
        risk_level: risk_level.to_string(),
        rollback_plan: clip(rollback_plan, 400).to_string(),
        requires_approval,
        status: "draft".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(text: &str, event_id: i64) -> FactHit {
        FactHit {
            id: 1,
            claim_text: text.to_string(),
            confidence: 0.6,
            source: "manual".to_string(),
            support_count: 1,
            conflict_count: 0,
            last_seen_event_id: event_id,
            trust_score: 0.8,
            score: 0.5,
        }
    }

    fn vector(text: &str, event_id: i64) -> VectorHit {
        VectorHit {
            id: 1,
            event_id,
            source: "manual".to_string(),
            content: text.to_string(),
            tier: "short".to_string(),
            score: 0.4,
        }
    }

    #[test]
    fn test_task_title_from_first_line() {
        let task = make_task(9, "第一行标题\n第二行内容", "manual", "high");
        assert_eq!(task.task_id, "task-9");
        assert_eq!(task.title, "第一行标题");
        assert_eq!(task.priority, "high");
        assert!(task.tags.contains(&"manual".to_string()));
    }

    #[test]
    fn test_task_invalid_priority_defaults_mid() {
        let task = make_task(1, "内容", "manual", "urgent");
        assert_eq!(task.priority, "mid");
    }

    #[test]
    fn test_evidence_pack_caps_six_each() {
        let facts: Vec<FactHit> = (0..10).map(|i| fact(&format!("fact {i}"), i)).collect();
        let vectors: Vec<VectorHit> = (0..10).map(|i| vector(&format!("vec {i}"), i)).collect();
        let pack = make_evidence_pack("task-1", &facts, &vectors, "observed text", 1);
        let fact_items = pack.items.iter().filter(|i| i.kind == "fact").count();
        let memory_items = pack.items.iter().filter(|i| i.kind == "memory").count();
        let observations = pack.items.iter().filter(|i| i.kind == "observation").count();
        assert_eq!(fact_items, 6);
        assert_eq!(memory_items, 6);
        assert_eq!(observations, 1);
        assert_eq!(pack.retrieval.get("fact_hits").unwrap(), 10);
    }

    #[test]
    fn test_evidence_pack_zero_event_id_is_none() {
        let facts = vec![fact("f", 0)];
        let pack = make_evidence_pack("task-1", &facts, &[], "", 1);
        assert_eq!(pack.items[0].ref_event_id, None);
        assert!(pack.items.iter().all(|i| i.kind != "observation"));
    }

    #[test]
    fn test_proposal_normalizes_risk() {
        let proposal = make_proposal("task-1", Action::EscalateDeep, "rationale", "??", true, "rb");
        assert_eq!(proposal.risk_level, "mid");
        assert_eq!(proposal.action, "escalate_deep");
        assert_eq!(proposal.status, "draft");
        assert!(proposal.requires_approval);
    }
}

//! # Diagnosis Contract
//!
//! The brain cycle consumes a pure function `diagnose(text, state10d)` whose
//! heuristics live outside the core. This module defines the 10-D state view,
//! the projection from runtime scalars onto it, and a compact deterministic
//! implementation of the contract so the pipeline is executable end to end.

use crate::state::RuntimeState;
use crate::util::clamp01;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keywords that trigger the halt check regardless of state.
const HALT_KEYWORDS: &[&str] = &["终极", "绝对真理", "自指", "无限递归", "cannot act"];

/// Keywords that mark threshold proximity in the change dimension.
const THRESHOLD_KEYWORDS: &[&str] = &["阈值", "临界", "崩", "耗尽", "deadline"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Root,
    Symptom,
    Transform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Ascending,
    Peak,
    Descending,
    Trough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Wood,
    Fire,
    Earth,
    Metal,
    Water,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Wood => "wood",
            Channel::Fire => "fire",
            Channel::Earth => "earth",
            Channel::Metal => "metal",
            Channel::Water => "water",
        }
    }
}

/// Projection of the runtime scalars into the evaluator's state space.
#[derive(Debug, Clone, Serialize)]
pub struct State10D {
    pub quantity: f64,
    pub change: ChangeType,
    pub approaching_threshold: bool,
    pub recovery_rate: f64,
    pub long_term_cost: f64,
    pub cycle_phase: CyclePhase,
    pub depletion_risk: f64,
    pub kappa: BTreeMap<Channel, f64>,
    pub role_id: String,
    pub exit_cost: f64,
    pub halt_conditions: Vec<String>,
}

/// Map runtime scalars onto the 10-D view: stress drives the change type,
/// continuity the cycle phase, and per-channel kappas get scalar biases.
pub fn project_state(state: &RuntimeState) -> State10D {
    let change = if state.stress >= 0.7 {
        ChangeType::Transform
    } else if state.uncertainty >= 0.6 {
        ChangeType::Root
    } else {
        ChangeType::Symptom
    };

    let cycle_phase = if state.continuity >= 0.75 {
        CyclePhase::Ascending
    } else if state.continuity >= 0.55 {
        CyclePhase::Peak
    } else if state.continuity >= 0.35 {
        CyclePhase::Descending
    } else {
        CyclePhase::Trough
    };

    let mut kappa = BTreeMap::new();
    kappa.insert(Channel::Wood, 1.0);
    kappa.insert(Channel::Fire, 1.0 + 0.2 * state.stress);
    kappa.insert(Channel::Earth, 1.0);
    kappa.insert(Channel::Metal, 1.0 + 0.2 * state.uncertainty);
    kappa.insert(Channel::Water, 1.0 - 0.2 * state.continuity);

    State10D {
        quantity: (state.energy * 2.0).max(0.0),
        change,
        approaching_threshold: state.stress >= 0.75,
        recovery_rate: clamp01(state.integrity),
        long_term_cost: (1.0 + state.stress * 2.0).max(0.0),
        cycle_phase,
        depletion_risk: clamp01(state.stress),
        kappa,
        role_id: state.role_id.clone(),
        exit_cost: clamp01(1.0 - state.continuity),
        halt_conditions: if state.uncertainty >= 0.95 {
            vec!["no_new_actionability".to_string()]
        } else {
            Vec::new()
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HaltCheck {
    pub triggered: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub diagnosis: String,
    pub actionable_advice: Vec<String>,
    pub invalidation_conditions: Vec<String>,
    pub halt_check: HaltCheck,
    pub dimensions: serde_json::Value,
}

impl Diagnosis {
    pub fn halted(&self) -> bool {
        self.halt_check.triggered
    }

    pub fn first_advice(&self) -> Option<&str> {
        self.actionable_advice.first().map(|s| s.as_str())
    }
}

fn halt_check(text: &str, actionable: &[String]) -> HaltCheck {
    let content = text.to_lowercase();
    for keyword in HALT_KEYWORDS {
        if content.contains(&keyword.to_lowercase()) {
            return HaltCheck {
                triggered: true,
                reason: Some(format!("keyword:{keyword}")),
            };
        }
    }
    if actionable.is_empty() {
        return HaltCheck {
            triggered: true,
            reason: Some("no_new_actionability".to_string()),
        };
    }
    HaltCheck {
        triggered: false,
        reason: None,
    }
}

/// Pure diagnosis over the event text and the projected state. Deterministic;
/// no storage access.
pub fn diagnose(text: &str, state: &State10D) -> Diagnosis {
    let mut advice: Vec<String> = Vec::new();
    let mut invalidations: Vec<String> = Vec::new();
    let mut summaries: Vec<String> = Vec::new();

    // Change dimension: threshold proximity from state or text markers.
    let near_threshold =
        state.approaching_threshold || THRESHOLD_KEYWORDS.iter().any(|k| text.contains(k));
    summaries.push(format!(
        "change={:?} threshold={}",
        state.change,
        if near_threshold { "high" } else { "normal" }
    ));
    advice.push("set threshold alerts on the fastest-moving variables".to_string());
    invalidations.push("invalid if key variables are replaced or observation lags a cycle".to_string());

    // Sustainability dimension.
    summaries.push(format!(
        "recovery={:.2} depletion={:.2}",
        state.recovery_rate, state.depletion_risk
    ));
    if state.depletion_risk >= 0.7 {
        advice.push("split high-drain work into short batches to cut depletion risk".to_string());
    }
    if state.recovery_rate < 0.3 {
        advice.push("widen the recovery window before taking on new load".to_string());
    }
    invalidations.push("recompute sustainability if external resources or constraints shift".to_string());

    // Channel-cost dimension: always yields at least one actionable path.
    let mut ordered: Vec<(&Channel, &f64)> = state.kappa.iter().collect();
    ordered.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));
    let low: Vec<&str> = ordered.iter().take(2).map(|(c, _)| c.as_str()).collect();
    let high: Vec<&str> = ordered.iter().rev().take(2).map(|(c, _)| c.as_str()).collect();
    summaries.push(format!("low_cost={} high_cost={}", low.join(","), high.join(",")));
    if !low.is_empty() {
        advice.push(format!("prefer low-dissipation channels: {}", low.join(", ")));
    }
    if !high.is_empty() {
        advice.push(format!("rate-limit high-dissipation channels: {}", high.join(", ")));
    }

    // Role dimension.
    if state.role_id.trim().is_empty() {
        advice.push("define a role id before weighing irreversible commitments".to_string());
        summaries.push("role=undefined".to_string());
    } else {
        summaries.push(format!("role={} exit_cost={:.2}", state.role_id, state.exit_cost));
    }
    invalidations.push("role-boundary advice expires on responsibility reshuffle".to_string());

    let dimensions = serde_json::json!({
        "change": {
            "change_type": state.change,
            "threshold_proximity": if near_threshold { "high" } else { "normal" },
        },
        "sustainability": {
            "recovery_rate": state.recovery_rate,
            "long_term_cost": state.long_term_cost,
            "cycle_phase": state.cycle_phase,
            "depletion_risk": state.depletion_risk,
        },
        "channels": {
            "low_cost_paths": low,
            "high_cost_paths": high,
        },
        "role": {
            "current_role": state.role_id,
            "exit_cost": state.exit_cost,
        },
    });

    let halt = halt_check(text, &advice);
    Diagnosis {
        diagnosis: summaries.join(" "),
        actionable_advice: advice,
        invalidation_conditions: invalidations,
        halt_check: halt,
        dimensions,
    }
}

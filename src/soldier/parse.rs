//! Inference output parsing
//!
//! Model backends return either structured JSON or free-form text. JSON is
//! preferred; the text path keyword-scans for an action and estimates a
//! rough confidence from hedging phrases.

use serde_json::Value;

use crate::models::{RiskLevel, TradeAction};

/// Decision fields extracted from raw engine output
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDecision {
    pub action: TradeAction,
    pub confidence: f64,
    pub reasoning: String,
    pub signal_strength: f64,
    pub risk_level: RiskLevel,
}

impl Default for ParsedDecision {
    fn default() -> Self {
        Self {
            action: TradeAction::Hold,
            confidence: 0.5,
            reasoning: String::new(),
            signal_strength: 0.5,
            risk_level: RiskLevel::Medium,
        }
    }
}

/// Parse raw inference output, JSON first, keyword scan second
pub fn parse_inference_output(raw: &str) -> ParsedDecision {
    if let Some(parsed) = parse_json(raw) {
        return parsed;
    }
    parse_text(raw)
}

fn parse_json(raw: &str) -> Option<ParsedDecision> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    let obj = value.as_object()?;

    // Some backends nest the payload under "decision".
    let obj = match obj.get("decision").and_then(Value::as_object) {
        Some(nested) => nested,
        None => obj,
    };

    let action = obj
        .get("action")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())?;
    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    let signal_strength = obj
        .get("signal_strength")
        .and_then(Value::as_f64)
        .unwrap_or(confidence)
        .clamp(0.0, 1.0);
    let risk_level = obj
        .get("risk_level")
        .and_then(Value::as_str)
        .and_then(|s| match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        })
        .unwrap_or(RiskLevel::Medium);
    let reasoning = obj
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(ParsedDecision {
        action,
        confidence,
        reasoning,
        signal_strength,
        risk_level,
    })
}

fn parse_text(raw: &str) -> ParsedDecision {
    let lower = raw.to_lowercase();

    // Longest keyword first so "strong_buy" is not read as "buy".
    let action = if lower.contains("strong_buy") || lower.contains("strong buy") {
        TradeAction::StrongBuy
    } else if lower.contains("buy") {
        TradeAction::Buy
    } else if lower.contains("sell") {
        TradeAction::Sell
    } else if lower.contains("reduce") {
        TradeAction::Reduce
    } else {
        TradeAction::Hold
    };

    let confidence = if lower.contains("high confidence") || lower.contains("very confident") {
        0.8
    } else if lower.contains("uncertain") || lower.contains("unclear") {
        0.3
    } else {
        0.5
    };

    let risk_level = if lower.contains("high risk") {
        RiskLevel::High
    } else if lower.contains("low risk") {
        RiskLevel::Low
    } else {
        RiskLevel::Medium
    };

    ParsedDecision {
        action,
        confidence,
        reasoning: raw.trim().chars().take(280).collect(),
        signal_strength: confidence,
        risk_level,
    }
}

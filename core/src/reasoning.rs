use crate::model::FileType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Metric,
    Instruction,
    Insight,
    Narrative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessFunction {
    Finance,
    Ops,
    Marketing,
    Legal,
    Tech,
    Hr,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    Forecast,
    Current,
    Historical,
    Timeless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    ExecutiveSummary,
    TacticalDetail,
    RawData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginAuthority {
    PrimarySource,
    SecondarySource,
}

pub const EXTRACTION_CONFIDENCE: f64 = 0.90;

/// Structured per-chunk metadata, computed deterministically from the
/// cleaned text and the source type. Stable across re-ingest of identical
/// content, so it can travel with the semantic hash as lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningBlock {
    pub signal_type: SignalType,
    pub business_function: BusinessFunction,
    pub time_horizon: TimeHorizon,
    pub granularity: Granularity,
    pub origin_authority: OriginAuthority,
    pub potentially_regulated: bool,
    pub extraction_confidence: f64,
    pub data_lineage_id: String,
    pub extraction_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_text_hash: Option<String>,
}

impl ReasoningBlock {
    pub fn build(
        cleaned_text: &str,
        source_type: FileType,
        semantic_hash: &str,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        let lower = cleaned_text.to_lowercase();
        Self {
            signal_type: classify_signal(cleaned_text, &lower),
            business_function: classify_function(&lower),
            time_horizon: classify_horizon(&lower),
            granularity: classify_granularity(cleaned_text),
            origin_authority: if source_type.is_primary_source() {
                OriginAuthority::PrimarySource
            } else {
                OriginAuthority::SecondarySource
            },
            potentially_regulated: REGULATION_MARKERS.iter().any(|m| lower.contains(m)),
            extraction_confidence: EXTRACTION_CONFIDENCE,
            data_lineage_id: semantic_hash.to_string(),
            extraction_timestamp: ingested_at,
            content_type: None,
            original_text_hash: None,
        }
    }

    /// Mark this chunk as derived from chart/table-like source material.
    pub fn mark_visual(&mut self, original_text_hash: &str) {
        self.content_type = Some("visual".to_string());
        self.original_text_hash = Some(original_text_hash.to_string());
    }
}

const REGULATION_MARKERS: [&str; 4] = ["gdpr", "hipaa", "sox", "regulation"];

const INSTRUCTION_MARKERS: [&str; 7] = [
    "must", "should", "shall", "step ", "procedure", "policy", "required",
];

const INSIGHT_MARKERS: [&str; 8] = [
    "trend", "indicates", "suggests", "driver", "growth", "decline", "insight", "outperform",
];

const FINANCE_MARKERS: [&str; 8] = [
    "revenue", "budget", "profit", "margin", "invoice", "cash flow", "earnings", "cost",
];
const OPS_MARKERS: [&str; 6] = [
    "logistics", "supply chain", "inventory", "operations", "workflow", "production",
];
const MARKETING_MARKERS: [&str; 7] = [
    "marketing", "campaign", "brand", "audience", "engagement", "seo", "customer",
];
const LEGAL_MARKERS: [&str; 6] = [
    "contract", "compliance", "liability", "legal", "litigation", "regulatory",
];
const TECH_MARKERS: [&str; 7] = [
    "software", "api", "infrastructure", "deployment", "database", "cloud", "platform",
];
const HR_MARKERS: [&str; 6] = [
    "employee", "hiring", "onboarding", "payroll", "talent", "recruit",
];

const FORECAST_MARKERS: [&str; 6] = [
    "forecast", "will ", "expected", "projected", "next year", "upcoming",
];
const HISTORICAL_MARKERS: [&str; 6] = [
    "last year", "previous", "grew", "declined", "historical", "year over year",
];
const CURRENT_MARKERS: [&str; 4] = ["currently", "today", "this quarter", "now "];

fn classify_signal(text: &str, lower: &str) -> SignalType {
    let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    let ratio = if text.is_empty() {
        0.0
    } else {
        digits as f64 / text.chars().count() as f64
    };
    if ratio > 0.15 || lower.contains('%') || lower.contains("kpi") {
        SignalType::Metric
    } else if INSTRUCTION_MARKERS.iter().any(|m| lower.contains(m)) {
        SignalType::Instruction
    } else if INSIGHT_MARKERS.iter().any(|m| lower.contains(m)) {
        SignalType::Insight
    } else {
        SignalType::Narrative
    }
}

fn classify_function(lower: &str) -> BusinessFunction {
    let tables: [(&[&str], BusinessFunction); 6] = [
        (&FINANCE_MARKERS, BusinessFunction::Finance),
        (&OPS_MARKERS, BusinessFunction::Ops),
        (&MARKETING_MARKERS, BusinessFunction::Marketing),
        (&LEGAL_MARKERS, BusinessFunction::Legal),
        (&TECH_MARKERS, BusinessFunction::Tech),
        (&HR_MARKERS, BusinessFunction::Hr),
    ];
    for (markers, function) in tables {
        if markers.iter().any(|m| lower.contains(m)) {
            return function;
        }
    }
    BusinessFunction::General
}

fn classify_horizon(lower: &str) -> TimeHorizon {
    if FORECAST_MARKERS.iter().any(|m| lower.contains(m)) {
        TimeHorizon::Forecast
    } else if HISTORICAL_MARKERS.iter().any(|m| lower.contains(m)) {
        TimeHorizon::Historical
    } else if CURRENT_MARKERS.iter().any(|m| lower.contains(m)) {
        TimeHorizon::Current
    } else {
        TimeHorizon::Timeless
    }
}

fn classify_granularity(text: &str) -> Granularity {
    let len = text.chars().count();
    if len < 300 {
        Granularity::ExecutiveSummary
    } else if len < 1200 {
        Granularity::TacticalDetail
    } else {
        Granularity::RawData
    }
}

//! Ranks calibration masters against the session they will calibrate.

use serde::Serialize;

use crate::session::{ImageRecord, Session, keys, normalize_token};

pub const GAIN_MATCH_BONUS: f64 = 200.0;
pub const GAIN_DIFF_PENALTY: f64 = 10.0;
pub const TEMPERATURE_WEIGHT: f64 = 1000.0;
pub const TIME_WEIGHT: f64 = 100.0;
pub const TIME_DECAY_DAYS: f64 = 7.0;
/// Masters taken this long after the session are penalised further.
pub const FUTURE_GRACE_DAYS: f64 = 2.0;
pub const FUTURE_PENALTY: f64 = 50.0;
pub const CAMERA_MISMATCH_PENALTY: f64 = 5000.0;
pub const FILTER_MISMATCH_PENALTY: f64 = 2000.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub candidate: ImageRecord,
    pub score: f64,
    pub reasons: Vec<String>,
}

impl ScoredCandidate {
    pub fn reason(&self) -> String {
        self.reasons.join(", ")
    }
}

/// Scores every candidate of one image type against `reference`. Candidates
/// whose pixel dimensions differ are dropped; the rest come back sorted by
/// descending score. `candidates` is left untouched.
pub fn score_candidates(reference: &Session, candidates: &[ImageRecord]) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .iter()
        .filter(|candidate| dimensions_compatible(reference, candidate))
        .map(|candidate| score_one(reference, candidate))
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

fn dimensions(value: impl Fn(&str) -> Option<f64>) -> Option<(u64, u64)> {
    Some((value(keys::NAXIS1)? as u64, value(keys::NAXIS2)? as u64))
}

fn session_number(session: &Session, key: &str) -> Option<f64> {
    session.meta(key).and_then(|s| s.parse::<f64>().ok())
}

fn dimensions_compatible(reference: &Session, candidate: &ImageRecord) -> bool {
    match (
        dimensions(|key| session_number(reference, key)),
        dimensions(|key| candidate.number(key)),
    ) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => true,
    }
}

fn score_one(reference: &Session, candidate: &ImageRecord) -> ScoredCandidate {
    let mut score = 0.0;
    let mut reasons = Vec::new();

    if let (Some(expected), Some(actual)) = (
        session_number(reference, keys::GAIN),
        candidate.number(keys::GAIN),
    ) {
        let diff = (expected - actual).abs();
        if diff < f64::EPSILON {
            score += GAIN_MATCH_BONUS;
            reasons.push(format!("gain match (+{GAIN_MATCH_BONUS:.0})"));
        } else {
            let penalty = GAIN_DIFF_PENALTY * diff;
            score -= penalty;
            reasons.push(format!("gain differs by {diff} (-{penalty:.0})"));
        }
    }

    if let (Some(expected), Some(actual)) = (
        session_number(reference, keys::CCD_TEMP),
        candidate.number(keys::CCD_TEMP),
    ) {
        let diff = (expected - actual).abs();
        let bonus = TEMPERATURE_WEIGHT * (-diff).exp();
        score += bonus;
        reasons.push(format!("temp Δ{diff:.1}°C (+{bonus:.0})"));
    }

    if let Some(taken) = candidate.timestamp() {
        let offset_days = (taken - reference.start).num_seconds() as f64 / 86_400.0;
        let bonus = TIME_WEIGHT * (-offset_days.abs() / TIME_DECAY_DAYS).exp();
        score += bonus;
        reasons.push(format!("{:.1} days apart (+{bonus:.0})", offset_days.abs()));
        if offset_days > FUTURE_GRACE_DAYS {
            score -= FUTURE_PENALTY;
            reasons.push(format!("taken after session (-{FUTURE_PENALTY:.0})"));
        }
    }

    if let (Some(expected), Some(actual)) = (
        reference.instrument(),
        candidate.meta(keys::INSTRUME).map(normalize_token),
    ) && expected != actual
    {
        score -= CAMERA_MISMATCH_PENALTY;
        reasons.push(format!("camera mismatch (-{CAMERA_MISMATCH_PENALTY:.0})"));
    }

    if candidate.imagetyp().as_deref() == Some("flat") {
        let expected = reference.meta(keys::FILTER).map(normalize_token);
        let actual = candidate.meta(keys::FILTER).map(normalize_token);
        if expected != actual {
            score -= FILTER_MISMATCH_PENALTY;
            reasons.push(format!("filter mismatch (-{FILTER_MISMATCH_PENALTY:.0})"));
        }
    }

    ScoredCandidate {
        candidate: candidate.clone(),
        score,
        reasons,
    }
}

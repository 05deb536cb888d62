// SPDX-License-Identifier: MIT

//! Deterministic per-field confidence
//!
//! The score only ever moves down as negative signals are added, so an extra
//! corroborating signal can never lower a field relative to identical input.

/// Everything the workflow learned about one field
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FieldSignals {
    /// The extraction call returned a non-null value
    pub has_value: bool,
    /// The reasoning engine reported more than one plausible reading
    pub ambiguous: bool,
    /// Violated cross-field rules naming this field
    pub violations: u32,
    /// Field-level errors recorded for this field
    pub field_errors: usize,
    pub required: bool,
}

const BASE_VALUE: f64 = 0.95;
const BASE_NULL: f64 = 0.85;
const AMBIGUITY_PENALTY: f64 = 0.35;
const VIOLATION_FACTOR: f64 = 0.6;
const FIELD_ERROR_FACTOR: f64 = 0.5;

pub fn score(signals: &FieldSignals) -> f64 {
    if signals.required && !signals.has_value {
        return 0.0;
    }

    let mut score = if signals.has_value { BASE_VALUE } else { BASE_NULL };
    if signals.ambiguous {
        score -= AMBIGUITY_PENALTY;
    }
    score *= VIOLATION_FACTOR.powi(signals.violations.min(16) as i32);
    score *= FIELD_ERROR_FACTOR.powi(signals.field_errors.min(16) as i32);

    (score.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

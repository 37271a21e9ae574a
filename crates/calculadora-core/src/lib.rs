//! Arithmetic engine and history model shared by the calculator service and its stores.
//!
//! The crate exposes:
//! - [`compute`] and [`evaluate`] for the four binary operations.
//! - [`HistoryRecorder`], the seam between the service and a history backend.
//! - [`InMemoryHistory`], the process-local recorder.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub const DIVISION_BY_ZERO_MESSAGE: &str = "Erro: nenhum número pode ser dividido por zero";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CalcError {
    #[error("Erro: nenhum número pode ser dividido por zero")]
    DivisionByZero,
    #[error("Erro: operação inválida: {0}")]
    InvalidOperator(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum Operator {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Subtract,
    #[serde(rename = "*")]
    Multiply,
    #[serde(rename = "/")]
    Divide,
}

impl Operator {
    pub const ALL: [Self; 4] = [Self::Add, Self::Subtract, Self::Multiply, Self::Divide];

    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "+" => Some(Self::Add),
            "-" => Some(Self::Subtract),
            "*" => Some(Self::Multiply),
            "/" => Some(Self::Divide),
            _ => None,
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Operator {
    type Err = CalcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| CalcError::InvalidOperator(value.to_string()))
    }
}

/// Request body accepted by every compute route.
///
/// `operacao` is informational on the fixed-verb routes and only drives the
/// computation on the generic route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationRequest {
    pub operando1: f64,
    pub operando2: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operacao: Option<String>,
}

impl OperationRequest {
    #[must_use]
    pub fn new(operando1: f64, operando2: f64, operator: Operator) -> Self {
        Self { operando1, operando2, operacao: Some(operator.symbol().to_string()) }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OperationResult {
    pub resultado: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub operando1: f64,
    pub operando2: f64,
    pub operacao: String,
    pub resultado: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A computation that succeeded and is about to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryEntry {
    pub operando1: f64,
    pub operando2: f64,
    pub operator: Operator,
    pub resultado: f64,
    pub recorded_at: OffsetDateTime,
}

impl NewHistoryEntry {
    #[must_use]
    pub fn from_computation(
        operando1: f64,
        operando2: f64,
        operator: Operator,
        result: OperationResult,
    ) -> Self {
        Self { operando1, operando2, operator, resultado: result.resultado, recorded_at: now_utc() }
    }

    /// Converts into the stored shape, without an identifier.
    ///
    /// # Errors
    /// Returns an error when the timestamp cannot be formatted.
    pub fn to_entry(&self, id: Option<i64>) -> anyhow::Result<HistoryEntry> {
        Ok(HistoryEntry {
            id,
            operando1: self.operando1,
            operando2: self.operando2,
            operacao: self.operator.symbol().to_string(),
            resultado: self.resultado,
            timestamp: Some(format_rfc3339(self.recorded_at)?),
        })
    }
}

/// Applies `operator` to the two operands with IEEE-754 double semantics.
///
/// # Errors
/// Returns [`CalcError::DivisionByZero`] when dividing by `0.0` or `-0.0`.
pub fn compute(operando1: f64, operando2: f64, operator: Operator) -> Result<f64, CalcError> {
    match operator {
        Operator::Add => Ok(operando1 + operando2),
        Operator::Subtract => Ok(operando1 - operando2),
        Operator::Multiply => Ok(operando1 * operando2),
        Operator::Divide => {
            if operando2 == 0.0 {
                return Err(CalcError::DivisionByZero);
            }
            Ok(operando1 / operando2)
        }
    }
}

/// Evaluates a request using the operator named in its `operacao` field.
///
/// # Errors
/// Returns [`CalcError::InvalidOperator`] when `operacao` is missing or unknown,
/// and [`CalcError::DivisionByZero`] from [`compute`].
pub fn evaluate(request: &OperationRequest) -> Result<(Operator, OperationResult), CalcError> {
    let symbol = request.operacao.as_deref().unwrap_or_default();
    let operator = symbol.parse::<Operator>()?;
    let resultado = compute(request.operando1, request.operando2, operator)?;
    Ok((operator, OperationResult { resultado }))
}

/// Backend that keeps the record of successful computations.
pub trait HistoryRecorder: Send + Sync {
    /// Stores one computation and returns it as it will be listed.
    ///
    /// # Errors
    /// Returns an error when the backend rejects the write.
    fn record(&self, entry: &NewHistoryEntry) -> anyhow::Result<HistoryEntry>;

    /// Lists every recorded computation in the backend's ordering.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn list(&self) -> anyhow::Result<Vec<HistoryEntry>>;
}

/// Process-local history kept in insertion order; lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl InMemoryHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns an error when the history lock was poisoned by a panicking writer.
    pub fn len(&self) -> anyhow::Result<usize> {
        let entries = self.entries.lock().map_err(|_| anyhow!("history lock poisoned"))?;
        Ok(entries.len())
    }

    /// # Errors
    /// Returns an error when the history lock was poisoned by a panicking writer.
    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl HistoryRecorder for InMemoryHistory {
    fn record(&self, entry: &NewHistoryEntry) -> anyhow::Result<HistoryEntry> {
        let stored = entry.to_entry(None)?;
        let mut entries = self.entries.lock().map_err(|_| anyhow!("history lock poisoned"))?;
        entries.push(stored.clone());
        Ok(stored)
    }

    fn list(&self) -> anyhow::Result<Vec<HistoryEntry>> {
        let entries = self.entries.lock().map_err(|_| anyhow!("history lock poisoned"))?;
        Ok(entries.clone())
    }
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// Subseconds are always written with nine digits so stored values sort
/// chronologically as plain text.
///
/// # Errors
/// Returns an error when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> anyhow::Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .context("failed to format RFC3339 timestamp")
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;

    fn parse_rfc3339_utc(value: &str) -> anyhow::Result<OffsetDateTime> {
        let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
            .context("invalid RFC3339 timestamp")?;
        if parsed.offset() != UtcOffset::UTC {
            anyhow::bail!("timestamp must use UTC offset Z");
        }
        Ok(parsed)
    }

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_entry(operator: Operator, resultado: f64) -> NewHistoryEntry {
        NewHistoryEntry::from_computation(6.0, 3.0, operator, OperationResult { resultado })
    }

    #[test]
    fn operator_symbols_parse_back() {
        for operator in Operator::ALL {
            assert_eq!(Operator::parse(operator.symbol()), Some(operator));
            assert_eq!(operator.to_string(), operator.symbol());
        }
        assert_eq!(Operator::parse(" * "), Some(Operator::Multiply));
        assert_eq!(Operator::parse("%"), None);
        assert_eq!(Operator::parse(""), None);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = match "^".parse::<Operator>() {
            Ok(operator) => panic!("expected rejection, got {operator:?}"),
            Err(err) => err,
        };
        assert_eq!(err, CalcError::InvalidOperator("^".to_string()));
        assert!(err.to_string().contains("operação inválida"));
    }

    #[test]
    fn divide_by_zero_fails_for_both_signed_zeros() {
        assert_eq!(compute(9.0, 0.0, Operator::Divide), Err(CalcError::DivisionByZero));
        assert_eq!(compute(9.0, -0.0, Operator::Divide), Err(CalcError::DivisionByZero));
        assert_eq!(CalcError::DivisionByZero.to_string(), DIVISION_BY_ZERO_MESSAGE);
    }

    #[test]
    fn known_values() {
        assert_eq!(must_ok(compute(2.0, 3.0, Operator::Add)), 5.0);
        assert_eq!(must_ok(compute(10.0, 2.0, Operator::Subtract)), 8.0);
        assert_eq!(must_ok(compute(4.0, 6.0, Operator::Multiply)), 24.0);
        assert_eq!(must_ok(compute(9.0, 3.0, Operator::Divide)), 3.0);
    }

    #[test]
    fn evaluate_uses_request_operator() {
        let (operator, result) =
            must_ok(evaluate(&OperationRequest::new(7.0, 2.0, Operator::Subtract)));
        assert_eq!(operator, Operator::Subtract);
        assert_eq!(result.resultado, 5.0);

        let missing = OperationRequest { operando1: 1.0, operando2: 1.0, operacao: None };
        assert_eq!(evaluate(&missing), Err(CalcError::InvalidOperator(String::new())));

        let zero = OperationRequest::new(1.0, 0.0, Operator::Divide);
        assert_eq!(evaluate(&zero), Err(CalcError::DivisionByZero));
    }

    #[test]
    fn request_decodes_without_operator_field() {
        let request: OperationRequest =
            must_ok(serde_json::from_str(r#"{"operando1":2,"operando2":3}"#));
        assert_eq!(request.operando1, 2.0);
        assert_eq!(request.operando2, 3.0);
        assert_eq!(request.operacao, None);

        let missing_operand = serde_json::from_str::<OperationRequest>(r#"{"operando1":2}"#);
        assert!(missing_operand.is_err());
    }

    #[test]
    fn history_entry_omits_absent_id_and_timestamp() {
        let entry = HistoryEntry {
            id: None,
            operando1: 2.0,
            operando2: 3.0,
            operacao: "+".to_string(),
            resultado: 5.0,
            timestamp: None,
        };
        let value = must_ok(serde_json::to_value(&entry));
        assert_eq!(
            value,
            serde_json::json!({"operando1": 2.0, "operando2": 3.0, "operacao": "+", "resultado": 5.0})
        );
    }

    #[test]
    fn in_memory_history_keeps_insertion_order() {
        let history = InMemoryHistory::new();
        assert!(must_ok(history.is_empty()));

        let first = must_ok(history.record(&fixture_entry(Operator::Add, 9.0)));
        let second = must_ok(history.record(&fixture_entry(Operator::Divide, 2.0)));
        assert_eq!(first.id, None);
        assert!(first.timestamp.is_some());

        let listed = must_ok(history.list());
        assert_eq!(listed, vec![first, second]);
        assert_eq!(must_ok(history.len()), 2);
    }

    #[test]
    fn in_memory_history_accepts_concurrent_writers() {
        let history = std::sync::Arc::new(InMemoryHistory::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let history = std::sync::Arc::clone(&history);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        must_ok(history.record(&fixture_entry(Operator::Multiply, 18.0)));
                    }
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                panic!("writer thread panicked");
            }
        }
        assert_eq!(must_ok(history.len()), 200);
    }

    #[test]
    fn timestamps_round_trip_in_utc() {
        let now = now_utc();
        let formatted = must_ok(format_rfc3339(now));
        assert!(formatted.ends_with('Z'));
        assert_eq!(formatted.len(), "2024-01-01T00:00:00.000000000Z".len());
        assert_eq!(must_ok(parse_rfc3339_utc(&formatted)), now);
        assert!(parse_rfc3339_utc("2024-01-01T00:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("not a timestamp").is_err());
    }

    #[test]
    fn formatted_timestamps_sort_chronologically_as_text() {
        let whole = must_ok(parse_rfc3339_utc("2024-05-01T10:00:00Z"));
        let later = must_ok(parse_rfc3339_utc("2024-05-01T10:00:00.12Z"));
        let latest = must_ok(parse_rfc3339_utc("2024-05-01T10:00:00.123Z"));

        let mut texts = vec![
            must_ok(format_rfc3339(latest)),
            must_ok(format_rfc3339(whole)),
            must_ok(format_rfc3339(later)),
        ];
        texts.sort();
        assert_eq!(
            texts,
            vec![
                "2024-05-01T10:00:00.000000000Z".to_string(),
                "2024-05-01T10:00:00.120000000Z".to_string(),
                "2024-05-01T10:00:00.123000000Z".to_string(),
            ]
        );
    }

    #[test]
    fn zero_and_subnormal_operands_follow_ieee() {
        let tiny = f64::from_bits(1);
        assert_eq!(must_ok(compute(0.0, tiny, Operator::Add)), tiny);
        assert_eq!(must_ok(compute(tiny, tiny, Operator::Subtract)), 0.0);
        assert_eq!(must_ok(compute(-0.0, 3.0, Operator::Multiply)), 0.0);
        assert_eq!(must_ok(compute(0.0, tiny, Operator::Divide)), 0.0);
        assert!(must_ok(compute(1.0, tiny, Operator::Divide)).is_infinite());
        assert_eq!(compute(tiny, -0.0, Operator::Divide), Err(CalcError::DivisionByZero));
    }

    fn finite() -> impl Strategy<Value = f64> {
        proptest::num::f64::NORMAL | proptest::num::f64::SUBNORMAL | proptest::num::f64::ZERO
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_add_sub_mul_match_ieee(a in finite(), b in finite()) {
            prop_assert_eq!(compute(a, b, Operator::Add), Ok(a + b));
            prop_assert_eq!(compute(a, b, Operator::Subtract), Ok(a - b));
            prop_assert_eq!(compute(a, b, Operator::Multiply), Ok(a * b));
        }

        #[test]
        fn prop_divide_by_non_zero(a in finite(), b in finite()) {
            prop_assume!(b != 0.0);
            prop_assert_eq!(compute(a, b, Operator::Divide), Ok(a / b));
        }

        #[test]
        fn prop_divide_by_zero_always_fails(a in proptest::num::f64::ANY) {
            prop_assert_eq!(compute(a, 0.0, Operator::Divide), Err(CalcError::DivisionByZero));
        }
    }
}

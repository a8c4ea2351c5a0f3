//! CSV ingestion and amount normalisation
//!
//! Statements arrive as `date,description,amount,type,category` text with
//! a strict row cap; rows are processed in fixed-size batches. Amounts may
//! carry currency prefixes and thousands separators from exported bank
//! statements and are cleaned before decimal parsing.

use crate::error::{OrchestratorError, Result};
use crate::models::TransactionKind;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

pub const CSV_MAX_ROWS: usize = 2000;
pub const CSV_BATCH_SIZE: usize = 500;

const CSV_HEADER: [&str; 5] = ["date", "description", "amount", "type", "category"];

/// Parse a JSON amount that may be a number or a formatted string.
pub fn parse_amount(raw: &Value) -> Result<Decimal> {
    match raw {
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                return Ok(Decimal::from(int));
            }
            number
                .as_f64()
                .and_then(Decimal::from_f64_retain)
                .map(|d| d.round_dp(2))
                .ok_or_else(|| amount_error(&number.to_string()))
        }
        Value::String(text) => clean_amount(text),
        other => Err(amount_error(&other.to_string())),
    }
}

fn amount_error(raw: &str) -> OrchestratorError {
    OrchestratorError::validation(
        "invalid amount",
        vec![format!("not a monetary amount: {raw}")],
    )
}

/// Strip currency letters, separators, and whitespace, keeping sign and
/// decimal point: `"RM1,234.56"` parses as `1234.56`.
pub fn clean_amount(raw: &str) -> Result<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return Err(amount_error(raw));
    }
    Decimal::from_str(&cleaned)
        .map(|d| d.round_dp(2))
        .map_err(|_| amount_error(raw))
}

#[derive(Debug, Clone)]
pub struct CsvRow {
    pub date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub category: Option<String>,
}

/// Split one CSV line, honouring double-quoted fields.
fn split_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Parse a full statement. Any invalid header, oversized input, or bad row
/// fails the whole upload; nothing is partially ingested.
pub fn parse_csv(csv: &str) -> Result<Vec<CsvRow>> {
    let mut lines = csv.lines().filter(|line| !line.trim().is_empty());

    let header_line = lines
        .next()
        .ok_or_else(|| OrchestratorError::validation("empty csv", vec!["no header row".into()]))?;
    let header: Vec<String> = split_line(header_line)
        .iter()
        .map(|field| field.to_lowercase())
        .collect();
    if header != CSV_HEADER {
        return Err(OrchestratorError::validation(
            "invalid csv header",
            vec![format!(
                "expected {}, got {}",
                CSV_HEADER.join(","),
                header.join(",")
            )],
        ));
    }

    let data_lines: Vec<&str> = lines.collect();
    if data_lines.len() > CSV_MAX_ROWS {
        return Err(OrchestratorError::validation(
            "csv exceeds row cap",
            vec![format!(
                "{} rows exceed the {} row limit",
                data_lines.len(),
                CSV_MAX_ROWS
            )],
        ));
    }

    let mut rows = Vec::with_capacity(data_lines.len());
    let mut issues = Vec::new();

    for (index, line) in data_lines.iter().enumerate() {
        let fields = split_line(line);
        if fields.len() != CSV_HEADER.len() {
            issues.push(format!(
                "row {}: expected {} columns, got {}",
                index + 1,
                CSV_HEADER.len(),
                fields.len()
            ));
            continue;
        }

        let date = match NaiveDate::parse_from_str(&fields[0], "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => {
                issues.push(format!("row {}: invalid date {}", index + 1, fields[0]));
                continue;
            }
        };

        let amount = match clean_amount(&fields[2]) {
            Ok(amount) => amount,
            Err(_) => {
                issues.push(format!("row {}: invalid amount {}", index + 1, fields[2]));
                continue;
            }
        };

        let kind = match TransactionKind::parse(&fields[3]) {
            Some(kind) => kind,
            None => {
                issues.push(format!("row {}: unknown type {}", index + 1, fields[3]));
                continue;
            }
        };

        let category = if fields[4].is_empty() {
            None
        } else {
            Some(fields[4].to_lowercase())
        };

        rows.push(CsvRow {
            date,
            description: fields[1].clone(),
            amount,
            kind,
            category,
        });
    }

    if !issues.is_empty() {
        return Err(OrchestratorError::validation("invalid csv rows", issues));
    }

    Ok(rows)
}

/// Fixed-size processing batches, 1-indexed.
pub fn batch_rows(rows: &[CsvRow]) -> Vec<(usize, &[CsvRow])> {
    rows.chunks(CSV_BATCH_SIZE)
        .enumerate()
        .map(|(index, chunk)| (index + 1, chunk))
        .collect()
}

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::model::{Account, Command, IdempotencyKey, TransferRequest};
use crate::Amount;

/// Errors that can occur when reading or writing csv
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{kind}'")]
    UnrecognizedType { line: usize, kind: String },

    #[error("line {line}: {kind} missing {field}")]
    MissingField {
        line: usize,
        kind: String,
        field: &'static str,
    },

    #[error("line {line}: invalid amount '{value}'")]
    InvalidAmount { line: usize, value: String },

    #[error("line {line}: invalid idempotency key '{value}'")]
    InvalidKey { line: usize, value: String },

    #[error("failed to write output: {0}")]
    Write(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    account: i64,
    destination: Option<i64>,
    amount: Option<String>,
    idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    account: i64,
    balance: String,
}

/// Read ledger commands from a csv file. The iterator owns its reader and
/// does not borrow `path`.
pub fn read_commands(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Command, CsvError>> + use<>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Command, CsvError> {
    let kind = row.r#type.as_str();
    let missing = |field| CsvError::MissingField {
        line,
        kind: kind.to_string(),
        field,
    };

    match kind {
        "open" => {
            let balance = row.amount.as_deref().ok_or_else(|| missing("amount"))?;
            Ok(Command::OpenAccount {
                account: row.account,
                balance: parse_amount(line, balance)?,
            })
        }
        "transfer" => {
            let destination = row.destination.ok_or_else(|| missing("destination"))?;
            let amount = row.amount.as_deref().ok_or_else(|| missing("amount"))?;
            let idempotency_key = row
                .idempotency_key
                .filter(|key| !key.is_empty())
                .map(|key| {
                    key.parse::<IdempotencyKey>()
                        .map_err(|_| CsvError::InvalidKey { line, value: key })
                })
                .transpose()?;
            Ok(Command::Transfer(TransferRequest {
                source: row.account,
                destination,
                amount: parse_amount(line, amount)?,
                idempotency_key,
            }))
        }
        other => Err(CsvError::UnrecognizedType {
            line,
            kind: other.to_string(),
        }),
    }
}

fn parse_amount(line: usize, value: &str) -> Result<Amount, CsvError> {
    value.parse().map_err(|_| CsvError::InvalidAmount {
        line,
        value: value.to_string(),
    })
}

/// write account balances to stdout in csv format
pub fn write_accounts<'a>(accounts: impl IntoIterator<Item = &'a Account>) -> Result<(), CsvError> {
    let stdout = io::stdout();
    write_accounts_to(stdout.lock(), accounts)
}

pub fn write_accounts_to<'a, W: io::Write>(
    out: W,
    accounts: impl IntoIterator<Item = &'a Account>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);

    for account in accounts {
        let row = OutputRow {
            account: account.id.get(),
            balance: account.balance.to_string(),
        };
        writer.serialize(&row)?;
    }

    writer.flush().map_err(|e| CsvError::Write(e.into()))?;
    Ok(())
}

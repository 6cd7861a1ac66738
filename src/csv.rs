//! CSV input/output for the batch driver.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::amount::AmountError;
use crate::{Account, Amount, TransactionRequest, TxKind, UserId};

/// Errors that can occur when parsing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open csv file: {0}")]
    Open(csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized transaction kind '{kind}'")]
    UnrecognizedKind { line: usize, kind: String },

    #[error("line {line}: {kind} missing amount")]
    MissingAmount { line: usize, kind: String },

    #[error("line {line}: {source}")]
    InvalidAmount { line: usize, source: AmountError },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    user: UserId,
    kind: String,
    amount: Option<String>,
    request: String,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    user: UserId,
    balance: String,
    version: u64,
}

/// Read wallet requests from a csv file with columns `user,kind,amount,request`
pub fn read_requests(
    path: &Path,
) -> Result<impl Iterator<Item = Result<TransactionRequest, CsvError>> + use<>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let kind = match row.kind.as_str() {
                "deposit" => TxKind::Deposit,
                "withdrawal" => TxKind::Withdrawal,
                "adjustment" => TxKind::Adjustment,
                other => {
                    return Err(CsvError::UnrecognizedKind {
                        line,
                        kind: other.to_string(),
                    });
                }
            };
            let amount = row
                .amount
                .filter(|a| !a.is_empty())
                .ok_or_else(|| CsvError::MissingAmount {
                    line,
                    kind: kind.to_string(),
                })?;
            let amount: Amount = amount
                .parse()
                .map_err(|source| CsvError::InvalidAmount { line, source })?;

            Ok(TransactionRequest::new(row.user, amount, kind, row.request))
        }))
}

/// Write accounts in csv format
pub fn write_accounts<W: io::Write>(
    writer: W,
    accounts: impl IntoIterator<Item = Account>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for account in accounts {
        writer.serialize(OutputRow {
            user: account.user_id,
            balance: account.balance.to_string(),
            version: account.version,
        })?;
    }

    writer.flush()?;
    Ok(())
}

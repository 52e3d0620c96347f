//! Teller wire protocol: parsing one command line from a client and
//! formatting one reply line back to it. A small hand-written adapter kept
//! next to the domain types rather than pulling in a general serializer for
//! a grammar that is just a line of whitespace-delimited tokens.

use std::fmt;

use thiserror::Error;

use crate::queue::{OpStatus, RequestKind, NEW};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// `NEW` (-1) for a fresh account, otherwise a valid `[0, MAX_ACCOUNTS)` id.
    pub target: i32,
    pub kind: RequestKind,
    pub amount: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseCommandError {
    #[error("expected 3 whitespace-separated fields")]
    WrongFieldCount,
    #[error("unrecognized account token {0:?}")]
    BadAccountToken(String),
    #[error("account id out of range")]
    AccountOutOfRange,
    #[error("unrecognized operation {0:?}")]
    BadOp(String),
    #[error("amount must be a positive integer")]
    BadAmount,
}

/// Parses one request line of the form `<account-token> <op> <amount>`.
pub fn parse_command(line: &str) -> Result<Command, ParseCommandError> {
    let fields: Vec<&str> = line.trim().split_whitespace().collect();
    let [account_token, op, amount] = <[&str; 3]>::try_from(fields)
        .map_err(|_| ParseCommandError::WrongFieldCount)?;

    let target = parse_account_token(account_token)?;

    let kind = match op {
        "deposit" => RequestKind::Deposit,
        "withdraw" => RequestKind::Withdraw,
        other => return Err(ParseCommandError::BadOp(other.to_string())),
    };

    let amount: i64 = amount.parse().map_err(|_| ParseCommandError::BadAmount)?;
    if amount <= 0 {
        return Err(ParseCommandError::BadAmount);
    }

    Ok(Command { target, kind, amount })
}

fn parse_account_token(token: &str) -> Result<i32, ParseCommandError> {
    if token == "N" || token == "BankID_None" {
        return Ok(NEW);
    }
    let digits = token.strip_prefix("BankID_").unwrap_or(token);
    let id: i64 = digits
        .parse()
        .map_err(|_| ParseCommandError::BadAccountToken(token.to_string()))?;
    if id < 0 || id >= crate::account::MAX_ACCOUNTS as i64 {
        return Err(ParseCommandError::AccountOutOfRange);
    }
    Ok(id as i32)
}

/// Formats the reply the Teller writes on the response FIFO. `bank_id`,
/// `balance`, and `status` come straight from the server-filled
/// request-slot fields.
pub fn format_response(bank_id: i32, balance: i64, status: OpStatus) -> String {
    match status {
        OpStatus::Ok => format!("OK BankID_{bank_id} balance={balance}\n"),
        OpStatus::Insufficient => format!("FAIL insufficient balance={balance}\n"),
        OpStatus::Error => "FAIL invalid account\n".to_string(),
    }
}

/// Reply for a command the Teller rejected locally, without touching the
/// queue.
pub const BAD_FORMAT_RESPONSE: &str = "ERR bad format\n";

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.kind {
            RequestKind::Deposit => "deposit",
            RequestKind::Withdraw => "withdraw",
        };
        write!(f, "{} {op} {}", self.target, self.amount)
    }
}

//! Server-side request application (part of C6): the deposit/withdraw rules,
//! meant to be called only while the caller holds the database mutex.
//! Mutation and log append are deliberately kept separate from posting the
//! response so the caller can write the result fields and release the lock
//! only after the log append has been flushed, then post the per-slot
//! semaphore last.
//!
//! A fetch-mutate-write-back shape generalized from an in-process HashMap
//! to the shared AccountTable, with the write-before-respond discipline
//! applied throughout.

use thiserror::Error;

use crate::account::{AccountError, AccountTable};
use crate::log::{self, TransactionLog};
use crate::queue::OpStatus;
use crate::transaction::LogEvent;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Log(#[from] log::Error),
}

/// Outcome of applying one request: the account id involved (the assigned
/// id for a NEW deposit, otherwise the id that was targeted), the resulting
/// balance, and the status to report to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub bank_id: i32,
    pub balance: i64,
    pub status: OpStatus,
}

/// Placeholder id reported back when a NEW deposit fails because the bank
/// is full; there is no real account to name.
const NEW_ERROR_ID: i32 = -1;

/// `bank_id == NEW` (-1) requests allocation of a fresh account; otherwise
/// it must name an active account.
pub fn apply_deposit(
    accounts: &mut AccountTable,
    log: &mut TransactionLog,
    bank_id: i32,
    amount: i64,
) -> Result<Outcome, Error> {
    if bank_id < 0 {
        return match accounts.allocate_new() {
            Ok(id) => {
                accounts.create(id, amount).expect("id was just allocated");
                log.append_flushed(LogEvent::Create { id, initial_balance: amount })?;
                log.append_flushed(LogEvent::Deposit { id, amount, balance_after: amount })?;
                Ok(Outcome { bank_id: id as i32, balance: amount, status: OpStatus::Ok })
            }
            Err(AccountError::Full) => {
                Ok(Outcome { bank_id: NEW_ERROR_ID, balance: 0, status: OpStatus::Error })
            }
            Err(_) => unreachable!("allocate_new only returns Full or Ok"),
        };
    }

    let id = bank_id as u32;
    match accounts.deposit(id, amount) {
        Ok(balance) => {
            log.append_flushed(LogEvent::Deposit { id, amount, balance_after: balance })?;
            Ok(Outcome { bank_id, balance, status: OpStatus::Ok })
        }
        Err(_) => Ok(Outcome { bank_id, balance: 0, status: OpStatus::Error }),
    }
}

pub fn apply_withdraw(
    accounts: &mut AccountTable,
    log: &mut TransactionLog,
    bank_id: i32,
    amount: i64,
) -> Result<Outcome, Error> {
    if bank_id < 0 {
        return Ok(Outcome { bank_id, balance: 0, status: OpStatus::Error });
    }
    let id = bank_id as u32;

    match accounts.withdraw(id, amount) {
        Ok(outcome) => {
            log.append_flushed(LogEvent::Withdraw {
                id,
                amount,
                balance_after: outcome.balance_after,
            })?;
            if outcome.closed {
                log.append_flushed(LogEvent::Close { id })?;
            }
            Ok(Outcome { bank_id, balance: outcome.balance_after, status: OpStatus::Ok })
        }
        Err(AccountError::NotEnoughFunds) => {
            let balance = accounts.balance(id).unwrap_or(0);
            Ok(Outcome { bank_id, balance, status: OpStatus::Insufficient })
        }
        Err(_) => Ok(Outcome { bank_id, balance: 0, status: OpStatus::Error }),
    }
}

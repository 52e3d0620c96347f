//! Transaction log event vocabulary and its text grammar.
//!
//! A small hand-written adapter kept next to the domain type instead of a
//! general-purpose serializer, since the grammar is a handful of fixed
//! verb/field layouts rather than a structured record format.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Create { id: u32, initial_balance: i64 },
    Deposit { id: u32, amount: i64, balance_after: i64 },
    Withdraw { id: u32, amount: i64, balance_after: i64 },
    Close { id: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseLogEventError {
    #[error("blank line")]
    Blank,
    #[error("comment line")]
    Comment,
    #[error("unknown verb {0:?}")]
    UnknownVerb(String),
    #[error("malformed record: {0:?}")]
    Malformed(String),
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::Create { id, initial_balance } => write!(f, "CREATE {id} {initial_balance}"),
            LogEvent::Deposit { id, amount, balance_after } => {
                write!(f, "DEPOSIT {id} {amount} {balance_after}")
            }
            LogEvent::Withdraw { id, amount, balance_after } => {
                write!(f, "WITHDRAW {id} {amount} {balance_after}")
            }
            LogEvent::Close { id } => write!(f, "CLOSE {id}"),
        }
    }
}

impl FromStr for LogEvent {
    type Err = ParseLogEventError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseLogEventError::Blank);
        }
        if line.starts_with('#') {
            return Err(ParseLogEventError::Comment);
        }
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| ParseLogEventError::Malformed(line.to_string()))?;
        let rest: Vec<&str> = parts.collect();
        let malformed = || ParseLogEventError::Malformed(line.to_string());

        match verb {
            "CREATE" => {
                let [id, balance] = <[&str; 2]>::try_from(rest).map_err(|_| malformed())?;
                Ok(LogEvent::Create {
                    id: id.parse().map_err(|_| malformed())?,
                    initial_balance: balance.parse().map_err(|_| malformed())?,
                })
            }
            "DEPOSIT" => {
                let [id, amount, balance] = <[&str; 3]>::try_from(rest).map_err(|_| malformed())?;
                Ok(LogEvent::Deposit {
                    id: id.parse().map_err(|_| malformed())?,
                    amount: amount.parse().map_err(|_| malformed())?,
                    balance_after: balance.parse().map_err(|_| malformed())?,
                })
            }
            "WITHDRAW" => {
                let [id, amount, balance] = <[&str; 3]>::try_from(rest).map_err(|_| malformed())?;
                Ok(LogEvent::Withdraw {
                    id: id.parse().map_err(|_| malformed())?,
                    amount: amount.parse().map_err(|_| malformed())?,
                    balance_after: balance.parse().map_err(|_| malformed())?,
                })
            }
            "CLOSE" => {
                let [id] = <[&str; 1]>::try_from(rest).map_err(|_| malformed())?;
                Ok(LogEvent::Close {
                    id: id.parse().map_err(|_| malformed())?,
                })
            }
            other => Err(ParseLogEventError::UnknownVerb(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let events = [
            LogEvent::Create { id: 0, initial_balance: 1000 },
            LogEvent::Deposit { id: 0, amount: 1000, balance_after: 1000 },
            LogEvent::Withdraw { id: 0, amount: 400, balance_after: 600 },
            LogEvent::Close { id: 0 },
        ];
        for event in events {
            let line = event.to_string();
            assert_eq!(line.parse::<LogEvent>().unwrap(), event);
        }
    }

    #[test]
    fn comment_lines_are_reported_distinctly() {
        assert_eq!("# a note".parse::<LogEvent>(), Err(ParseLogEventError::Comment));
    }

    #[test]
    fn blank_lines_are_reported_distinctly() {
        assert_eq!("   ".parse::<LogEvent>(), Err(ParseLogEventError::Blank));
    }

    #[test]
    fn unknown_verb_is_rejected() {
        assert!(matches!(
            "FREEZE 0".parse::<LogEvent>(),
            Err(ParseLogEventError::UnknownVerb(_))
        ));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        assert!(matches!(
            "CREATE abc 10".parse::<LogEvent>(),
            Err(ParseLogEventError::Malformed(_))
        ));
        assert!(matches!("CREATE 0".parse::<LogEvent>(), Err(ParseLogEventError::Malformed(_))));
    }
}

//! In-memory account table (C2): balances indexed by account id, plus the
//! free-slot search hint. Lives inside the shared-memory region (`shm.rs`),
//! so the table itself and every slot must be `repr(C)`/`Copy`. No typestate
//! generics or `PhantomData`, unlike a process-local account model, since a
//! second process maps the very same bytes.

use thiserror::Error;

/// Accounts are addressed by an id in `[0, MAX_ACCOUNTS)`.
pub const MAX_ACCOUNTS: usize = 1024;

/// Sentinel balance meaning "slot unused".
const INACTIVE: i64 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("account id out of range")]
    OutOfRange,
    #[error("account is not active")]
    Inactive,
    #[error("not enough funds")]
    NotEnoughFunds,
    #[error("no free account slot")]
    Full,
}

/// A single balance slot. `INACTIVE` (-1) means unused; any other value is a
/// non-negative balance.
#[repr(C)]
#[derive(Clone, Copy)]
struct AccountSlot {
    balance: i64,
}

impl AccountSlot {
    const fn inactive() -> Self {
        Self { balance: INACTIVE }
    }

    fn is_active(&self) -> bool {
        self.balance >= 0
    }
}

/// Result of a withdrawal that succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawOutcome {
    pub balance_after: i64,
    pub closed: bool,
}

/// Fixed-size account table, safe to place directly inside shared memory.
#[repr(C)]
pub struct AccountTable {
    slots: [AccountSlot; MAX_ACCOUNTS],
    next_id: u32,
}

impl AccountTable {
    pub fn init(&mut self) {
        self.slots = [AccountSlot::inactive(); MAX_ACCOUNTS];
        self.next_id = 0;
    }

    fn check_id(id: u32) -> Result<usize, AccountError> {
        let id = id as usize;
        if id >= MAX_ACCOUNTS {
            Err(AccountError::OutOfRange)
        } else {
            Ok(id)
        }
    }

    pub fn is_active(&self, id: u32) -> bool {
        match Self::check_id(id) {
            Ok(idx) => self.slots[idx].is_active(),
            Err(_) => false,
        }
    }

    pub fn balance(&self, id: u32) -> Result<i64, AccountError> {
        let idx = Self::check_id(id)?;
        if self.slots[idx].is_active() {
            Ok(self.slots[idx].balance)
        } else {
            Err(AccountError::Inactive)
        }
    }

    /// Find the first free slot starting from `next_id`, wrapping around.
    /// Updates the hint so the next allocation continues past this id.
    pub fn allocate_new(&mut self) -> Result<u32, AccountError> {
        for offset in 0..MAX_ACCOUNTS {
            let idx = (self.next_id as usize + offset) % MAX_ACCOUNTS;
            if !self.slots[idx].is_active() {
                self.next_id = ((idx + 1) % MAX_ACCOUNTS) as u32;
                return Ok(idx as u32);
            }
        }
        Err(AccountError::Full)
    }

    /// Used on allocation and on log replay of a CREATE record.
    pub fn create(&mut self, id: u32, initial_balance: i64) -> Result<(), AccountError> {
        let idx = Self::check_id(id)?;
        self.slots[idx] = AccountSlot {
            balance: initial_balance,
        };
        Ok(())
    }

    pub fn deposit(&mut self, id: u32, amount: i64) -> Result<i64, AccountError> {
        let idx = Self::check_id(id)?;
        if !self.slots[idx].is_active() {
            return Err(AccountError::Inactive);
        }
        self.slots[idx].balance += amount;
        Ok(self.slots[idx].balance)
    }

    pub fn withdraw(&mut self, id: u32, amount: i64) -> Result<WithdrawOutcome, AccountError> {
        let idx = Self::check_id(id)?;
        if !self.slots[idx].is_active() {
            return Err(AccountError::Inactive);
        }
        if self.slots[idx].balance < amount {
            return Err(AccountError::NotEnoughFunds);
        }
        self.slots[idx].balance -= amount;
        let balance_after = self.slots[idx].balance;
        let closed = balance_after == 0;
        if closed {
            self.slots[idx] = AccountSlot::inactive();
        }
        Ok(WithdrawOutcome {
            balance_after,
            closed,
        })
    }

    /// Used on log replay of a CLOSE record.
    pub fn close(&mut self, id: u32) -> Result<(), AccountError> {
        let idx = Self::check_id(id)?;
        self.slots[idx] = AccountSlot::inactive();
        Ok(())
    }

    /// Sets the balance directly, for log replay of DEPOSIT/WITHDRAW records
    /// that carry an absolute `balance-after` value. Reactivates an inactive
    /// slot if necessary (on replay, the final recorded balance wins).
    pub fn set_balance(&mut self, id: u32, balance: i64) -> Result<(), AccountError> {
        let idx = Self::check_id(id)?;
        self.slots[idx].balance = balance;
        Ok(())
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (u32, i64)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_active())
            .map(|(id, slot)| (id as u32, slot.balance))
    }
}

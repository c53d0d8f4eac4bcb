//! Core types for the transactor
//!
//! All types are designed for:
//! - Deterministic serialization (bincode for storage, JSON for clients)
//! - Exact arithmetic (Decimal for money, rendered as strings on the wire)

use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Value domain partition; every account and transfer lives on exactly one ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Ledger {
    /// Supremacy tokens
    Sups,
    /// US Dollar
    Usd,
    /// Ether
    Eth,
}

impl Ledger {
    /// Every known ledger, in code order
    pub const ALL: [Ledger; 3] = [Ledger::Sups, Ledger::Usd, Ledger::Eth];

    /// Stable numeric code
    pub fn code(&self) -> u32 {
        match self {
            Ledger::Sups => 1,
            Ledger::Usd => 2,
            Ledger::Eth => 3,
        }
    }

    /// Ticker symbol
    pub fn symbol(&self) -> &'static str {
        match self {
            Ledger::Sups => "SUPS",
            Ledger::Usd => "USD",
            Ledger::Eth => "ETH",
        }
    }

    /// Parse from numeric code
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|ledger| ledger.code() == code)
    }

    /// Parse from ticker symbol (case-insensitive)
    pub fn from_symbol(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|ledger| ledger.symbol().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Role of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountCode {
    /// Ordinary user account
    User,
    /// System / clearing account
    System,
}

/// Transfer classification, opaque to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferCode(pub u32);

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-user, per-ledger account
///
/// `debits_posted` and `credits_posted` only ever grow. `balance` is derived
/// from them and kept alongside as a convenience for readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier
    pub id: Uuid,

    /// Owner
    pub user_id: String,

    /// Ledger the account belongs to
    pub ledger: Ledger,

    /// Role classifier
    pub code: AccountCode,

    /// Sum of all debits applied
    #[serde(with = "rust_decimal::serde::str")]
    pub debits_posted: Decimal,

    /// Sum of all credits applied
    #[serde(with = "rust_decimal::serde::str")]
    pub credits_posted: Decimal,

    /// `credits_posted - debits_posted`
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,

    /// Creation time (unix seconds)
    pub created_at: i64,
}

impl Account {
    /// Create an empty account
    pub fn new(user_id: impl Into<String>, code: AccountCode, ledger: Ledger) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            ledger,
            code,
            debits_posted: Decimal::ZERO,
            credits_posted: Decimal::ZERO,
            balance: Decimal::ZERO,
            created_at: Utc::now().timestamp(),
        }
    }

    /// Recompute `balance` from the accumulators
    pub fn recompute_balance(&mut self) {
        self.balance = self.credits_posted - self.debits_posted;
    }

    /// Apply the debit side of a transfer
    ///
    /// Leaves the account untouched if `debits_posted` would overflow.
    pub fn post_debit(&mut self, amount: Decimal) -> Result<()> {
        self.debits_posted = self
            .debits_posted
            .checked_add(amount)
            .ok_or_else(|| self.overflow(amount))?;
        self.recompute_balance();
        Ok(())
    }

    /// Apply the credit side of a transfer
    ///
    /// Leaves the account untouched if `credits_posted` would overflow.
    pub fn post_credit(&mut self, amount: Decimal) -> Result<()> {
        self.credits_posted = self
            .credits_posted
            .checked_add(amount)
            .ok_or_else(|| self.overflow(amount))?;
        self.recompute_balance();
        Ok(())
    }

    fn overflow(&self, amount: Decimal) -> Error {
        Error::InvalidArgument(format!(
            "amount {} overflows account {}",
            amount, self.id
        ))
    }

    /// Balance rendered for clients
    pub fn balance_string(&self) -> String {
        self.balance.to_string()
    }
}

/// Immutable record of value moving from a debit account to a credit account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Unique transfer ID
    pub id: Uuid,

    /// Account whose `debits_posted` grows
    pub debit_account_id: Uuid,

    /// Account whose `credits_posted` grows
    pub credit_account_id: Uuid,

    /// Amount moved (strictly positive)
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,

    /// Ledger of both accounts
    pub ledger: Ledger,

    /// Classification
    pub code: TransferCode,

    /// Recording time (unix seconds)
    pub timestamp: i64,
}

/// Client view of a recorded transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTransfer {
    /// Transfer ID
    pub id: Uuid,
    /// Credited user
    pub credit_user_id: String,
    /// Credited account
    pub credit_account_id: Uuid,
    /// Debited user
    pub debit_user_id: String,
    /// Debited account
    pub debit_account_id: Uuid,
    /// Amount as an exact decimal string
    pub amount: String,
    /// Ledger
    pub ledger: Ledger,
    /// Classification
    pub code: TransferCode,
    /// Recording time (unix seconds)
    pub timestamp: i64,
}

impl CompletedTransfer {
    /// Join a transfer with the owners of both sides
    pub fn from_transfer(transfer: &Transfer, debit_user_id: &str, credit_user_id: &str) -> Self {
        Self {
            id: transfer.id,
            credit_user_id: credit_user_id.to_string(),
            credit_account_id: transfer.credit_account_id,
            debit_user_id: debit_user_id.to_string(),
            debit_account_id: transfer.debit_account_id,
            amount: transfer.amount.to_string(),
            ledger: transfer.ledger,
            code: transfer.code,
            timestamp: transfer.timestamp,
        }
    }
}

/// Broadcast payload: a completed transfer with one side's post-transfer account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Account snapshot after the transfer was applied
    pub account: Account,
    /// The transfer
    pub transfer: CompletedTransfer,
}

/// Inbound transfer request, as received from clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// User receiving value
    pub credit_user_id: String,
    /// User sending value
    pub debit_user_id: String,
    /// Ledger
    pub ledger: Ledger,
    /// Decimal amount as text
    pub amount: String,
    /// Classification
    pub code: TransferCode,
}

/// Sort direction for transfer history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    /// Ascending (oldest first for `CreatedAt`)
    Asc,
    /// Descending (newest first for `CreatedAt`)
    #[default]
    Desc,
}

impl SortDirection {
    /// `"desc"` (any case) is descending, anything else ascending
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("desc") {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }
}

/// Column a transfer history page is ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortColumn {
    /// Transfer id
    Id,
    /// Amount
    Amount,
    /// Recording order
    #[default]
    CreatedAt,
    /// Debit account id
    DebitAccount,
    /// Credit account id
    CreditAccount,
    /// Ledger code
    Ledger,
    /// Transfer code
    TransferCode,
}

impl SortColumn {
    /// Parse a client-supplied column name; unknown names yield `None`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "id" => Some(SortColumn::Id),
            "amount" => Some(SortColumn::Amount),
            "created_at" => Some(SortColumn::CreatedAt),
            "debit_account_id" => Some(SortColumn::DebitAccount),
            "credit_account_id" => Some(SortColumn::CreditAccount),
            "ledger" => Some(SortColumn::Ledger),
            "transfer_code" => Some(SortColumn::TransferCode),
            _ => None,
        }
    }
}

/// Pagination window for transfer history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Number of records to skip
    pub offset: usize,
    /// Maximum number of records to return
    pub limit: usize,
    /// Ordering column
    pub sort_by: SortColumn,
    /// Ordering direction
    pub direction: SortDirection,
}

impl Page {
    /// Build a page from raw request fields
    ///
    /// An unknown `sort_by` falls back to newest first, whatever
    /// `sort_dir` says.
    pub fn from_request(offset: usize, limit: usize, sort_by: &str, sort_dir: &str) -> Self {
        let (sort_by, direction) = match SortColumn::from_name(sort_by) {
            Some(column) => (column, SortDirection::from_name(sort_dir)),
            None => (SortColumn::CreatedAt, SortDirection::Desc),
        };
        Self {
            offset,
            limit,
            sort_by,
            direction,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
            sort_by: SortColumn::CreatedAt,
            direction: SortDirection::Desc,
        }
    }
}

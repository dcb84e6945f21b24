// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! # Ledgerbook
//!
//! A double-entry accounting ledger persisted in MongoDB.
//!
//! A [`Book`] is a named ledger namespace. Journal entries are built
//! with [`Book::entry`] and committed atomically once debits and credits
//! balance; balances and transaction listings are answered for arbitrary
//! account subtrees through [`Book::balance`] and [`Book::ledger`], and
//! a committed journal can be reversed with [`Book::void`].
//!
//! ## Core Components
//!
//! - [`Book`]: ledger namespace, query surface and void protocol
//! - [`Entry`]: entry builder and atomic commit protocol
//! - [`Query`]: user-facing filter compiled to a store predicate
//! - [`AccountPath`]: hierarchical `:`-separated account names
//! - [`LedgerError`]: error types for every operation
//!
//! ## Example
//!
//! ```no_run
//! use ledgerbook::{Book, BookOptions, Query};
//!
//! # async fn demo() -> Result<(), ledgerbook::LedgerError> {
//! let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
//! let book = Book::new(&client.database("accounting"), "mybook", BookOptions::default())?;
//! book.ensure_indexes().await?;
//!
//! let mut entry = book.entry("invoice 42");
//! entry.debit("Assets:Receivable", 250.0, None)?;
//! entry.credit("Income:Sales", 250.0, None)?;
//! let journal = entry.commit().await?;
//!
//! let result = book.balance(&Query::new().account("Income")).await?;
//! assert_eq!(result.balance, 250.0);
//!
//! book.void(journal.id, Some("typo")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Commits touching overlapping account sets serialize through account
//! write-locks inside the store transaction; the losing writer gets a
//! [`LedgerError::TransientConflict`] and retries. Reads take no locks.
//! The crate keeps no in-process caches; balance caching lives in the
//! store as TTL-evicted snapshot documents.

pub mod account;
mod balance;
mod book;
mod entry;
pub mod error;
mod ledger;
mod lock;
pub mod model;
mod query;

pub use account::AccountPath;
pub use balance::BalanceResult;
pub use book::{Book, BookOptions};
pub use entry::Entry;
pub use error::LedgerError;
pub use ledger::LedgerPage;
pub use model::{AccountLock, BalanceSnapshot, Journal, Transaction};
pub use query::{DateInput, Query};

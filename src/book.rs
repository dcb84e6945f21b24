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

//! The book: a named ledger namespace.
//!
//! A [`Book`] scopes every journal, transaction, lock and balance
//! snapshot to its name and carries the tuning knobs (decimal precision,
//! account depth limit, snapshot TTL). It is cheap to clone and safe to
//! share; all state lives in the store.

use crate::balance::{self, BalanceResult};
use crate::entry::Entry;
use crate::ledger::{self, LedgerPage};
use crate::lock;
use crate::model::{self, AccountLock, BalanceSnapshot, Journal, Transaction};
use crate::query::Query;
use crate::LedgerError;
use bson::oid::ObjectId;
use bson::{doc, Bson};
use mongodb::{Client, ClientSession, Collection, Database};
use std::fmt;
use tracing::instrument;

/// Book tuning options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookOptions {
    /// Fractional digits retained when rounding aggregated balances.
    pub precision: u32,
    /// Maximum number of `:`-separated segments in an account path.
    pub max_account_path: usize,
    /// Seconds after which a balance snapshot is considered stale and
    /// refreshed. `0` disables snapshots entirely.
    pub balance_snapshot_sec: u64,
}

impl Default for BookOptions {
    fn default() -> Self {
        Self {
            precision: 8,
            max_account_path: 3,
            balance_snapshot_sec: 86_400,
        }
    }
}

/// A named double-entry ledger backed by a document store.
#[derive(Clone)]
pub struct Book {
    client: Client,
    name: String,
    options: BookOptions,
    journals: Collection<Journal>,
    transactions: Collection<Transaction>,
    locks: Collection<AccountLock>,
    balances: Collection<BalanceSnapshot>,
}

impl Book {
    /// Opens a book in `database`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::BookConstructor`] for an empty (or
    /// whitespace-only) name.
    pub fn new(
        database: &Database,
        name: impl Into<String>,
        options: BookOptions,
    ) -> Result<Self, LedgerError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(LedgerError::BookConstructor(
                "name must be a non-empty string".to_string(),
            ));
        }
        Ok(Self {
            client: database.client().clone(),
            journals: database.collection(model::JOURNALS),
            transactions: database.collection(model::TRANSACTIONS),
            locks: database.collection(model::LOCKS),
            balances: database.collection(model::BALANCES),
            name,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn precision(&self) -> u32 {
        self.options.precision
    }

    pub fn max_account_path(&self) -> usize {
        self.options.max_account_path
    }

    pub fn balance_snapshot_sec(&self) -> u64 {
        self.options.balance_snapshot_sec
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn journals(&self) -> &Collection<Journal> {
        &self.journals
    }

    pub(crate) fn transactions(&self) -> &Collection<Transaction> {
        &self.transactions
    }

    pub(crate) fn locks(&self) -> &Collection<AccountLock> {
        &self.locks
    }

    pub(crate) fn balances(&self) -> &Collection<BalanceSnapshot> {
        &self.balances
    }

    /// Creates every index the book's collections rely on, including the
    /// TTL index evicting stale balance snapshots. Idempotent; call once
    /// at startup.
    pub async fn ensure_indexes(&self) -> Result<(), LedgerError> {
        model::ensure_indexes(&self.journals, &self.transactions, &self.locks, &self.balances)
            .await
    }

    /// Starts a new journal entry. The posting date defaults to the
    /// commit wall clock; see [`Entry::datetime`] to override it.
    pub fn entry(&self, memo: impl Into<String>) -> Entry<'_> {
        Entry::new(self, memo.into(), None, None)
    }

    /// Computes the cumulative `credit − debit` balance over the query's
    /// filter, using the freshest applicable snapshot.
    pub async fn balance(&self, query: &Query) -> Result<BalanceResult, LedgerError> {
        balance::balance(self, query).await
    }

    /// Lists matching transactions, newest first, with optional
    /// pagination. See [`Query::per_page`] and [`Query::page`].
    pub async fn ledger(&self, query: &Query) -> Result<LedgerPage, LedgerError> {
        ledger::ledger(self, query).await
    }

    /// Voids a journal in its own store transaction: writes a reversing
    /// journal and marks the original (and its transactions) voided.
    /// Returns the reversal.
    ///
    /// `reason` defaults to the original memo; either way it is recorded
    /// as `void_reason` on the original documents and carried in the
    /// reversal's memo.
    pub async fn void(
        &self,
        journal_id: ObjectId,
        reason: Option<&str>,
    ) -> Result<Journal, LedgerError> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        match self.void_in_session(journal_id, reason, &mut session).await {
            Ok(reversal) => {
                session.commit_transaction().await?;
                Ok(reversal)
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                Err(err)
            }
        }
    }

    /// Voids a journal inside a caller-managed store transaction.
    ///
    /// # Errors
    ///
    /// [`LedgerError::JournalNotFound`] if the journal does not exist or
    /// belongs to another book; [`LedgerError::JournalAlreadyVoided`] on
    /// a second attempt.
    #[instrument(
        name = "ledgerbook.void",
        skip(self, session),
        fields(book = %self.name)
    )]
    pub async fn void_in_session(
        &self,
        journal_id: ObjectId,
        reason: Option<&str>,
        session: &mut ClientSession,
    ) -> Result<Journal, LedgerError> {
        let journal = self
            .journals
            .find_one(doc! { "_id": journal_id, "book": self.name.as_str() })
            .session(&mut *session)
            .await?
            .ok_or(LedgerError::JournalNotFound(journal_id))?;

        if journal.voided {
            return Err(LedgerError::JournalAlreadyVoided(journal_id));
        }

        let reason = reason
            .map(str::to_owned)
            .unwrap_or_else(|| journal.memo.clone());

        let mut cursor = self
            .transactions
            .find(doc! { "_journal": journal_id })
            .session(&mut *session)
            .await?;
        let mut postings: Vec<Transaction> = Vec::new();
        while let Some(tx) = cursor.next(&mut *session).await.transpose()? {
            postings.push(tx);
        }

        // The reversal swaps each posting's debit and credit, so on every
        // touched account original + reversal sum to zero.
        let mut reversal = Entry::new(self, format!("[REVERSAL] {reason}"), None, Some(journal_id));
        for tx in &postings {
            let meta = if tx.meta.is_empty() {
                None
            } else {
                Some(tx.meta.clone())
            };
            if tx.credit > 0.0 {
                reversal.debit(&tx.account_path, tx.credit, meta)?;
            } else {
                reversal.credit(&tx.account_path, tx.debit, meta)?;
            }
        }
        let reversal_journal = reversal.commit_in_session(session).await?;

        self.journals
            .update_one(
                doc! { "_id": journal_id },
                doc! { "$set": {
                    "voided": true,
                    "void_reason": reason.as_str(),
                    "voided_by": reversal_journal.id,
                } },
            )
            .session(&mut *session)
            .await?;
        self.transactions
            .update_many(
                doc! { "_journal": journal_id },
                doc! { "$set": { "voided": true, "void_reason": reason.as_str() } },
            )
            .session(&mut *session)
            .await?;

        Ok(reversal_journal)
    }

    /// Enumerates every distinct account path ever posted to, including
    /// every prefix, sorted.
    pub async fn list_accounts(&self) -> Result<Vec<String>, LedgerError> {
        let values = self
            .transactions
            .distinct("accounts", doc! { "book": self.name.as_str() })
            .await?;
        let mut accounts: Vec<String> = values
            .into_iter()
            .filter_map(|value| match value {
                Bson::String(account) => Some(account),
                _ => None,
            })
            .collect();
        accounts.sort();
        Ok(accounts)
    }

    /// Takes the account write-locks inside the caller's session,
    /// serializing against concurrent commits touching the same
    /// accounts. Accounts are deduplicated and locked in lexicographic
    /// order regardless of input order.
    pub async fn writelock_accounts<S: AsRef<str>>(
        &self,
        accounts: &[S],
        session: &mut ClientSession,
    ) -> Result<(), LedgerError> {
        let accounts: Vec<&str> = accounts.iter().map(AsRef::as_ref).collect();
        lock::writelock_accounts(self, &accounts, session).await
    }
}

impl fmt::Debug for Book {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Book")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

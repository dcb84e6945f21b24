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

//! Journal entry builder and commit protocol.
//!
//! An [`Entry`] accumulates debit and credit postings, then writes the
//! journal and all its transactions atomically. Commit verifies the
//! accounting invariant |Σ debit − Σ credit| ≤ 10^−precision and
//! serializes against concurrent writers via account write-locks.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(book: ledgerbook::Book) -> Result<(), ledgerbook::LedgerError> {
//! let mut entry = book.entry("opening balance");
//! entry.debit("Assets:Cash", 100.0, None)?;
//! entry.credit("Income:Sales", 100.0, None)?;
//! let journal = entry.commit().await?;
//! # Ok(())
//! # }
//! ```

use crate::account::AccountPath;
use crate::book::Book;
use crate::lock;
use crate::model::{Journal, Transaction};
use crate::LedgerError;
use bson::oid::ObjectId;
use bson::Document;
use chrono::Utc;
use mongodb::ClientSession;
use tracing::instrument;

#[derive(Debug, Clone, Copy)]
enum Side {
    Debit,
    Credit,
}

#[derive(Debug, Clone)]
struct Posting {
    account: AccountPath,
    debit: f64,
    credit: f64,
    meta: Document,
}

/// An uncommitted journal entry.
///
/// Created with [`Book::entry`]. The entry holds its postings in memory;
/// nothing reaches the store until [`Entry::commit`] or
/// [`Entry::commit_in_session`].
#[derive(Debug)]
pub struct Entry<'a> {
    book: &'a Book,
    memo: String,
    datetime: chrono::DateTime<Utc>,
    original_journal: Option<ObjectId>,
    postings: Vec<Posting>,
    committed: bool,
}

impl<'a> Entry<'a> {
    pub(crate) fn new(
        book: &'a Book,
        memo: String,
        datetime: Option<chrono::DateTime<Utc>>,
        original_journal: Option<ObjectId>,
    ) -> Self {
        Self {
            book,
            memo,
            datetime: datetime.unwrap_or_else(Utc::now),
            original_journal,
            postings: Vec::new(),
            committed: false,
        }
    }

    /// Overrides the user-facing posting date. Defaults to the commit
    /// wall clock.
    pub fn datetime(&mut self, datetime: chrono::DateTime<Utc>) -> &mut Self {
        self.datetime = datetime;
        self
    }

    /// Marks this entry as a reversal of `journal`. The back-reference is
    /// persisted on the journal and each of its transactions.
    pub fn original_journal(&mut self, journal: ObjectId) -> &mut Self {
        self.original_journal = Some(journal);
        self
    }

    /// Appends a debit posting.
    ///
    /// # Errors
    ///
    /// Fails on a negative or non-finite amount, or an invalid account
    /// path. Nothing is sent to the store.
    pub fn debit(
        &mut self,
        account_path: &str,
        amount: f64,
        meta: Option<Document>,
    ) -> Result<&mut Self, LedgerError> {
        self.post(account_path, amount, Side::Debit, meta)
    }

    /// Appends a credit posting.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Entry::debit`].
    pub fn credit(
        &mut self,
        account_path: &str,
        amount: f64,
        meta: Option<Document>,
    ) -> Result<&mut Self, LedgerError> {
        self.post(account_path, amount, Side::Credit, meta)
    }

    fn post(
        &mut self,
        account_path: &str,
        amount: f64,
        side: Side,
        meta: Option<Document>,
    ) -> Result<&mut Self, LedgerError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let account = AccountPath::parse(account_path, self.book.max_account_path())?;
        let (debit, credit) = match side {
            Side::Debit => (amount, 0.0),
            Side::Credit => (0.0, amount),
        };
        self.postings.push(Posting {
            account,
            debit,
            credit,
            meta: meta.unwrap_or_default(),
        });
        Ok(self)
    }

    /// Number of pending postings.
    pub fn transaction_count(&self) -> usize {
        self.postings.len()
    }

    /// Commits the entry in its own store transaction.
    ///
    /// Starts a session, takes the account write-locks, writes the
    /// journal and its transactions, and commits. On any failure the
    /// store transaction is aborted and no partial state remains; a
    /// [`LedgerError::TransientConflict`] means a concurrent commit
    /// touched an overlapping account set and this commit can be retried
    /// as-is.
    pub async fn commit(&mut self) -> Result<Journal, LedgerError> {
        let mut session = self.book.client().start_session().await?;
        session.start_transaction().await?;
        match self.commit_in_session(&mut session).await {
            Ok(journal) => {
                session.commit_transaction().await?;
                Ok(journal)
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                Err(err)
            }
        }
    }

    /// Commits the entry inside a caller-managed store transaction.
    ///
    /// The caller owns the session lifecycle; this neither commits nor
    /// aborts it.
    #[instrument(
        name = "ledgerbook.entry.commit",
        skip_all,
        fields(book = %self.book.name(), memo = %self.memo, postings = self.postings.len())
    )]
    pub async fn commit_in_session(
        &mut self,
        session: &mut ClientSession,
    ) -> Result<Journal, LedgerError> {
        if self.committed {
            return Err(LedgerError::AlreadyCommitted);
        }

        let difference = balance_gap(&self.postings);
        if difference > balance_epsilon(self.book.precision()) {
            return Err(LedgerError::UnbalancedJournal { difference });
        }

        let journal_id = ObjectId::new();
        let datetime = bson::DateTime::from_chrono(self.datetime);
        // Commit wall time, never the user-supplied datetime.
        let timestamp = bson::DateTime::now();

        let transactions: Vec<Transaction> = self
            .postings
            .iter()
            .map(|posting| Transaction {
                id: ObjectId::new(),
                book: self.book.name().to_string(),
                journal: journal_id,
                datetime,
                timestamp,
                account_path: posting.account.as_str().to_string(),
                accounts: posting.account.prefixes(),
                debit: posting.debit,
                credit: posting.credit,
                meta: posting.meta.clone(),
                voided: false,
                void_reason: None,
                original_journal: self.original_journal,
            })
            .collect();

        let journal = Journal {
            id: journal_id,
            book: self.book.name().to_string(),
            datetime,
            memo: self.memo.clone(),
            transactions: transactions.iter().map(|tx| tx.id).collect(),
            voided: false,
            void_reason: None,
            voided_by: None,
            original_journal: self.original_journal,
        };

        let touched: Vec<&str> = self
            .postings
            .iter()
            .map(|posting| posting.account.as_str())
            .collect();
        lock::writelock_accounts(self.book, &touched, session).await?;

        self.book
            .journals()
            .insert_one(&journal)
            .session(&mut *session)
            .await?;
        if !transactions.is_empty() {
            self.book
                .transactions()
                .insert_many(&transactions)
                .session(&mut *session)
                .await?;
        }

        self.committed = true;
        Ok(journal)
    }
}

fn balance_gap(postings: &[Posting]) -> f64 {
    let debits: f64 = postings.iter().map(|p| p.debit).sum();
    let credits: f64 = postings.iter().map(|p| p.credit).sum();
    (debits - credits).abs()
}

fn balance_epsilon(precision: u32) -> f64 {
    10f64.powi(-(precision as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{Book, BookOptions};
    use bson::doc;

    async fn offline_book() -> Book {
        // Client construction is lazy; no server is contacted here.
        let client = mongodb::Client::with_uri_str("mongodb://localhost:27017")
            .await
            .unwrap();
        Book::new(
            &client.database("ledgerbook_unit"),
            "test",
            BookOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn postings_accumulate() {
        let book = offline_book().await;
        let mut entry = book.entry("memo");
        entry.debit("Assets:Cash", 100.0, None).unwrap();
        entry.credit("Income:Sales", 100.0, None).unwrap();
        assert_eq!(entry.transaction_count(), 2);
    }

    #[tokio::test]
    async fn rejects_negative_amount() {
        let book = offline_book().await;
        let mut entry = book.entry("memo");
        let err = entry.debit("Assets", -5.0, None).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn rejects_non_finite_amounts() {
        let book = offline_book().await;
        let mut entry = book.entry("memo");
        assert!(entry.credit("Assets", f64::NAN, None).is_err());
        assert!(entry.credit("Assets", f64::INFINITY, None).is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_account_path() {
        let book = offline_book().await;
        let mut entry = book.entry("memo");
        let err = entry.debit("A:B:C:D", 1.0, None).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAccountPath { .. }));
    }

    #[tokio::test]
    async fn meta_is_attached_to_the_posting() {
        let book = offline_book().await;
        let mut entry = book.entry("memo");
        entry
            .debit("Assets", 1.0, Some(doc! { "clientId": 7 }))
            .unwrap();
        assert_eq!(entry.postings[0].meta, doc! { "clientId": 7 });
    }

    #[test]
    fn balance_gap_of_mirrored_postings_is_zero() {
        let account = AccountPath::parse("Assets", 3).unwrap();
        let postings = vec![
            Posting {
                account: account.clone(),
                debit: 33.33,
                credit: 0.0,
                meta: Document::new(),
            },
            Posting {
                account,
                debit: 0.0,
                credit: 33.33,
                meta: Document::new(),
            },
        ];
        assert_eq!(balance_gap(&postings), 0.0);
    }

    #[test]
    fn balance_gap_detects_skew() {
        let account = AccountPath::parse("Assets", 3).unwrap();
        let postings = vec![
            Posting {
                account: account.clone(),
                debit: 100.0,
                credit: 0.0,
                meta: Document::new(),
            },
            Posting {
                account,
                debit: 0.0,
                credit: 99.0,
                meta: Document::new(),
            },
        ];
        assert!((balance_gap(&postings) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn epsilon_follows_precision() {
        assert_eq!(balance_epsilon(0), 1.0);
        assert_eq!(balance_epsilon(2), 0.01);
        assert!((balance_epsilon(8) - 1e-8).abs() < 1e-20);
    }
}

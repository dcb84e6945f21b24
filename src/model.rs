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

//! Persisted document types and their collections.
//!
//! Collection names are part of the store contract:
//! [`JOURNALS`], [`TRANSACTIONS`], [`LOCKS`] and [`BALANCES`].
//!
//! Journals and transactions are append-only; the void protocol flips
//! `voided` in place and writes fresh reversing documents. Balance
//! snapshots are created opportunistically and evicted by the TTL index
//! on `expireAt`. Lock documents live forever.

use crate::LedgerError;
use bson::oid::ObjectId;
use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use mongodb::{Collection, IndexModel};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Journal collection name.
pub const JOURNALS: &str = "journals";
/// Transaction collection name.
pub const TRANSACTIONS: &str = "transactions";
/// Account lock collection name.
pub const LOCKS: &str = "locks";
/// Balance snapshot collection name.
pub const BALANCES: &str = "balances";

/// The atomic unit of commit: a group of balanced postings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub book: String,
    /// User-supplied posting date, or the commit wall clock if none was given.
    pub datetime: DateTime,
    pub memo: String,
    /// Child transactions, in posting order.
    #[serde(rename = "_transactions")]
    pub transactions: Vec<ObjectId>,
    #[serde(default)]
    pub voided: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub void_reason: Option<String>,
    /// The reversing journal, once this journal has been voided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voided_by: Option<ObjectId>,
    /// The journal this one reverses, when it is itself a reversal.
    #[serde(rename = "_original_journal", skip_serializing_if = "Option::is_none")]
    pub original_journal: Option<ObjectId>,
}

/// One posting of a journal. Exactly one of `debit`/`credit` is non-zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub book: String,
    #[serde(rename = "_journal")]
    pub journal: ObjectId,
    /// User-supplied posting date, shared with the parent journal.
    pub datetime: DateTime,
    /// Commit wall time. Distinct from the user `datetime`.
    pub timestamp: DateTime,
    pub account_path: String,
    /// Every prefix of `account_path`, in ascending depth order.
    pub accounts: Vec<String>,
    pub debit: f64,
    pub credit: f64,
    #[serde(default)]
    pub meta: Document,
    #[serde(default)]
    pub voided: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub void_reason: Option<String>,
    #[serde(rename = "_original_journal", skip_serializing_if = "Option::is_none")]
    pub original_journal: Option<ObjectId>,
}

/// Per `(book, account)` upsert-only document.
///
/// Carries no semantic data. Its only purpose is to create a write-write
/// conflict between concurrent store transactions touching the same
/// account; the `revision` counter is bumped on every lock and serves as
/// a debug trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLock {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub book: String,
    pub account: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime,
    #[serde(default)]
    pub revision: i64,
}

/// Cached partial balance for a `(book, account, meta)` key.
///
/// Invariant: adding the `credit - debit` sum of every transaction with
/// `_id` strictly greater than `transaction` and matching the key
/// reproduces the live balance. Snapshots are never invalidated by
/// writes; a newer snapshot supersedes an older one by covering more
/// transactions, and stale ones expire by TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub book: String,
    /// Comma-joined canonical account selector; absent for whole-book keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Canonical rendering of the meta filter; absent for meta-less keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
    /// Latest transaction included in `balance`.
    pub transaction: ObjectId,
    pub timestamp: DateTime,
    pub balance: f64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime,
    #[serde(rename = "expireAt")]
    pub expire_at: DateTime,
}

fn index(keys: Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

/// Creates every index the collections rely on, including the TTL index
/// driving snapshot eviction and the unique lock index. Idempotent.
pub(crate) async fn ensure_indexes(
    journals: &Collection<Journal>,
    transactions: &Collection<Transaction>,
    locks: &Collection<AccountLock>,
    balances: &Collection<BalanceSnapshot>,
) -> Result<(), LedgerError> {
    transactions
        .create_indexes(vec![
            index(doc! { "book": 1, "account_path": 1 }),
            index(doc! { "book": 1, "accounts": 1 }),
            index(doc! { "book": 1, "datetime": 1 }),
            index(doc! { "book": 1, "_journal": 1 }),
            index(doc! { "book": 1, "_id": 1 }),
        ])
        .await?;

    journals
        .create_index(index(doc! { "book": 1, "_id": 1 }))
        .await?;

    locks
        .create_index(
            IndexModel::builder()
                .keys(doc! { "book": 1, "account": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
        )
        .await?;

    balances
        .create_indexes(vec![
            // Descending on `transaction` for the best-snapshot lookup.
            index(doc! { "book": 1, "account": 1, "meta": 1, "transaction": -1 }),
            IndexModel::builder()
                .keys(doc! { "expireAt": 1 })
                .options(
                    IndexOptions::builder()
                        .expire_after(Duration::from_secs(0))
                        .build(),
                )
                .build(),
        ])
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Bson;

    #[test]
    fn transaction_serializes_with_store_field_names() {
        let journal_id = ObjectId::new();
        let tx = Transaction {
            id: ObjectId::new(),
            book: "test".to_string(),
            journal: journal_id,
            datetime: DateTime::now(),
            timestamp: DateTime::now(),
            account_path: "Assets:Cash".to_string(),
            accounts: vec!["Assets".to_string(), "Assets:Cash".to_string()],
            debit: 100.0,
            credit: 0.0,
            meta: doc! { "clientId": 7 },
            voided: false,
            void_reason: None,
            original_journal: None,
        };

        let doc = bson::to_document(&tx).unwrap();
        assert!(doc.contains_key("_id"));
        assert_eq!(doc.get_object_id("_journal").unwrap(), journal_id);
        assert_eq!(doc.get_str("account_path").unwrap(), "Assets:Cash");
        assert_eq!(doc.get_f64("debit").unwrap(), 100.0);
        // None back-references are omitted entirely.
        assert!(!doc.contains_key("void_reason"));
        assert!(!doc.contains_key("_original_journal"));
    }

    #[test]
    fn journal_round_trips_through_bson() {
        let journal = Journal {
            id: ObjectId::new(),
            book: "test".to_string(),
            datetime: DateTime::now(),
            memo: "opening entry".to_string(),
            transactions: vec![ObjectId::new(), ObjectId::new()],
            voided: false,
            void_reason: None,
            voided_by: None,
            original_journal: None,
        };

        let doc = bson::to_document(&journal).unwrap();
        assert_eq!(doc.get_str("memo").unwrap(), "opening entry");
        assert_eq!(doc.get_array("_transactions").unwrap().len(), 2);

        let back: Journal = bson::from_document(doc).unwrap();
        assert_eq!(back.id, journal.id);
        assert_eq!(back.transactions, journal.transactions);
        assert!(!back.voided);
    }

    #[test]
    fn voided_flag_defaults_to_false_on_deserialize() {
        let doc = doc! {
            "_id": ObjectId::new(),
            "book": "test",
            "datetime": DateTime::now(),
            "memo": "m",
            "_transactions": Bson::Array(vec![]),
        };
        let journal: Journal = bson::from_document(doc).unwrap();
        assert!(!journal.voided);
        assert!(journal.void_reason.is_none());
    }

    #[test]
    fn snapshot_uses_camel_case_ttl_fields() {
        let snapshot = BalanceSnapshot {
            id: ObjectId::new(),
            book: "test".to_string(),
            account: Some("Assets".to_string()),
            meta: None,
            transaction: ObjectId::new(),
            timestamp: DateTime::now(),
            balance: 42.5,
            created_at: DateTime::now(),
            expire_at: DateTime::now(),
        };

        let doc = bson::to_document(&snapshot).unwrap();
        assert!(doc.contains_key("createdAt"));
        assert!(doc.contains_key("expireAt"));
        assert!(!doc.contains_key("meta"));
        assert_eq!(doc.get_str("account").unwrap(), "Assets");
    }
}

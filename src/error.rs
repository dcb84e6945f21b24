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

//! Error types for book and journal operations.

use bson::oid::ObjectId;
use mongodb::error::TRANSIENT_TRANSACTION_ERROR;
use thiserror::Error;

/// Ledger operation errors.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Book was constructed with invalid arguments
    #[error("invalid book configuration: {0}")]
    BookConstructor(String),

    /// Account path is empty, has empty segments, or is too deep
    #[error("invalid account path `{path}`: {reason}")]
    InvalidAccountPath { path: String, reason: String },

    /// Posting amount is negative, NaN or infinite
    #[error("invalid amount {0} (must be a non-negative finite number)")]
    InvalidAmount(f64),

    /// Journal debits and credits do not balance
    #[error("journal is unbalanced: debits and credits differ by {difference}")]
    UnbalancedJournal { difference: f64 },

    /// Entry was already committed successfully
    #[error("entry has already been committed")]
    AlreadyCommitted,

    /// Void target does not exist or belongs to another book
    #[error("journal {0} not found in this book")]
    JournalNotFound(ObjectId),

    /// Second void attempt on the same journal
    #[error("journal {0} is already voided")]
    JournalAlreadyVoided(ObjectId),

    /// Query cannot be compiled into a store filter
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Write-write conflict between concurrent store transactions;
    /// the caller is expected to retry the whole commit
    #[error("transient transaction conflict, retry the operation")]
    TransientConflict(#[source] mongodb::error::Error),

    /// Any other store error, passed through unchanged
    #[error("store error: {0}")]
    Store(#[source] mongodb::error::Error),
}

impl LedgerError {
    /// Whether the caller is expected to retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::TransientConflict(_))
    }
}

impl From<mongodb::error::Error> for LedgerError {
    fn from(err: mongodb::error::Error) -> Self {
        if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            LedgerError::TransientConflict(err)
        } else {
            LedgerError::Store(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LedgerError;
    use bson::oid::ObjectId;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            LedgerError::BookConstructor("name must be a non-empty string".into()).to_string(),
            "invalid book configuration: name must be a non-empty string"
        );
        assert_eq!(
            LedgerError::InvalidAccountPath {
                path: "A::B".into(),
                reason: "empty segment".into(),
            }
            .to_string(),
            "invalid account path `A::B`: empty segment"
        );
        assert_eq!(
            LedgerError::InvalidAmount(-1.5).to_string(),
            "invalid amount -1.5 (must be a non-negative finite number)"
        );
        assert_eq!(
            LedgerError::UnbalancedJournal { difference: 0.5 }.to_string(),
            "journal is unbalanced: debits and credits differ by 0.5"
        );
        assert_eq!(
            LedgerError::AlreadyCommitted.to_string(),
            "entry has already been committed"
        );
        assert_eq!(
            LedgerError::InvalidQuery("unparseable date `yesterday`".into()).to_string(),
            "invalid query: unparseable date `yesterday`"
        );
    }

    #[test]
    fn journal_errors_carry_the_id() {
        let id = ObjectId::new();
        assert!(
            LedgerError::JournalNotFound(id)
                .to_string()
                .contains(&id.to_hex())
        );
        assert!(
            LedgerError::JournalAlreadyVoided(id)
                .to_string()
                .contains(&id.to_hex())
        );
    }

    #[test]
    fn only_conflicts_are_transient() {
        assert!(!LedgerError::AlreadyCommitted.is_transient());
        assert!(!LedgerError::UnbalancedJournal { difference: 1.0 }.is_transient());
    }
}

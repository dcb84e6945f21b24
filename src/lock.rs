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

//! Account write-locks.
//!
//! Concurrent commits touching the same account serialize through an
//! upsert against a `(book, account)` lock document inside the store
//! transaction. The upsert creates a write-write conflict; the store
//! aborts one of the contenders with a transient error that surfaces as
//! [`LedgerError::TransientConflict`](crate::LedgerError::TransientConflict)
//! for the caller to retry.

use crate::book::Book;
use crate::LedgerError;
use bson::{doc, DateTime};
use mongodb::ClientSession;
use std::collections::BTreeSet;

/// Deduplicates and orders the accounts to lock.
///
/// Locks are always taken in lexicographic order, regardless of input
/// order, so two commits contending on an overlapping account set cannot
/// acquire them in inverted order.
pub(crate) fn lock_order<'a, I>(accounts: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let ordered: BTreeSet<&str> = accounts.into_iter().collect();
    ordered.into_iter().collect()
}

/// Upserts the lock document of every distinct account, bumping its
/// `revision` counter, within the caller's session.
pub(crate) async fn writelock_accounts(
    book: &Book,
    accounts: &[&str],
    session: &mut ClientSession,
) -> Result<(), LedgerError> {
    for account in lock_order(accounts.iter().copied()) {
        book.locks()
            .update_one(
                doc! { "book": book.name(), "account": account },
                doc! {
                    "$set": { "updatedAt": DateTime::now() },
                    "$inc": { "revision": 1i64 },
                },
            )
            .upsert(true)
            .session(&mut *session)
            .await?;
    }
    Ok(())
}

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

//! Paginated transaction listings.

use crate::book::Book;
use crate::model::Transaction;
use crate::query::Query;
use crate::LedgerError;
use bson::doc;
use futures::TryStreamExt;
use tracing::instrument;

/// One page of a ledger listing.
#[derive(Debug, Clone)]
pub struct LedgerPage {
    /// Matching transactions, newest first.
    pub results: Vec<Transaction>,
    /// Total number of transactions matching the filter, across all
    /// pages. Invariant under `page`/`per_page`.
    pub total: u64,
}

/// Lists transactions matching `query`, sorted by `(datetime desc,
/// timestamp desc)`.
///
/// With a page window set, `total` comes from a separate count of the
/// full filter; without one, `total` is the result length and no count
/// round-trip is issued.
#[instrument(name = "ledgerbook.ledger", skip(book, query), fields(book = %book.name()))]
pub(crate) async fn ledger(book: &Book, query: &Query) -> Result<LedgerPage, LedgerError> {
    let filter = query.build_filter(book.name(), book.max_account_path())?;
    let window = query.page_window();

    let mut find = book
        .transactions()
        .find(filter.clone())
        .sort(doc! { "datetime": -1, "timestamp": -1 });
    if let Some((skip, limit)) = window {
        find = find.skip(skip).limit(limit);
    }

    let results: Vec<Transaction> = find.await?.try_collect().await?;

    let total = match window {
        Some(_) => book.transactions().count_documents(filter).await?,
        None => results.len() as u64,
    };

    Ok(LedgerPage { results, total })
}

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

//! Balance aggregation with snapshot caching.
//!
//! A balance query sums `credit − debit` over every transaction matching
//! a filter. To keep that bounded regardless of history length, the
//! engine caches partial sums per `(book, account, meta)` key and only
//! aggregates the delta past the freshest snapshot (`_id` strictly
//! greater than the snapshot's last covered transaction). Snapshots are
//! refreshed opportunistically on the same request that found them stale
//! and are evicted by TTL, never invalidated by writes.

use crate::book::Book;
use crate::model::BalanceSnapshot;
use crate::query::Query;
use crate::LedgerError;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use chrono::{Duration, Utc};
use futures::TryStreamExt;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, instrument};

/// Result of a balance query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceResult {
    /// Cumulative `credit − debit`, rounded to the book's precision.
    pub balance: f64,
    /// Number of transactions aggregated past the snapshot. This is NOT
    /// the full-history transaction count; with a fresh snapshot and no
    /// new postings it is 0.
    pub notes: u64,
}

/// Rounds an aggregated balance to `precision` fractional digits,
/// midpoints away from zero, matching a decimal-string round-trip.
pub(crate) fn round_to_precision(value: f64, precision: u32) -> f64 {
    match Decimal::from_f64(value) {
        Some(decimal) => decimal
            .round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
            .to_f64()
            .unwrap_or(value),
        None => value,
    }
}

fn bson_number(value: &Bson) -> f64 {
    match value {
        Bson::Double(v) => *v,
        Bson::Int32(v) => f64::from(*v),
        Bson::Int64(v) => *v as f64,
        _ => 0.0,
    }
}

fn key_part(part: &Option<String>) -> Bson {
    match part {
        Some(value) => Bson::String(value.clone()),
        // `null` matches an absent field too, so whole-book and meta-less
        // keys look up their snapshots correctly.
        None => Bson::Null,
    }
}

#[instrument(name = "ledgerbook.balance", skip(book, query), fields(book = %book.name()))]
pub(crate) async fn balance(book: &Book, query: &Query) -> Result<BalanceResult, LedgerError> {
    let mut filter = query.build_filter(book.name(), book.max_account_path())?;
    let snapshot_sec = book.balance_snapshot_sec();
    // Date bounds and column conditions are not part of the snapshot key;
    // such queries run against full history every time.
    let snapshots_enabled = snapshot_sec > 0 && query.snapshot_scoped();

    let account_key = query.account_key();
    let meta_key = query.meta_key();

    let mut base = 0.0;
    let mut needs_refresh = snapshots_enabled;

    if snapshots_enabled {
        let best = book
            .balances()
            .find_one(doc! {
                "book": book.name(),
                "account": key_part(&account_key),
                "meta": key_part(&meta_key),
            })
            .sort(doc! { "transaction": -1 })
            .await?;

        if let Some(snapshot) = best {
            let age = Utc::now() - snapshot.created_at.to_chrono();
            needs_refresh = age >= Duration::seconds(snapshot_sec as i64);
            base = snapshot.balance;
            filter.insert("_id", doc! { "$gt": snapshot.transaction });
            debug!(snapshot = %snapshot.id, stale = needs_refresh, "balance snapshot hit");
        }
    }

    let pipeline = vec![
        doc! { "$match": filter },
        doc! { "$group": {
            "_id": Bson::Null,
            "balance": { "$sum": { "$subtract": ["$credit", "$debit"] } },
            "count": { "$sum": 1 },
            "lastTransaction": { "$last": "$_id" },
            "lastTimestamp": { "$last": "$timestamp" },
        } },
    ];

    let mut cursor = book.transactions().aggregate(pipeline).await?;
    let row: Option<Document> = cursor.try_next().await?;

    let (delta, count, last_transaction, last_timestamp) = match &row {
        Some(row) => (
            row.get("balance").map(bson_number).unwrap_or(0.0),
            row.get("count").map(bson_number).unwrap_or(0.0) as u64,
            row.get_object_id("lastTransaction").ok(),
            row.get_datetime("lastTimestamp").ok().copied(),
        ),
        None => (0.0, 0, None, None),
    };

    let total = base + round_to_precision(delta, book.precision());

    if needs_refresh && count > 0 {
        if let Some(transaction) = last_transaction {
            write_snapshot(
                book,
                account_key,
                meta_key,
                transaction,
                last_timestamp,
                total,
                snapshot_sec,
            )
            .await?;
        }
    }

    Ok(BalanceResult {
        balance: total,
        notes: count,
    })
}

async fn write_snapshot(
    book: &Book,
    account: Option<String>,
    meta: Option<String>,
    transaction: ObjectId,
    timestamp: Option<bson::DateTime>,
    balance: f64,
    snapshot_sec: u64,
) -> Result<(), LedgerError> {
    let now = Utc::now();
    let snapshot = BalanceSnapshot {
        id: ObjectId::new(),
        book: book.name().to_string(),
        account,
        meta,
        transaction,
        timestamp: timestamp.unwrap_or_else(bson::DateTime::now),
        balance,
        created_at: bson::DateTime::from_chrono(now),
        // Double TTL window, so infrequently queried keys still find a
        // warm snapshot on the next query.
        expire_at: bson::DateTime::from_chrono(now + Duration::seconds(2 * snapshot_sec as i64)),
    };
    book.balances().insert_one(&snapshot).await?;
    debug!(snapshot = %snapshot.id, "balance snapshot refreshed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{bson_number, round_to_precision};
    use bson::Bson;

    #[test]
    fn rounds_to_the_requested_digits() {
        assert_eq!(round_to_precision(100.123456789, 8), 100.12345679);
        assert_eq!(round_to_precision(100.123456789, 2), 100.12);
        assert_eq!(round_to_precision(-0.1234, 2), -0.12);
    }

    #[test]
    fn midpoints_round_away_from_zero() {
        // 2.5 and -2.5 are exactly representable in binary.
        assert_eq!(round_to_precision(2.5, 0), 3.0);
        assert_eq!(round_to_precision(-2.5, 0), -3.0);
    }

    #[test]
    fn rounding_cleans_float_summation_noise() {
        let noisy = 0.1 + 0.2; // 0.30000000000000004
        assert_eq!(round_to_precision(noisy, 8), 0.3);
    }

    #[test]
    fn rounding_is_idempotent() {
        let once = round_to_precision(123.456789012345, 8);
        assert_eq!(round_to_precision(once, 8), once);
    }

    #[test]
    fn zero_precision_rounds_to_whole_units() {
        assert_eq!(round_to_precision(99.999, 0), 100.0);
    }

    #[test]
    fn numbers_widen_from_any_bson_numeric() {
        assert_eq!(bson_number(&Bson::Double(1.5)), 1.5);
        assert_eq!(bson_number(&Bson::Int32(7)), 7.0);
        assert_eq!(bson_number(&Bson::Int64(9)), 9.0);
        assert_eq!(bson_number(&Bson::Null), 0.0);
    }
}

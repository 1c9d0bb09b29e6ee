use anyhow::{Context, Result};
use log::warn;
use num_bigint::BigInt;
use rusqlite::{params, Connection};

use crate::models::{EventKind, LedgerEvent};

/// Durable, idempotent ledger of staking events plus the TVL aggregate.
///
/// Exactly one writer exists per process; readers open their own store and get
/// a consistent snapshot from SQLite's native transaction guarantees.
pub struct LedgerStore {
    conn: Connection,
    /// Running signed aggregate, primed at open and maintained by `insert`.
    total: BigInt,
}

impl LedgerStore {
    /// Open or create the SQLite DB at path, apply the schema, and prime the
    /// running aggregate with a full rescan.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("../sql/schema.sql"))
            .context("failed to create events table")?;
        let mut store = LedgerStore {
            conn,
            total: BigInt::from(0),
        };
        store.total = store.recompute_total()?;
        Ok(store)
    }

    /// Insert an event; a duplicate tx_hash is ignored (unique constraint).
    ///
    /// Returns `Ok(true)` when a new row was written, `Ok(false)` for a
    /// deduplicated duplicate. The running total is only touched for genuinely
    /// new rows, so resent events cannot double-count.
    pub fn insert(&mut self, event: &LedgerEvent) -> Result<bool> {
        let amount: BigInt = event
            .amount
            .parse()
            .with_context(|| format!("non-decimal amount {:?} for tx {}", event.amount, event.tx_hash))?;

        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO events
                (user_address, amount, event_type, block_number, tx_hash, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.user,
                    event.amount,
                    event.kind.as_str(),
                    event.block_number as i64,
                    event.tx_hash,
                    event.timestamp,
                ],
            )
            .context("failed to insert event")?;

        if changed == 0 {
            return Ok(false);
        }
        match event.kind {
            EventKind::Deposit => self.total += &amount,
            EventKind::Withdraw => self.total -= &amount,
        }
        Ok(true)
    }

    /// Current Total Value Locked: cumulative deposits minus withdrawals.
    pub fn total_value_locked(&self) -> BigInt {
        self.total.clone()
    }

    /// Recompute the aggregate from scratch by scanning every stored row.
    /// Used to prime the running total at open; kept public as an audit path.
    pub fn recompute_total(&self) -> Result<BigInt> {
        let deposits = self.sum_amounts(EventKind::Deposit)?;
        let withdrawals = self.sum_amounts(EventKind::Withdraw)?;
        Ok(deposits - withdrawals)
    }

    /// Sum all stored amounts of one kind with arbitrary precision.
    /// Rows whose amount does not parse are skipped, not fatal.
    fn sum_amounts(&self, kind: EventKind) -> Result<BigInt> {
        let mut stmt = self
            .conn
            .prepare("SELECT amount FROM events WHERE event_type = ?1")
            .context("failed to query amounts")?;
        let rows = stmt.query_map([kind.as_str()], |row| row.get::<_, String>(0))?;

        let mut sum = BigInt::from(0);
        for row in rows {
            let raw = row.context("failed to read amount column")?;
            match raw.parse::<BigInt>() {
                Ok(amount) => sum += amount,
                Err(_) => warn!("skipping unparsable {} amount {raw:?}", kind.as_str()),
            }
        }
        Ok(sum)
    }

    #[cfg(test)]
    fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    #[cfg(test)]
    fn row_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }
}

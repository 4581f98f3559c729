use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use globalpay::client::{
    ApiClient, Billing, ClientRecord, ClientSettings, ClientStatus, PeriodCounter, Reservation,
    Tier, TierLimits, UsageCounters, UsagePeriods, BILLING_CYCLE_SECS,
};
use globalpay::money::{check_bounded, COST_DECIMALS};
use globalpay::{ClientStore, StoreError};

/// Connections kept by a file-backed store.
const POOL_SIZE: u32 = 8;

/// How long a writer waits for SQLite's write lock before giving up.
const BUSY_TIMEOUT_MS: u64 = 5_000;

const CLIENT_COLUMNS: &str = "id, name, email, tier, status, created_at, key_prefix, \
     api_key_hash, secret_hash, usage_total, month_bucket, month_count, day_bucket, day_count, \
     hour_bucket, hour_count, period_cost_micros, monthly_fee, next_billing_at, settings";

/// A client row as stored, before text columns are parsed.
struct ClientRow {
    id: String,
    name: String,
    email: String,
    tier: String,
    status: String,
    created_at: i64,
    key_prefix: String,
    api_key_hash: String,
    secret_hash: String,
    usage_total: i64,
    month: (i64, i64),
    day: (i64, i64),
    hour: (i64, i64),
    period_cost_micros: i64,
    monthly_fee: String,
    next_billing_at: i64,
    settings: String,
}

impl ClientRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            tier: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            key_prefix: row.get(6)?,
            api_key_hash: row.get(7)?,
            secret_hash: row.get(8)?,
            usage_total: row.get(9)?,
            month: (row.get(10)?, row.get(11)?),
            day: (row.get(12)?, row.get(13)?),
            hour: (row.get(14)?, row.get(15)?),
            period_cost_micros: row.get(16)?,
            monthly_fee: row.get(17)?,
            next_billing_at: row.get(18)?,
            settings: row.get(19)?,
        })
    }

    fn into_record(self, per_endpoint: BTreeMap<String, u64>) -> Result<ClientRecord, StoreError> {
        let tier = Tier::parse(&self.tier)
            .ok_or_else(|| StoreError::Backend(format!("unknown tier {:?}", self.tier)))?;
        let status = ClientStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Backend(format!("unknown status {:?}", self.status)))?;
        let settings: ClientSettings = serde_json::from_str(&self.settings).map_err(backend)?;
        let monthly_fee = Decimal::from_str_exact(&self.monthly_fee).map_err(backend)?;

        Ok(ClientRecord {
            client: ApiClient {
                id: self.id,
                name: self.name,
                email: self.email,
                tier,
                status,
                created_at: self.created_at,
                key_prefix: self.key_prefix,
                usage: UsageCounters {
                    total: self.usage_total as u64,
                    month: counter(self.month),
                    day: counter(self.day),
                    hour: counter(self.hour),
                    per_endpoint,
                },
                billing: Billing {
                    period_cost: from_micros(self.period_cost_micros),
                    monthly_fee,
                    next_billing_at: self.next_billing_at,
                },
                settings,
            },
            api_key_hash: self.api_key_hash,
            secret_hash: self.secret_hash,
        })
    }
}

fn counter((bucket, count): (i64, i64)) -> PeriodCounter {
    PeriodCounter {
        bucket,
        count: count as u64,
    }
}

/// Billing costs are stored as integer millionths so SQL can add them.
fn to_micros(cost: Decimal) -> Result<i64, StoreError> {
    let mut scaled = check_bounded(cost, COST_DECIMALS)
        .ok_or_else(|| StoreError::Backend(format!("unstorable cost {cost}")))?;
    scaled.rescale(COST_DECIMALS);
    i64::try_from(scaled.mantissa()).map_err(backend)
}

fn from_micros(micros: i64) -> Decimal {
    Decimal::new(micros, COST_DECIMALS).normalize()
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn store_error(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Duplicate;
        }
    }
    StoreError::Backend(e.to_string())
}

/// SQLite-backed client store on an r2d2 connection pool.
///
/// File databases run in WAL mode, so reads never wait for the writer and
/// calls for different clients do not queue behind a process-wide lock.
/// Counter and billing updates are SQL increments applied inside a single
/// `IMMEDIATE` transaction. `:memory:` databases use a single pooled
/// connection, since each SQLite connection would otherwise see its own
/// empty database.
#[derive(Clone)]
pub struct SqliteClientStore {
    pool: Pool<SqliteConnectionManager>,
}

impl std::fmt::Debug for SqliteClientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteClientStore")
            .field("connections", &self.pool.max_size())
            .finish_non_exhaustive()
    }
}

impl SqliteClientStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let init = |c: &mut Connection| {
            c.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
            c.execute_batch("PRAGMA synchronous = NORMAL;")
        };

        let pool = if path == ":memory:" {
            Pool::builder()
                .max_size(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .build(SqliteConnectionManager::memory().with_init(init))
        } else {
            Pool::builder()
                .max_size(POOL_SIZE)
                .build(SqliteConnectionManager::file(path).with_init(init))
        }
        .map_err(backend)?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        self.pool.get().map_err(backend)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        // Persistent for the database file; a no-op on :memory:
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))
            .map_err(store_error)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS api_clients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                tier TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                key_prefix TEXT NOT NULL,
                api_key_hash TEXT UNIQUE NOT NULL,
                secret_hash TEXT NOT NULL,
                usage_total INTEGER NOT NULL DEFAULT 0,
                month_bucket INTEGER NOT NULL DEFAULT 0,
                month_count INTEGER NOT NULL DEFAULT 0,
                day_bucket INTEGER NOT NULL DEFAULT 0,
                day_count INTEGER NOT NULL DEFAULT 0,
                hour_bucket INTEGER NOT NULL DEFAULT 0,
                hour_count INTEGER NOT NULL DEFAULT 0,
                period_cost_micros INTEGER NOT NULL DEFAULT 0,
                monthly_fee TEXT NOT NULL DEFAULT '0',
                next_billing_at INTEGER NOT NULL,
                settings TEXT NOT NULL DEFAULT '{}',
                in_flight INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_api_clients_created ON api_clients(created_at);

            CREATE TABLE IF NOT EXISTS client_endpoint_usage (
                client_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (client_id, endpoint)
            );
            "#,
        )
        .map_err(store_error)?;

        // Reservations belong to calls of a previous process
        conn.execute("UPDATE api_clients SET in_flight = 0 WHERE in_flight != 0", [])
            .map_err(store_error)?;

        Ok(())
    }

    fn endpoint_usage(conn: &Connection, id: &str) -> Result<BTreeMap<String, u64>, StoreError> {
        let mut stmt = conn
            .prepare_cached("SELECT endpoint, count FROM client_endpoint_usage WHERE client_id = ?1")
            .map_err(store_error)?;
        let rows = stmt
            .query_map(params![id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(store_error)?;
        rows.map(|r| r.map(|(endpoint, count)| (endpoint, count as u64)).map_err(store_error))
            .collect()
    }

    fn query_one(
        conn: &Connection,
        filter: &str,
        value: &str,
    ) -> Result<Option<ClientRecord>, StoreError> {
        let sql = format!("SELECT {CLIENT_COLUMNS} FROM api_clients WHERE {filter} = ?1");
        let Some(row) = conn
            .query_row(&sql, params![value], ClientRow::from_row)
            .optional()
            .map_err(store_error)?
        else {
            return Ok(None);
        };
        let per_endpoint = Self::endpoint_usage(conn, &row.id)?;
        row.into_record(per_endpoint).map(Some)
    }

    /// Read one client from a consistent snapshot.
    fn read_one(&self, filter: &str, value: &str) -> Result<Option<ClientRecord>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(store_error)?;
        let record = Self::query_one(&tx, filter, value)?;
        tx.commit().map_err(store_error)?;
        Ok(record)
    }

    fn require(conn: &Connection, id: &str) -> Result<ApiClient, StoreError> {
        Self::query_one(conn, "id", id)?
            .map(|r| r.client)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Run one write and return the client as it stands afterwards.
    fn update_one(
        &self,
        id: &str,
        write: impl FnOnce(&Connection) -> rusqlite::Result<usize>,
    ) -> Result<ApiClient, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_error)?;
        if write(&*tx).map_err(store_error)? == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let client = Self::require(&tx, id)?;
        tx.commit().map_err(store_error)?;
        Ok(client)
    }
}

impl ClientStore for SqliteClientStore {
    fn insert(&self, record: ClientRecord) -> Result<(), StoreError> {
        let c = &record.client;
        let settings = serde_json::to_string(&c.settings).map_err(backend)?;
        let period_cost = to_micros(c.billing.period_cost)?;

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_error)?;
        tx.execute(
            &format!(
                "INSERT INTO api_clients ({CLIENT_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                c.id,
                c.name,
                c.email,
                c.tier.as_str(),
                c.status.as_str(),
                c.created_at,
                c.key_prefix,
                record.api_key_hash,
                record.secret_hash,
                c.usage.total as i64,
                c.usage.month.bucket,
                c.usage.month.count as i64,
                c.usage.day.bucket,
                c.usage.day.count as i64,
                c.usage.hour.bucket,
                c.usage.hour.count as i64,
                period_cost,
                c.billing.monthly_fee.to_string(),
                c.billing.next_billing_at,
                settings,
            ],
        )
        .map_err(store_error)?;
        for (endpoint, count) in &c.usage.per_endpoint {
            tx.execute(
                "INSERT INTO client_endpoint_usage (client_id, endpoint, count) VALUES (?1, ?2, ?3)",
                params![c.id, endpoint, *count as i64],
            )
            .map_err(store_error)?;
        }
        tx.commit().map_err(store_error)?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ClientRecord>, StoreError> {
        self.read_one("id", id)
    }

    fn find_by_key_hash(&self, api_key_hash: &str) -> Result<Option<ClientRecord>, StoreError> {
        self.read_one("api_key_hash", api_key_hash)
    }

    fn set_status(&self, id: &str, status: ClientStatus) -> Result<ApiClient, StoreError> {
        self.update_one(id, |conn| {
            conn.execute(
                "UPDATE api_clients SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
        })
    }

    fn replace_key(
        &self,
        id: &str,
        api_key_hash: &str,
        key_prefix: &str,
    ) -> Result<ApiClient, StoreError> {
        self.update_one(id, |conn| {
            conn.execute(
                "UPDATE api_clients SET api_key_hash = ?1, key_prefix = ?2 WHERE id = ?3",
                params![api_key_hash, key_prefix, id],
            )
        })
    }

    fn update_settings(&self, id: &str, settings: ClientSettings) -> Result<ApiClient, StoreError> {
        let encoded = serde_json::to_string(&settings).map_err(backend)?;
        self.update_one(id, |conn| {
            conn.execute(
                "UPDATE api_clients SET settings = ?1 WHERE id = ?2",
                params![encoded, id],
            )
        })
    }

    fn reserve_call(
        &self,
        id: &str,
        limits: &TierLimits,
        periods: &UsagePeriods,
    ) -> Result<Reservation, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_error)?;

        let (usage, in_flight) = tx
            .query_row(
                "SELECT hour_bucket, hour_count, day_bucket, day_count, month_bucket, month_count, \
                 in_flight FROM api_clients WHERE id = ?1",
                params![id],
                |row| {
                    let usage = UsageCounters {
                        hour: counter((row.get(0)?, row.get(1)?)),
                        day: counter((row.get(2)?, row.get(3)?)),
                        month: counter((row.get(4)?, row.get(5)?)),
                        ..UsageCounters::default()
                    };
                    Ok((usage, row.get::<_, i64>(6)? as u64))
                },
            )
            .optional()
            .map_err(store_error)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let reservation = usage.reserve(limits, periods, in_flight);
        if let Reservation::Granted { .. } = reservation {
            tx.execute(
                "UPDATE api_clients SET in_flight = in_flight + 1 WHERE id = ?1",
                params![id],
            )
            .map_err(store_error)?;
        }
        tx.commit().map_err(store_error)?;
        Ok(reservation)
    }

    fn release_call(&self, id: &str) -> Result<(), StoreError> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE api_clients SET in_flight = MAX(in_flight - 1, 0) WHERE id = ?1",
                params![id],
            )
            .map_err(store_error)?;
        if rows == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn record_usage(
        &self,
        id: &str,
        endpoint: &str,
        cost: Decimal,
        periods: &UsagePeriods,
    ) -> Result<ApiClient, StoreError> {
        let cost = to_micros(cost)?;
        self.update_one(id, |conn| {
            // SET expressions all read the row as it was before the update.
            let rows = conn.execute(
                r#"
                UPDATE api_clients SET
                    usage_total = usage_total + 1,
                    month_count = CASE WHEN month_bucket = ?1 THEN month_count + 1 ELSE 1 END,
                    month_bucket = ?1,
                    day_count = CASE WHEN day_bucket = ?2 THEN day_count + 1 ELSE 1 END,
                    day_bucket = ?2,
                    hour_count = CASE WHEN hour_bucket = ?3 THEN hour_count + 1 ELSE 1 END,
                    hour_bucket = ?3,
                    period_cost_micros = CASE WHEN next_billing_at <= ?4
                        THEN ?5 ELSE period_cost_micros + ?5 END,
                    next_billing_at = CASE WHEN next_billing_at <= ?4
                        THEN next_billing_at + ?6 * ((?4 - next_billing_at) / ?6 + 1)
                        ELSE next_billing_at END,
                    in_flight = MAX(in_flight - 1, 0)
                WHERE id = ?7
                "#,
                params![
                    periods.month,
                    periods.day,
                    periods.hour,
                    periods.now,
                    cost,
                    BILLING_CYCLE_SECS,
                    id,
                ],
            )?;
            if rows == 0 {
                return Ok(0);
            }
            conn.execute(
                "INSERT INTO client_endpoint_usage (client_id, endpoint, count) VALUES (?1, ?2, 1) \
                 ON CONFLICT (client_id, endpoint) DO UPDATE SET count = count + 1",
                params![id, endpoint],
            )?;
            Ok(rows)
        })
    }

    fn list(&self) -> Result<Vec<ApiClient>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(store_error)?;

        let mut per_endpoint: HashMap<String, BTreeMap<String, u64>> = HashMap::new();
        {
            let mut stmt = tx
                .prepare("SELECT client_id, endpoint, count FROM client_endpoint_usage")
                .map_err(store_error)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(store_error)?;
            for row in rows {
                let (client_id, endpoint, count) = row.map_err(store_error)?;
                per_endpoint
                    .entry(client_id)
                    .or_default()
                    .insert(endpoint, count as u64);
            }
        }

        let rows = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {CLIENT_COLUMNS} FROM api_clients ORDER BY created_at, id"
                ))
                .map_err(store_error)?;
            let rows = stmt
                .query_map([], ClientRow::from_row)
                .map_err(store_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_error)?;
            rows
        };
        tx.commit().map_err(store_error)?;

        rows.into_iter()
            .map(|row| {
                let usage = per_endpoint.remove(&row.id).unwrap_or_default();
                row.into_record(usage).map(|r| r.client)
            })
            .collect()
    }
}

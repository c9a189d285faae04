/// Persistent SQLite store for Telegram users, verification codes and audit trails.
use crate::error::{BotError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a verification code.
///
/// `pending -> sent -> {verified | expired | failed}`, plus `pending -> {failed | expired}`
/// for codes whose delivery never completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Sent,
    Verified,
    Expired,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Sent => "sent",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Expired => "expired",
            VerificationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(VerificationStatus::Pending),
            "sent" => Some(VerificationStatus::Sent),
            "verified" => Some(VerificationStatus::Verified),
            "expired" => Some(VerificationStatus::Expired),
            "failed" => Some(VerificationStatus::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: VerificationStatus) -> bool {
        use VerificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Sent, Verified)
                | (Sent, Expired)
                | (Sent, Failed)
        )
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for VerificationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for VerificationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        VerificationStatus::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown verification status '{raw}'").into()))
    }
}

/// Sender details as they arrive on an inbound update.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingUser {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
}

impl IncomingUser {
    /// Best human-readable name for greetings.
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name, &self.username) {
            (Some(first), Some(last), _) => format!("{first} {last}"),
            (Some(first), None, _) => first.clone(),
            (None, _, Some(username)) => format!("@{username}"),
            _ => self.telegram_id.to_string(),
        }
    }
}

/// A Telegram user the bot has seen.
#[derive(Debug, Clone)]
pub struct TelegramUser {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub account_id: Option<i64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Profile summary of an internal marketplace account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub display_name: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub completed_orders: u32,
}

fn default_role() -> String {
    "client".to_string()
}

/// A one-time login code tied to a phone number and a Telegram chat.
#[derive(Debug, Clone)]
pub struct Verification {
    pub id: i64,
    pub phone: String,
    pub code: String,
    pub telegram_id: i64,
    pub status: VerificationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Wrong guesses submitted against this code.
    pub attempts: u32,
}

impl Verification {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == VerificationStatus::Sent && self.expires_at > now
    }
}

/// One outbound message worth remembering.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageLogEntry {
    pub telegram_id: i64,
    pub message_type: String,
    pub message_id: i32,
    pub verification_id: Option<i64>,
}

const VERIFICATION_COLUMNS: &str =
    "id, phone, code, telegram_id, status, created_at, expires_at, updated_at, attempts";

/// Persistent SQLite store for the bot.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a database file at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        info!("Opened store at {:?}", path);
        Ok(store)
    }

    /// Create a fresh in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| BotError::StoragePoisoned)
    }

    /// Insert or refresh a Telegram user. The linked account and first-seen time survive.
    pub fn upsert_user(&self, user: &IncomingUser, now: DateTime<Utc>) -> Result<TelegramUser> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO telegram_users
                (telegram_id, username, first_name, last_name, language_code, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(telegram_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                language_code = excluded.language_code,
                last_seen_at = excluded.last_seen_at",
            params![
                user.telegram_id,
                user.username,
                user.first_name,
                user.last_name,
                user.language_code,
                now.timestamp_millis()
            ],
        )?;
        query_user(&conn, user.telegram_id)?
            .ok_or(BotError::Storage(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn get_user(&self, telegram_id: i64) -> Result<Option<TelegramUser>> {
        let conn = self.conn()?;
        Ok(query_user(&conn, telegram_id)?)
    }

    /// Store the account profile and link it to the Telegram user.
    pub fn link_account(&self, telegram_id: i64, account: &Account, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO accounts (id, display_name, role, rating, completed_orders)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                role = excluded.role,
                rating = excluded.rating,
                completed_orders = excluded.completed_orders",
            params![
                account.id,
                account.display_name,
                account.role,
                account.rating,
                account.completed_orders
            ],
        )?;
        tx.execute(
            "INSERT INTO telegram_users (telegram_id, account_id, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(telegram_id) DO UPDATE SET account_id = excluded.account_id",
            params![telegram_id, account.id, now.timestamp_millis()],
        )?;
        tx.commit()?;
        info!(telegram_id, account_id = account.id, "Linked Telegram user to account");
        Ok(())
    }

    pub fn linked_account(&self, telegram_id: i64) -> Result<Option<Account>> {
        let conn = self.conn()?;
        let account = conn
            .query_row(
                "SELECT a.id, a.display_name, a.role, a.rating, a.completed_orders
                 FROM telegram_users u JOIN accounts a ON a.id = u.account_id
                 WHERE u.telegram_id = ?1",
                params![telegram_id],
                |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        role: row.get(2)?,
                        rating: row.get(3)?,
                        completed_orders: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    /// Insert a new code in `pending` state, expiring `ttl` after `now`.
    pub fn create_pending(
        &self,
        phone: &str,
        code: &str,
        telegram_id: i64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Verification> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| BotError::InvalidInput(format!("code lifetime too large: {:?}", ttl)))?;
        let expires_at = now + ttl;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO verifications (phone, code, telegram_id, status, created_at, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5)",
            params![
                phone,
                code,
                telegram_id,
                VerificationStatus::Pending,
                now.timestamp_millis(),
                expires_at.timestamp_millis()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(verification_id = id, telegram_id, "Created pending verification");
        query_verification(&conn, id)?.ok_or(BotError::Storage(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Mark a delivered code as `sent`, retiring any earlier live code for the same phone.
    pub fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> Result<Verification> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let phone: String = tx.query_row(
            "SELECT phone FROM verifications WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let superseded = tx.execute(
            "UPDATE verifications SET status = ?1, updated_at = ?2
             WHERE phone = ?3 AND status = ?4 AND id != ?5",
            params![
                VerificationStatus::Expired,
                now.timestamp_millis(),
                phone,
                VerificationStatus::Sent,
                id
            ],
        )?;
        if superseded > 0 {
            debug!(verification_id = id, superseded, "Retired earlier live codes");
        }
        transition(&tx, id, VerificationStatus::Pending, VerificationStatus::Sent, now)?;
        let record = query_verification(&tx, id)?
            .ok_or(BotError::Storage(rusqlite::Error::QueryReturnedNoRows))?;
        tx.commit()?;
        Ok(record)
    }

    /// Mark a code whose delivery failed.
    pub fn mark_failed(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        transition(&conn, id, VerificationStatus::Pending, VerificationStatus::Failed, now)
    }

    pub fn get_verification(&self, id: i64) -> Result<Option<Verification>> {
        let conn = self.conn()?;
        Ok(query_verification(&conn, id)?)
    }

    /// Read-only lookup of a live (`sent`, unexpired) code sent to a Telegram user.
    pub fn find_live_code(
        &self,
        telegram_id: i64,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Verification>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {VERIFICATION_COLUMNS} FROM verifications
             WHERE telegram_id = ?1 AND code = ?2 AND status = ?3 AND expires_at > ?4
             ORDER BY id DESC LIMIT 1"
        );
        let record = conn
            .query_row(
                &sql,
                params![telegram_id, code, VerificationStatus::Sent, now.timestamp_millis()],
                verification_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Check a code submitted for a phone and consume it on match.
    ///
    /// Stale `sent` codes for the phone are written back as `expired` first,
    /// so an old code can never be replayed. A wrong guess counts against the
    /// phone's live code, which becomes `failed` after `max_attempts` misses.
    pub fn verify_code(
        &self,
        phone: &str,
        code: &str,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Option<Verification>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE verifications SET status = ?1, updated_at = ?2
             WHERE phone = ?3 AND status = ?4 AND expires_at <= ?2",
            params![
                VerificationStatus::Expired,
                now.timestamp_millis(),
                phone,
                VerificationStatus::Sent
            ],
        )?;
        let sql = format!(
            "SELECT {VERIFICATION_COLUMNS} FROM verifications
             WHERE phone = ?1 AND status = ?2"
        );
        let Some(live) = tx
            .query_row(&sql, params![phone, VerificationStatus::Sent], verification_from_row)
            .optional()?
        else {
            tx.commit()?;
            return Ok(None);
        };

        if live.code == code {
            transition(&tx, live.id, VerificationStatus::Sent, VerificationStatus::Verified, now)?;
            let verified = query_verification(&tx, live.id)?;
            tx.commit()?;
            return Ok(verified);
        }

        let attempts = live.attempts.saturating_add(1);
        tx.execute(
            "UPDATE verifications SET attempts = ?1, updated_at = ?2 WHERE id = ?3",
            params![attempts, now.timestamp_millis(), live.id],
        )?;
        if attempts >= max_attempts {
            transition(&tx, live.id, VerificationStatus::Sent, VerificationStatus::Failed, now)?;
            warn!(verification_id = live.id, attempts, "Code locked after too many wrong guesses");
        }
        tx.commit()?;
        Ok(None)
    }

    /// Write `expired` onto every pending or sent code past its expiry. Returns how many moved.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE verifications SET status = ?1, updated_at = ?2
             WHERE status IN (?3, ?4) AND expires_at <= ?2",
            params![
                VerificationStatus::Expired,
                now.timestamp_millis(),
                VerificationStatus::Pending,
                VerificationStatus::Sent
            ],
        )?;
        Ok(changed)
    }

    pub fn log_message(&self, entry: &MessageLogEntry, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO message_logs (telegram_id, message_type, message_id, verification_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.telegram_id,
                entry.message_type,
                entry.message_id,
                entry.verification_id,
                now.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn log_referral(&self, telegram_id: i64, referral_code: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO referral_logs (telegram_id, referral_code, created_at) VALUES (?1, ?2, ?3)",
            params![telegram_id, referral_code, now.timestamp_millis()],
        )?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'client',
            rating REAL,
            completed_orders INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS telegram_users (
            telegram_id INTEGER PRIMARY KEY,
            username TEXT,
            first_name TEXT,
            last_name TEXT,
            language_code TEXT,
            account_id INTEGER,
            first_seen_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS verifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            phone TEXT NOT NULL,
            code TEXT NOT NULL,
            telegram_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS referral_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            telegram_id INTEGER NOT NULL,
            referral_code TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS message_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            telegram_id INTEGER NOT NULL,
            message_type TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            verification_id INTEGER,
            created_at INTEGER NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_verifications_one_live_per_phone
            ON verifications(phone) WHERE status = 'sent';
        CREATE INDEX IF NOT EXISTS idx_verifications_chat_code
            ON verifications(telegram_id, code, status);
        CREATE INDEX IF NOT EXISTS idx_verifications_expiry
            ON verifications(status, expires_at);
        CREATE INDEX IF NOT EXISTS idx_users_account ON telegram_users(account_id);
        "#,
    )?;
    Ok(())
}

/// Move a record along one edge of the state machine, guarded on its current status.
fn transition(
    conn: &Connection,
    id: i64,
    from: VerificationStatus,
    to: VerificationStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(BotError::InvalidTransition { id, from, to });
    }
    let changed = conn.execute(
        "UPDATE verifications SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![to, now.timestamp_millis(), id, from],
    )?;
    if changed == 0 {
        let actual = query_verification(conn, id)?
            .ok_or(BotError::Storage(rusqlite::Error::QueryReturnedNoRows))?;
        return Err(BotError::InvalidTransition {
            id,
            from: actual.status,
            to,
        });
    }
    Ok(())
}

fn query_user(conn: &Connection, telegram_id: i64) -> rusqlite::Result<Option<TelegramUser>> {
    conn.query_row(
        "SELECT telegram_id, username, first_name, last_name, language_code, account_id,
                first_seen_at, last_seen_at
         FROM telegram_users WHERE telegram_id = ?1",
        params![telegram_id],
        |row| {
            Ok(TelegramUser {
                telegram_id: row.get(0)?,
                username: row.get(1)?,
                first_name: row.get(2)?,
                last_name: row.get(3)?,
                language_code: row.get(4)?,
                account_id: row.get(5)?,
                first_seen_at: timestamp(row, 6)?,
                last_seen_at: timestamp(row, 7)?,
            })
        },
    )
    .optional()
}

fn query_verification(conn: &Connection, id: i64) -> rusqlite::Result<Option<Verification>> {
    let sql = format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE id = ?1");
    conn.query_row(&sql, params![id], verification_from_row)
        .optional()
}

fn verification_from_row(row: &Row<'_>) -> rusqlite::Result<Verification> {
    Ok(Verification {
        id: row.get(0)?,
        phone: row.get(1)?,
        code: row.get(2)?,
        telegram_id: row.get(3)?,
        status: row.get(4)?,
        created_at: timestamp(row, 5)?,
        expires_at: timestamp(row, 6)?,
        updated_at: timestamp(row, 7)?,
        attempts: row.get(8)?,
    })
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

#[cfg(test)]
impl Store {
    pub fn count_users(&self) -> usize {
        let conn = self.conn().unwrap();
        conn.query_row("SELECT COUNT(*) FROM telegram_users", [], |row| row.get::<_, i64>(0))
            .unwrap() as usize
    }

    pub fn verifications_for_phone(&self, phone: &str) -> Vec<Verification> {
        let conn = self.conn().unwrap();
        let sql = format!("SELECT {VERIFICATION_COLUMNS} FROM verifications WHERE phone = ?1 ORDER BY id");
        let mut stmt = conn.prepare(&sql).unwrap();
        let rows = stmt
            .query_map(params![phone], verification_from_row)
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        rows
    }

    pub fn message_logs(&self, telegram_id: i64) -> Vec<MessageLogEntry> {
        let conn = self.conn().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT telegram_id, message_type, message_id, verification_id
                 FROM message_logs WHERE telegram_id = ?1 ORDER BY id",
            )
            .unwrap();
        let rows = stmt
            .query_map(params![telegram_id], |row| {
                Ok(MessageLogEntry {
                    telegram_id: row.get(0)?,
                    message_type: row.get(1)?,
                    message_id: row.get(2)?,
                    verification_id: row.get(3)?,
                })
            })
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        rows
    }

    pub fn referral_codes(&self, telegram_id: i64) -> Vec<String> {
        let conn = self.conn().unwrap();
        let mut stmt = conn
            .prepare("SELECT referral_code FROM referral_logs WHERE telegram_id = ?1 ORDER BY id")
            .unwrap();
        let rows = stmt
            .query_map(params![telegram_id], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tokio_test::{assert_err, assert_ok};

    const TTL: Duration = Duration::from_secs(600);

    fn user(id: i64, first_name: &str) -> IncomingUser {
        IncomingUser {
            telegram_id: id,
            username: Some(format!("user{id}")),
            first_name: Some(first_name.to_string()),
            last_name: None,
            language_code: Some("ru".to_string()),
        }
    }

    fn sent_code(store: &Store, phone: &str, code: &str, telegram_id: i64, at: DateTime<Utc>) -> Verification {
        let pending = store.create_pending(phone, code, telegram_id, at, TTL).unwrap();
        store.mark_sent(pending.id, at).unwrap()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let first = Utc::now();
        let later = first + ChronoDuration::seconds(30);

        store.upsert_user(&user(12345, "Ivan"), first).unwrap();
        let updated = store.upsert_user(&user(12345, "Ivan P."), later).unwrap();

        assert_eq!(store.count_users(), 1);
        assert_eq!(updated.first_name.as_deref(), Some("Ivan P."));
        assert_eq!(updated.first_seen_at.timestamp_millis(), first.timestamp_millis());
        assert_eq!(updated.last_seen_at.timestamp_millis(), later.timestamp_millis());
    }

    #[test]
    fn test_upsert_keeps_linked_account() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let account = Account {
            id: 7,
            display_name: "Ivan Petrov".to_string(),
            role: "freelancer".to_string(),
            rating: Some(4.8),
            completed_orders: 12,
        };

        store.upsert_user(&user(1, "Ivan"), now).unwrap();
        store.link_account(1, &account, now).unwrap();
        let refreshed = store.upsert_user(&user(1, "Ivan"), now).unwrap();

        assert_eq!(refreshed.account_id, Some(7));
        assert_eq!(store.linked_account(1).unwrap(), Some(account));
        assert_eq!(store.linked_account(2).unwrap(), None);
    }

    #[test]
    fn test_pending_code_expiry_and_status() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let record = store.create_pending("+79990000000", "123456", 12345, now, TTL).unwrap();

        assert_eq!(record.status, VerificationStatus::Pending);
        assert_eq!(
            (record.expires_at - record.created_at).num_seconds(),
            600
        );
        // Pending codes are not live yet.
        assert!(store.find_live_code(12345, "123456", now).unwrap().is_none());
    }

    #[test]
    fn test_mark_sent_retires_previous_live_code() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let first = sent_code(&store, "+79990000000", "111111", 12345, now);
        let second = sent_code(&store, "+79990000000", "222222", 12345, now);

        let records = store.verifications_for_phone("+79990000000");
        let live: Vec<_> = records.iter().filter(|r| r.status == VerificationStatus::Sent).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.id);
        assert_eq!(
            store.get_verification(first.id).unwrap().unwrap().status,
            VerificationStatus::Expired
        );
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let record = sent_code(&store, "+70000000001", "333333", 1, now);

        // Already sent, cannot be sent or failed-from-pending again.
        assert_err!(store.mark_sent(record.id, now));
        assert_err!(store.mark_failed(record.id, now));

        assert!(!VerificationStatus::Verified.can_transition_to(VerificationStatus::Sent));
        assert!(!VerificationStatus::Expired.can_transition_to(VerificationStatus::Verified));
        assert!(VerificationStatus::Pending.can_transition_to(VerificationStatus::Sent));
    }

    #[test]
    fn test_find_live_code_excludes_expired() {
        let store = Store::open_in_memory().unwrap();
        let issued = Utc::now() - ChronoDuration::minutes(11);
        sent_code(&store, "+70000000002", "444444", 55, issued);

        let now = Utc::now();
        assert!(store.find_live_code(55, "444444", now).unwrap().is_none());
        // Still within the window when looked at from the past.
        assert!(store
            .find_live_code(55, "444444", issued + ChronoDuration::minutes(5))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_find_live_code_scoped_to_chat() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        sent_code(&store, "+70000000003", "555555", 1, now);

        assert!(store.find_live_code(1, "555555", now).unwrap().is_some());
        assert!(store.find_live_code(2, "555555", now).unwrap().is_none());
        assert!(store.find_live_code(1, "555556", now).unwrap().is_none());
    }

    #[test]
    fn test_verify_code_consumes_once() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let record = sent_code(&store, "+70000000004", "666666", 9, now);

        let verified = store.verify_code("+70000000004", "666666", now, 5).unwrap().unwrap();
        assert_eq!(verified.id, record.id);
        assert_eq!(verified.status, VerificationStatus::Verified);
        assert!(store.verify_code("+70000000004", "666666", now, 5).unwrap().is_none());
    }

    #[test]
    fn test_verify_code_locks_after_wrong_guesses() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let record = sent_code(&store, "+70000000007", "121212", 9, now);

        for guess in ["000001", "000002"] {
            assert!(store.verify_code("+70000000007", guess, now, 3).unwrap().is_none());
        }
        let counted = store.get_verification(record.id).unwrap().unwrap();
        assert_eq!(counted.attempts, 2);
        assert_eq!(counted.status, VerificationStatus::Sent);

        assert!(store.verify_code("+70000000007", "000003", now, 3).unwrap().is_none());
        assert_eq!(
            store.get_verification(record.id).unwrap().unwrap().status,
            VerificationStatus::Failed
        );
        // The right code no longer works once the record is locked.
        assert!(store.verify_code("+70000000007", "121212", now, 3).unwrap().is_none());
    }

    #[test]
    fn test_verify_code_right_guess_after_misses() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        sent_code(&store, "+70000000008", "343434", 9, now);

        assert!(store.verify_code("+70000000008", "999999", now, 3).unwrap().is_none());
        let verified = store.verify_code("+70000000008", "343434", now, 3).unwrap().unwrap();
        assert_eq!(verified.status, VerificationStatus::Verified);
        assert_eq!(verified.attempts, 1);
    }

    #[test]
    fn test_verify_code_expires_stale_on_read() {
        let store = Store::open_in_memory().unwrap();
        let issued = Utc::now() - ChronoDuration::minutes(20);
        let record = sent_code(&store, "+70000000005", "777777", 9, issued);

        assert!(store.verify_code("+70000000005", "777777", Utc::now(), 5).unwrap().is_none());
        assert_eq!(
            store.get_verification(record.id).unwrap().unwrap().status,
            VerificationStatus::Expired
        );
    }

    #[test]
    fn test_expire_stale_sweep() {
        let store = Store::open_in_memory().unwrap();
        let old = Utc::now() - ChronoDuration::minutes(30);
        sent_code(&store, "+70000000006", "888888", 3, old);
        store.create_pending("+70000000007", "999999", 3, old, TTL).unwrap();
        let fresh = sent_code(&store, "+70000000008", "000001", 3, Utc::now());

        assert_eq!(store.expire_stale(Utc::now()).unwrap(), 2);
        assert_eq!(
            store.get_verification(fresh.id).unwrap().unwrap().status,
            VerificationStatus::Sent
        );
        assert_eq!(store.expire_stale(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn test_logs_append() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let entry = MessageLogEntry {
            telegram_id: 4,
            message_type: "verification_code".to_string(),
            message_id: 99,
            verification_id: Some(1),
        };
        assert_ok!(store.log_message(&entry, now));
        assert_ok!(store.log_message(&entry, now));
        assert_ok!(store.log_referral(4, "ref-abc", now));

        assert_eq!(store.message_logs(4), vec![entry.clone(), entry]);
        assert_eq!(store.referral_codes(4), vec!["ref-abc".to_string()]);
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.db");
        let now = Utc::now();
        {
            let store = Store::open(&path).unwrap();
            store.upsert_user(&user(77, "Anna"), now).unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        let found = reopened.get_user(77).unwrap().unwrap();
        assert_eq!(found.first_name.as_deref(), Some("Anna"));
    }

    #[test]
    fn test_display_name() {
        let mut u = user(5, "Anna");
        assert_eq!(u.display_name(), "Anna");
        u.last_name = Some("Smirnova".to_string());
        assert_eq!(u.display_name(), "Anna Smirnova");
        u.first_name = None;
        assert_eq!(u.display_name(), "@user5");
    }
}

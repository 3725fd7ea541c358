//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::repository::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const TARGET_COLUMNS: &str = "id, name, target_type, url, hostname, port, method, headers, body, \
     expected_status, accepted_status_codes, keyword, keyword_mode, dns_record_type, ssl_warn_days, \
     push_token, push_interval_seconds, interval_seconds, timeout_ms, retries, degraded_threshold_ms, \
     max_redirects, auth_user, auth_pass, active";

const OUTCOME_COLUMNS: &str =
    "target_id, status, response_time_ms, status_code, error_message, metadata, time";

const INCIDENT_COLUMNS: &str =
    "id, target_id, title, incident_type, status, started_at, resolved_at";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Throwaway in-memory store.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database schema. Safe to run on every start.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Target CRUD ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (name, target_type, url, hostname, port, method, headers, body, \
             expected_status, accepted_status_codes, keyword, keyword_mode, dns_record_type, ssl_warn_days, \
             push_token, push_interval_seconds, interval_seconds, timeout_ms, retries, degraded_threshold_ms, \
             max_redirects, auth_user, auth_pass, active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                target.name,
                target.target_type,
                target.url,
                target.hostname,
                target.port,
                target.method,
                target.headers,
                target.body,
                target.expected_status,
                target.accepted_status_codes,
                target.keyword,
                target.keyword_mode,
                target.dns_record_type,
                target.ssl_warn_days,
                target.push_token,
                target.push_interval_seconds,
                target.interval_seconds,
                target.timeout_ms,
                target.retries,
                target.degraded_threshold_ms,
                target.max_redirects,
                target.auth_user,
                target.auth_pass,
                target.active,
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Update an existing target.
    pub fn update_target(&self, target: &Target) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE targets SET name=?1, target_type=?2, url=?3, hostname=?4, port=?5, method=?6, headers=?7, \
             body=?8, expected_status=?9, accepted_status_codes=?10, keyword=?11, keyword_mode=?12, \
             dns_record_type=?13, ssl_warn_days=?14, push_token=?15, push_interval_seconds=?16, \
             interval_seconds=?17, timeout_ms=?18, retries=?19, degraded_threshold_ms=?20, max_redirects=?21, \
             auth_user=?22, auth_pass=?23, active=?24 WHERE id=?25",
            params![
                target.name,
                target.target_type,
                target.url,
                target.hostname,
                target.port,
                target.method,
                target.headers,
                target.body,
                target.expected_status,
                target.accepted_status_codes,
                target.keyword,
                target.keyword_mode,
                target.dns_record_type,
                target.ssl_warn_days,
                target.push_token,
                target.push_interval_seconds,
                target.interval_seconds,
                target.timeout_ms,
                target.retries,
                target.degraded_threshold_ms,
                target.max_redirects,
                target.auth_user,
                target.auth_pass,
                target.active,
                target.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Pause or resume a target.
    pub fn set_target_active(&self, id: i64, active: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("UPDATE targets SET active = ?1 WHERE id = ?2", params![active, id])?;
        Ok(())
    }

    /// Get all targets.
    pub fn list_targets(&self) -> Result<Vec<Target>, DbError> {
        self.query_targets("1 = 1", [])
    }

    /// Delete a target with its outcomes, incidents and links.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn query_targets<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE {} ORDER BY id",
            TARGET_COLUMNS, filter
        ))?;
        let targets = stmt
            .query_map(params, target_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(targets)
    }

    // --- Notification channels ---

    /// Add a channel and return its ID.
    pub fn add_channel(&self, channel: &mut NotificationChannel) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notification_channels (name, channel_type, config, active) VALUES (?1, ?2, ?3, ?4)",
            params![
                channel.name,
                channel.channel_type,
                channel.config.to_string(),
                channel.active,
            ],
        )?;
        channel.id = conn.last_insert_rowid();
        Ok(channel.id)
    }

    /// Link a channel to a target. Linking twice is a no-op.
    pub fn link_channel(&self, target_id: i64, channel_id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO target_channels (target_id, channel_id) VALUES (?1, ?2)",
            params![target_id, channel_id],
        )?;
        Ok(())
    }

    // --- Maintenance ---

    /// Add a maintenance window and return its ID.
    pub fn add_maintenance_window(&self, window: &mut MaintenanceWindow) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO maintenance_windows (target_id, title, start_time, end_time, active) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                window.target_id,
                window.title,
                format_db_time(&window.start_time),
                format_db_time(&window.end_time),
                window.active,
            ],
        )?;
        window.id = conn.last_insert_rowid();
        Ok(window.id)
    }

    pub fn set_maintenance_active(&self, id: i64, active: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE maintenance_windows SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(())
    }

    // --- Incidents ---

    /// Update trail of an incident, oldest first.
    pub fn incident_updates(&self, incident_id: i64) -> Result<Vec<IncidentUpdate>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, status, message, time FROM incident_updates \
             WHERE incident_id = ?1 ORDER BY time ASC, id ASC",
        )?;
        let updates = stmt
            .query_map(params![incident_id], |row| {
                Ok(IncidentUpdate {
                    id: row.get(0)?,
                    incident_id: row.get(1)?,
                    status: row.get(2)?,
                    message: row.get(3)?,
                    time: time_column(row, 4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(updates)
    }

    /// Every incident recorded against a target, newest first.
    pub fn incidents_for_target(&self, target_id: i64) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incidents WHERE target_id = ?1 ORDER BY started_at DESC, id DESC",
            INCIDENT_COLUMNS
        ))?;
        let incidents = stmt
            .query_map(params![target_id], incident_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(incidents)
    }
}

impl TargetStore for Store {
    fn get_target(&self, id: i64) -> Result<Option<Target>, DbError> {
        let conn = self.conn()?;
        let target = conn
            .query_row(
                &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
                params![id],
                target_from_row,
            )
            .optional()?;
        Ok(target)
    }

    fn list_active_targets(&self) -> Result<Vec<Target>, DbError> {
        self.query_targets("active = 1", [])
    }

    fn list_active_push_targets(&self) -> Result<Vec<Target>, DbError> {
        self.query_targets("active = 1 AND target_type = ?1", params![TargetType::Push])
    }

    fn find_by_push_token(&self, token: &str) -> Result<Option<Target>, DbError> {
        if token.is_empty() {
            return Ok(None);
        }
        let conn = self.conn()?;
        let target = conn
            .query_row(
                &format!(
                    "SELECT {} FROM targets WHERE push_token = ?1 AND target_type = ?2",
                    TARGET_COLUMNS
                ),
                params![token, TargetType::Push],
                target_from_row,
            )
            .optional()?;
        Ok(target)
    }
}

impl OutcomeStore for Store {
    fn append_outcome(&self, outcome: &CheckOutcome) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO check_outcomes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                OUTCOME_COLUMNS
            ),
            params![
                outcome.target_id,
                outcome.status,
                outcome.response_time_ms,
                outcome.status_code,
                outcome.error_message,
                outcome.metadata.to_string(),
                format_db_time(&outcome.time),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn latest_outcome(&self, target_id: i64) -> Result<Option<CheckOutcome>, DbError> {
        Ok(self.recent_outcomes(target_id, 1)?.into_iter().next())
    }

    fn recent_outcomes(&self, target_id: i64, limit: usize) -> Result<Vec<CheckOutcome>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM check_outcomes WHERE target_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
            OUTCOME_COLUMNS
        ))?;
        let outcomes = stmt
            .query_map(params![target_id, limit as i64], outcome_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(outcomes)
    }
}

impl IncidentStore for Store {
    fn create_incident(&self, incident: &NewIncident) -> Result<Incident, DbError> {
        let started_at = Utc::now();
        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO incidents (target_id, title, incident_type, status, started_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    incident.target_id,
                    incident.title,
                    incident.incident_type,
                    IncidentStatus::Investigating,
                    format_db_time(&started_at),
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.get_incident(id)?.ok_or(DbError::NotFound)
    }

    fn append_update(
        &self,
        incident_id: i64,
        status: IncidentStatus,
        message: &str,
    ) -> Result<IncidentUpdate, DbError> {
        let time = Utc::now();
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO incident_updates (incident_id, status, message, time) VALUES (?1, ?2, ?3, ?4)",
            params![incident_id, status, message, format_db_time(&time)],
        )?;
        let id = tx.last_insert_rowid();
        let changed = tx.execute(
            "UPDATE incidents SET status = ?1 WHERE id = ?2",
            params![status, incident_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        tx.commit()?;

        Ok(IncidentUpdate {
            id,
            incident_id,
            status,
            message: message.to_string(),
            time,
        })
    }

    fn find_unresolved_auto(&self, target_id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(
                &format!(
                    "SELECT {} FROM incidents WHERE target_id = ?1 AND incident_type = ?2 AND status != ?3 \
                     ORDER BY started_at DESC, id DESC LIMIT 1",
                    INCIDENT_COLUMNS
                ),
                params![target_id, IncidentType::Auto, IncidentStatus::Resolved],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    fn resolve(&self, incident_id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE incidents SET status = ?1, resolved_at = COALESCE(resolved_at, ?2) WHERE id = ?3",
            params![IncidentStatus::Resolved, format_db_time(&Utc::now()), incident_id],
        )?;
        Ok(())
    }

    fn get_incident(&self, incident_id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(
                &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
                params![incident_id],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }
}

impl MaintenanceStore for Store {
    fn is_under_maintenance(&self, target_id: i64, now: DateTime<Utc>) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let now = format_db_time(&now);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM maintenance_windows \
             WHERE active = 1 AND start_time <= ?1 AND end_time >= ?1 \
             AND (target_id IS NULL OR target_id = ?2)",
            params![now, target_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl ChannelStore for Store {
    fn channels_for_target(&self, target_id: i64) -> Result<Vec<NotificationChannel>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.channel_type, c.config, c.active \
             FROM notification_channels c JOIN target_channels tc ON tc.channel_id = c.id \
             WHERE tc.target_id = ?1 AND c.active = 1 ORDER BY c.id",
        )?;
        let channels = stmt
            .query_map(params![target_id], |row| {
                Ok(NotificationChannel {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    channel_type: row.get(2)?,
                    config: json_column(row, 3)?,
                    active: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(channels)
    }
}

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<Target> {
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        target_type: row.get(2)?,
        url: row.get(3)?,
        hostname: row.get(4)?,
        port: row.get(5)?,
        method: row.get(6)?,
        headers: row.get(7)?,
        body: row.get(8)?,
        expected_status: row.get(9)?,
        accepted_status_codes: row.get(10)?,
        keyword: row.get(11)?,
        keyword_mode: row.get(12)?,
        dns_record_type: row.get(13)?,
        ssl_warn_days: row.get(14)?,
        push_token: row.get(15)?,
        push_interval_seconds: row.get(16)?,
        interval_seconds: row.get(17)?,
        timeout_ms: row.get(18)?,
        retries: row.get(19)?,
        degraded_threshold_ms: row.get(20)?,
        max_redirects: row.get(21)?,
        auth_user: row.get(22)?,
        auth_pass: row.get(23)?,
        active: row.get(24)?,
    })
}

fn outcome_from_row(row: &Row<'_>) -> rusqlite::Result<CheckOutcome> {
    Ok(CheckOutcome {
        target_id: row.get(0)?,
        status: row.get(1)?,
        response_time_ms: row.get(2)?,
        status_code: row.get(3)?,
        error_message: row.get(4)?,
        metadata: json_column(row, 5)?,
        time: time_column(row, 6)?,
    })
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    let resolved_at: Option<String> = row.get(6)?;
    Ok(Incident {
        id: row.get(0)?,
        target_id: row.get(1)?,
        title: row.get(2)?,
        incident_type: row.get(3)?,
        status: row.get(4)?,
        started_at: time_column(row, 5)?,
        resolved_at: resolved_at.as_deref().and_then(parse_db_time),
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_db_time(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unparsable timestamp {:?}", text).into(),
        )
    })
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn format_db_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_target_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        // Create
        let mut target = Target {
            name: "Test".to_string(),
            target_type: TargetType::Tcp,
            hostname: "example.com".to_string(),
            port: 443,
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();
        assert!(id > 0);

        // Read
        let fetched = store.get_target(id).unwrap().unwrap();
        assert_eq!(fetched.name, "Test");
        assert_eq!(fetched.target_type, TargetType::Tcp);
        assert_eq!(fetched.port, 443);

        // Update
        let mut updated = fetched;
        updated.name = "Updated".to_string();
        store.update_target(&updated).unwrap();
        assert_eq!(store.get_target(id).unwrap().unwrap().name, "Updated");

        // Pause
        store.set_target_active(id, false).unwrap();
        assert!(store.list_active_targets().unwrap().is_empty());

        // Delete
        store.delete_target(id).unwrap();
        assert!(store.get_target(id).unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_schema_and_rows() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            let mut target = Target { name: "kept".to_string(), ..Default::default() };
            store.add_target(&mut target).unwrap();
        }
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(store.list_targets().unwrap().len(), 1);
    }

    #[test]
    fn test_push_token_lookup() {
        let store = Store::open_in_memory().unwrap();
        let mut push = Target {
            name: "cron".to_string(),
            target_type: TargetType::Push,
            push_token: "abc123".to_string(),
            ..Default::default()
        };
        store.add_target(&mut push).unwrap();

        assert_eq!(store.find_by_push_token("abc123").unwrap().unwrap().id, push.id);
        assert!(store.find_by_push_token("nope").unwrap().is_none());
        assert!(store.find_by_push_token("").unwrap().is_none());
        assert_eq!(store.list_active_push_targets().unwrap().len(), 1);
    }

    #[test]
    fn test_outcomes_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let mut target = Target { name: "web".to_string(), ..Default::default() };
        store.add_target(&mut target).unwrap();

        let base = Utc::now();
        for (i, status) in [CheckStatus::Up, CheckStatus::Degraded, CheckStatus::Down]
            .into_iter()
            .enumerate()
        {
            let outcome = CheckOutcome::new(target.id, status)
                .with_metadata(serde_json::json!({ "seq": i }))
                .with_time(base + ChronoDuration::seconds(i as i64));
            store.append_outcome(&outcome).unwrap();
        }

        let recent = store.recent_outcomes(target.id, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status, CheckStatus::Down);
        assert_eq!(recent[1].status, CheckStatus::Degraded);
        assert_eq!(recent[1].metadata["seq"], 1);

        let latest = store.latest_outcome(target.id).unwrap().unwrap();
        assert_eq!(latest.status, CheckStatus::Down);
    }

    #[test]
    fn test_incident_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let mut target = Target { name: "api".to_string(), ..Default::default() };
        store.add_target(&mut target).unwrap();

        let incident = store
            .create_incident(&NewIncident {
                target_id: Some(target.id),
                title: "api is down".to_string(),
                incident_type: IncidentType::Auto,
            })
            .unwrap();
        assert_eq!(incident.status, IncidentStatus::Investigating);
        assert!(incident.resolved_at.is_none());

        store
            .append_update(incident.id, IncidentStatus::Identified, "bad deploy")
            .unwrap();
        let open = store.find_unresolved_auto(target.id).unwrap().unwrap();
        assert_eq!(open.status, IncidentStatus::Identified);

        store
            .append_update(incident.id, IncidentStatus::Resolved, "rolled back")
            .unwrap();
        store.resolve(incident.id).unwrap();

        assert!(store.find_unresolved_auto(target.id).unwrap().is_none());
        let resolved = store.get_incident(incident.id).unwrap().unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        let updates = store.incident_updates(incident.id).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates.last().unwrap().status, resolved.status);
    }

    #[test]
    fn test_manual_incident_not_found_as_auto() {
        let store = Store::open_in_memory().unwrap();
        let mut target = Target { name: "db".to_string(), ..Default::default() };
        store.add_target(&mut target).unwrap();

        store
            .create_incident(&NewIncident {
                target_id: Some(target.id),
                title: "planned".to_string(),
                incident_type: IncidentType::Manual,
            })
            .unwrap();
        assert!(store.find_unresolved_auto(target.id).unwrap().is_none());
    }

    #[test]
    fn test_maintenance_lookup() {
        let store = Store::open_in_memory().unwrap();
        let mut a = Target { name: "a".to_string(), ..Default::default() };
        let mut b = Target { name: "b".to_string(), ..Default::default() };
        store.add_target(&mut a).unwrap();
        store.add_target(&mut b).unwrap();

        let now = Utc::now();
        let mut window = MaintenanceWindow {
            id: 0,
            target_id: Some(a.id),
            title: "patching".to_string(),
            start_time: now - ChronoDuration::minutes(10),
            end_time: now + ChronoDuration::minutes(10),
            active: true,
        };
        store.add_maintenance_window(&mut window).unwrap();

        assert!(store.is_under_maintenance(a.id, now).unwrap());
        assert!(!store.is_under_maintenance(b.id, now).unwrap());
        assert!(!store
            .is_under_maintenance(a.id, now + ChronoDuration::minutes(11))
            .unwrap());

        store.set_maintenance_active(window.id, false).unwrap();
        assert!(!store.is_under_maintenance(a.id, now).unwrap());
    }

    #[test]
    fn test_channels_for_target_skips_inactive() {
        let store = Store::open_in_memory().unwrap();
        let mut target = Target { name: "t".to_string(), ..Default::default() };
        store.add_target(&mut target).unwrap();

        let mut hook = NotificationChannel {
            id: 0,
            name: "hook".to_string(),
            channel_type: "webhook".to_string(),
            config: serde_json::json!({ "url": "http://127.0.0.1:9/hook" }),
            active: true,
        };
        let mut muted = NotificationChannel {
            name: "muted".to_string(),
            active: false,
            ..hook.clone()
        };
        store.add_channel(&mut hook).unwrap();
        store.add_channel(&mut muted).unwrap();
        store.link_channel(target.id, hook.id).unwrap();
        store.link_channel(target.id, hook.id).unwrap();
        store.link_channel(target.id, muted.id).unwrap();

        let channels = store.channels_for_target(target.id).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "hook");
        assert_eq!(channels[0].config["url"], "http://127.0.0.1:9/hook");
    }

    #[test]
    fn test_parse_db_time_formats() {
        assert!(parse_db_time("2024-03-01 10:00:00").is_some());
        assert!(parse_db_time("2024-03-01 10:00:00.123456789").is_some());
        assert!(parse_db_time("2024-03-01T10:00:00Z").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}

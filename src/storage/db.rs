use rusqlite::{params, Connection, OptionalExtension, Row};
use crate::{
    error::{DonationError, Result},
    storage::models::{
        DonationSettings, Donation, DownloadCount, OutboxEmail, SettingsUpdate, User,
    },
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(path: &str) -> Result<Self> {
        Self::with_busy_timeout(path, Duration::from_millis(5000))
    }

    /// Overlapping runs wait up to `busy_timeout` for each other's writes
    pub fn with_busy_timeout(path: &str, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let db = Self { conn };
        db.init_schema()?;
        debug!("Database opened at {}", path);
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Self { conn: Connection::open_in_memory()? };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL,
                num_sounds INTEGER NOT NULL DEFAULT 0,
                last_donation_email_sent TEXT
            );

            CREATE TABLE IF NOT EXISTS donations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                amount REAL NOT NULL DEFAULT 0,
                created TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                created TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS donation_email_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                minimum_days_since_last_donation INTEGER NOT NULL,
                minimum_days_since_last_donation_email INTEGER NOT NULL,
                downloads_in_period INTEGER NOT NULL,
                never_send_email_to_uploaders INTEGER NOT NULL,
                recent_donation_days INTEGER
            );

            CREATE TABLE IF NOT EXISTS email_outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                to_address TEXT NOT NULL,
                from_address TEXT,
                subject TEXT NOT NULL,
                template TEXT NOT NULL,
                context TEXT NOT NULL,
                created TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_donations_user_created ON donations(user_id, created);
            CREATE INDEX IF NOT EXISTS idx_downloads_created_user ON downloads(created, user_id);
            CREATE INDEX IF NOT EXISTS idx_downloads_user_created ON downloads(user_id, created);",
        )?;
        Ok(())
    }

    // -- Settings --

    pub fn get_or_create_settings(&self) -> Result<DonationSettings> {
        let defaults = DonationSettings::default();
        let created = self.conn.execute(
            "INSERT OR IGNORE INTO donation_email_settings
             (id, minimum_days_since_last_donation, minimum_days_since_last_donation_email,
              downloads_in_period, never_send_email_to_uploaders, recent_donation_days)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                defaults.minimum_days_since_last_donation,
                defaults.minimum_days_since_last_donation_email,
                defaults.downloads_in_period,
                defaults.never_send_email_to_uploaders,
                defaults.recent_donation_days,
            ],
        )?;
        if created > 0 {
            info!("Created donation email settings with defaults");
        }

        let settings = self.conn.query_row(
            "SELECT minimum_days_since_last_donation, minimum_days_since_last_donation_email,
                    downloads_in_period, never_send_email_to_uploaders, recent_donation_days
             FROM donation_email_settings WHERE id = 1",
            [],
            |row| {
                Ok(DonationSettings {
                    minimum_days_since_last_donation: row.get(0)?,
                    minimum_days_since_last_donation_email: row.get(1)?,
                    downloads_in_period: row.get(2)?,
                    never_send_email_to_uploaders: row.get(3)?,
                    recent_donation_days: row.get(4)?,
                })
            },
        )?;
        Ok(settings)
    }

    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<DonationSettings> {
        let mut settings = self.get_or_create_settings()?;
        update.apply(&mut settings);
        validate_settings(&settings)?;

        self.conn.execute(
            "UPDATE donation_email_settings
             SET minimum_days_since_last_donation = ?1,
                 minimum_days_since_last_donation_email = ?2,
                 downloads_in_period = ?3,
                 never_send_email_to_uploaders = ?4,
                 recent_donation_days = ?5
             WHERE id = 1",
            params![
                settings.minimum_days_since_last_donation,
                settings.minimum_days_since_last_donation_email,
                settings.downloads_in_period,
                settings.never_send_email_to_uploaders,
                settings.recent_donation_days,
            ],
        )?;
        Ok(settings)
    }

    // -- Users --

    pub fn insert_user(&self, username: &str, email: &str, num_sounds: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO users (username, email, num_sounds) VALUES (?1, ?2, ?3)",
            params![username, email, num_sounds],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = self.conn
            .query_row(
                "SELECT id, username, email, num_sounds, last_donation_email_sent
                 FROM users WHERE id = ?1",
                [id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn require_user(&self, id: i64) -> Result<User> {
        self.get_user(id)?.ok_or(DonationError::UserNotFound(id))
    }

    pub fn set_last_donation_email_sent(&self, id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        self.conn.execute(
            "UPDATE users SET last_donation_email_sent = ?1 WHERE id = ?2",
            params![at.as_ref().map(encode_timestamp), id],
        )?;
        Ok(())
    }

    // -- Donations & downloads --

    pub fn insert_donation(&self, user_id: Option<i64>, amount: f64, created: DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO donations (user_id, amount, created) VALUES (?1, ?2, ?3)",
            params![user_id, amount, encode_timestamp(&created)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_download(&self, user_id: i64, created: DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO downloads (user_id, created) VALUES (?1, ?2)",
            params![user_id, encode_timestamp(&created)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // -- Reminder pass queries --

    /// Donors with a donation at or before `cutoff` who were not emailed after it,
    /// one entry per user in order of their earliest such donation.
    pub fn reminder_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.user_id
             FROM donations d
             JOIN users u ON u.id = d.user_id
             WHERE d.user_id IS NOT NULL
               AND d.created <= ?1
               AND (u.last_donation_email_sent IS NULL OR u.last_donation_email_sent <= ?1)
             GROUP BY d.user_id
             ORDER BY MIN(d.id)",
        )?;

        let users = stmt.query_map([encode_timestamp(&cutoff)], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(users)
    }

    pub fn has_donation_after(&self, user_id: i64, cutoff: DateTime<Utc>) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM donations WHERE user_id = ?1 AND created > ?2)",
            params![user_id, encode_timestamp(&cutoff)],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // -- Solicitation pass queries --

    /// Download counts since `email_cutoff` per user, leaving out users emailed
    /// after `email_cutoff` and users who donated after `recent_donor_cutoff`.
    /// Ascending by count.
    pub fn solicitation_candidates(
        &self,
        email_cutoff: DateTime<Utc>,
        recent_donor_cutoff: DateTime<Utc>,
    ) -> Result<Vec<DownloadCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT dl.user_id, COUNT(*) AS num_download
             FROM downloads dl
             JOIN users u ON u.id = dl.user_id
             WHERE dl.created >= ?1
               AND (u.last_donation_email_sent IS NULL OR u.last_donation_email_sent <= ?1)
               AND dl.user_id NOT IN (
                   SELECT user_id FROM donations
                   WHERE user_id IS NOT NULL AND created > ?2
               )
             GROUP BY dl.user_id
             ORDER BY num_download ASC, dl.user_id ASC",
        )?;

        let counts = stmt.query_map(
            params![encode_timestamp(&email_cutoff), encode_timestamp(&recent_donor_cutoff)],
            |row| {
                Ok(DownloadCount {
                    user_id: row.get(0)?,
                    downloads: row.get(1)?,
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    pub fn latest_donation_after(&self, user_id: i64, cutoff: DateTime<Utc>) -> Result<Option<Donation>> {
        let donation = self.conn
            .query_row(
                "SELECT id, user_id, amount, created FROM donations
                 WHERE user_id = ?1 AND created > ?2
                 ORDER BY created DESC, id DESC
                 LIMIT 1",
                params![user_id, encode_timestamp(&cutoff)],
                |row| {
                    Ok(Donation {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        amount: row.get(2)?,
                        created: timestamp_column(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(donation)
    }

    pub fn count_downloads_since(&self, user_id: i64, start: DateTime<Utc>) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE user_id = ?1 AND created >= ?2",
            params![user_id, encode_timestamp(&start)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- Email stamping --

    /// Compare-and-stamp: sets `last_donation_email_sent = now` only if the
    /// stored value is still `expected` and not later than `cooldown_cutoff`.
    /// Returns whether this call won the user.
    pub fn compare_and_stamp(
        &self,
        user_id: i64,
        expected: Option<DateTime<Utc>>,
        cooldown_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if expected.is_some_and(|sent| sent > cooldown_cutoff) {
            return Ok(false);
        }

        let changed = self.conn.execute(
            "UPDATE users SET last_donation_email_sent = ?1
             WHERE id = ?2
               AND last_donation_email_sent IS ?3
               AND (last_donation_email_sent IS NULL OR last_donation_email_sent <= ?4)",
            params![
                encode_timestamp(&now),
                user_id,
                expected.as_ref().map(encode_timestamp),
                encode_timestamp(&cooldown_cutoff),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Undo a stamp written at `stamped`, unless someone else has since replaced it
    pub fn restore_stamp(
        &self,
        user_id: i64,
        stamped: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET last_donation_email_sent = ?1
             WHERE id = ?2 AND last_donation_email_sent = ?3",
            params![
                previous.as_ref().map(encode_timestamp),
                user_id,
                encode_timestamp(&stamped),
            ],
        )?;
        Ok(changed == 1)
    }

    // -- Outbox --

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_email(
        &self,
        user_id: i64,
        to_address: &str,
        from_address: Option<&str>,
        subject: &str,
        template: &str,
        context: &serde_json::Value,
        created: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO email_outbox
             (user_id, to_address, from_address, subject, template, context, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                to_address,
                from_address,
                subject,
                template,
                serde_json::to_string(context)?,
                encode_timestamp(&created),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_outbox(&self, limit: Option<usize>) -> Result<Vec<OutboxEmail>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, to_address, from_address, subject, template, context, created
             FROM email_outbox
             ORDER BY created DESC, id DESC
             LIMIT ?1",
        )?;
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let emails = stmt.query_map([limit], |row| {
            let context: String = row.get(6)?;
            Ok(OutboxEmail {
                id: row.get(0)?,
                user_id: row.get(1)?,
                to_address: row.get(2)?,
                from_address: row.get(3)?,
                subject: row.get(4)?,
                template: row.get(5)?,
                context: serde_json::from_str(&context).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
                })?,
                created: timestamp_column(row, 7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(emails)
    }

    pub fn count_outbox_by_template(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT template, COUNT(*) FROM email_outbox GROUP BY template ORDER BY template",
        )?;
        let counts = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

fn validate_settings(settings: &DonationSettings) -> Result<()> {
    let days = [
        ("minimum_days_since_last_donation", Some(settings.minimum_days_since_last_donation)),
        ("minimum_days_since_last_donation_email", Some(settings.minimum_days_since_last_donation_email)),
        ("recent_donation_days", settings.recent_donation_days),
    ];
    for (name, value) in days {
        if value.is_some_and(|v| v < 0) {
            return Err(DonationError::Config(format!("{} must not be negative", name)));
        }
    }
    if settings.downloads_in_period < 0 {
        return Err(DonationError::Config("downloads_in_period must not be negative".to_string()));
    }
    Ok(())
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        num_sounds: row.get(3)?,
        last_donation_email_sent: optional_timestamp_column(row, 4)?,
    })
}

/// Fixed-width UTC text so that string order is time order in SQL
pub fn encode_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn decode_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    decode_timestamp(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        decode_timestamp(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn timestamps_sort_as_text() {
        let early = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let later = early + Duration::microseconds(1);
        assert!(encode_timestamp(&early) < encode_timestamp(&later));
        assert_eq!(decode_timestamp(&encode_timestamp(&later)).unwrap(), later);
    }

    #[test]
    fn settings_are_created_once() {
        let db = Database::in_memory().unwrap();
        let first = db.get_or_create_settings().unwrap();
        assert_eq!(first, DonationSettings::default());

        db.update_settings(&SettingsUpdate {
            downloads_in_period: Some(5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(db.get_or_create_settings().unwrap().downloads_in_period, 5);
    }

    #[test]
    fn negative_days_are_rejected() {
        let db = Database::in_memory().unwrap();
        let err = db
            .update_settings(&SettingsUpdate {
                minimum_days_since_last_donation: Some(-1),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, DonationError::Config(_)));
    }

    #[test]
    fn reminder_candidates_are_distinct_and_skip_emailed() {
        let db = Database::in_memory().unwrap();
        let alice = db.insert_user("alice", "a@example.org", 0).unwrap();
        let bob = db.insert_user("bob", "b@example.org", 0).unwrap();
        let carol = db.insert_user("carol", "c@example.org", 0).unwrap();

        db.insert_donation(Some(alice), 5.0, at(1)).unwrap();
        db.insert_donation(Some(alice), 5.0, at(2)).unwrap();
        db.insert_donation(Some(bob), 5.0, at(3)).unwrap();
        db.insert_donation(Some(carol), 5.0, at(20)).unwrap();
        db.insert_donation(None, 5.0, at(1)).unwrap();
        db.set_last_donation_email_sent(bob, Some(at(12))).unwrap();

        assert_eq!(db.reminder_candidates(at(10)).unwrap(), vec![alice]);
    }

    #[test]
    fn solicitation_candidates_are_counted_and_ordered() {
        let db = Database::in_memory().unwrap();
        let heavy = db.insert_user("heavy", "h@example.org", 0).unwrap();
        let light = db.insert_user("light", "l@example.org", 0).unwrap();
        let donor = db.insert_user("donor", "d@example.org", 0).unwrap();

        for _ in 0..3 {
            db.insert_download(heavy, at(15)).unwrap();
            db.insert_download(donor, at(15)).unwrap();
        }
        db.insert_download(light, at(15)).unwrap();
        db.insert_download(light, at(2)).unwrap();
        db.insert_donation(Some(donor), 1.0, at(12)).unwrap();

        let counts = db.solicitation_candidates(at(10), at(10)).unwrap();
        assert_eq!(
            counts,
            vec![
                DownloadCount { user_id: light, downloads: 1 },
                DownloadCount { user_id: heavy, downloads: 3 },
            ]
        );
    }

    #[test]
    fn compare_and_stamp_only_wins_once() {
        let db = Database::in_memory().unwrap();
        let id = db.insert_user("alice", "a@example.org", 0).unwrap();

        assert!(db.compare_and_stamp(id, None, at(10), at(20)).unwrap());
        // a second claimant that read the old value loses
        assert!(!db.compare_and_stamp(id, None, at(10), at(20)).unwrap());
        assert_eq!(db.require_user(id).unwrap().last_donation_email_sent, Some(at(20)));

        assert!(db.restore_stamp(id, at(20), None).unwrap());
        assert_eq!(db.require_user(id).unwrap().last_donation_email_sent, None);
    }

    #[test]
    fn stamp_inside_cooldown_is_not_claimable() {
        let db = Database::in_memory().unwrap();
        let id = db.insert_user("alice", "a@example.org", 0).unwrap();
        db.set_last_donation_email_sent(id, Some(at(15))).unwrap();

        assert!(!db.compare_and_stamp(id, Some(at(15)), at(10), at(20)).unwrap());
        assert!(db.compare_and_stamp(id, Some(at(15)), at(16), at(20)).unwrap());
    }

    #[test]
    fn latest_donation_and_window_count() {
        let db = Database::in_memory().unwrap();
        let id = db.insert_user("alice", "a@example.org", 0).unwrap();
        db.insert_donation(Some(id), 1.0, at(5)).unwrap();
        let newest = db.insert_donation(Some(id), 2.0, at(8)).unwrap();
        db.insert_download(id, at(7)).unwrap();
        db.insert_download(id, at(8)).unwrap();
        db.insert_download(id, at(9)).unwrap();

        let donation = db.latest_donation_after(id, at(1)).unwrap().unwrap();
        assert_eq!(donation.id, newest);
        assert!(db.latest_donation_after(id, at(8)).unwrap().is_none());
        assert_eq!(db.count_downloads_since(id, donation.created).unwrap(), 2);
    }

    #[test]
    fn outbox_round_trips_context() {
        let db = Database::in_memory().unwrap();
        let context = serde_json::json!({ "user": { "username": "alice" } });
        db.enqueue_email(1, "a@example.org", None, "Donation", "t.txt", &context, at(3)).unwrap();

        let emails = db.get_outbox(Some(10)).unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].context, context);
        assert_eq!(db.count_outbox_by_template().unwrap(), vec![("t.txt".to_string(), 1)]);
    }
}

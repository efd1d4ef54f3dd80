/*
 * Adapted from Stalwart Mail Server, which is available on
 * https://github.com/stalwartlabs/mail-server/
 *
 * and carries the following license notice:
 *
 * Copyright (c) 2023 Stalwart Labs Ltd.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@stalw.art
 * for more details.
*/

use std::sync::Arc;

use mail_parser::MessageParser;
use mysql::{prelude::Queryable, TxOpts};
use time::{macros::format_description, OffsetDateTime};

use crate::{
    db::{DbPool, MySqlConnectionManager},
    error::{Error, Result},
};

/// A message accepted on the wire: the reverse-path, the forward-paths and
/// the accumulated (dot-unstuffed) body.
#[derive(Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
}

/// The envelope row persisted for every accepted message. Written once on
/// DATA end, never mutated afterwards.
#[derive(Debug)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub message_id: String,
    pub date_header: String,
    pub raw_body: Vec<u8>,
    pub received_at: OffsetDateTime,
}

impl Envelope {
    /// Assemble an envelope from a received message, pulling `Subject:`,
    /// `Message-ID:` and `Date:` out of the header block. Headers that are
    /// missing or unparsable become empty strings.
    pub fn assemble(message: ReceivedMessage, received_at: OffsetDateTime) -> Self {
        let (subject, message_id, date_header) = {
            let headers = MessageParser::default().parse_headers(&message.body);
            match &headers {
                Some(parsed) => (
                    parsed.subject().unwrap_or_default().to_string(),
                    parsed.message_id().unwrap_or_default().to_string(),
                    parsed.date().map(|d| d.to_rfc3339()).unwrap_or_default(),
                ),
                None => Default::default(),
            }
        };

        Envelope {
            sender: message.sender,
            recipients: message.recipients,
            subject,
            message_id,
            date_header,
            raw_body: message.body,
            received_at,
        }
    }
}

/// The blocking operations the session engine defers to the worker pool.
pub trait Backend: Send + Sync + 'static {
    /// Check a username/secret pair against the users table.
    fn verify_credentials(&self, username: &str, secret: &str) -> Result<bool>;

    /// Persist an accepted message and return the assigned envelope id.
    fn store_message(&self, message: ReceivedMessage) -> Result<u64>;
}

/// All database operations the session engine needs. Every method blocks
/// and is intended to run on the worker executor.
pub struct MailStore {
    pool: Arc<DbPool<MySqlConnectionManager>>,
}

impl MailStore {
    pub fn new(pool: Arc<DbPool<MySqlConnectionManager>>) -> Self {
        Self { pool }
    }

    pub fn create_tables(&self) -> Result<()> {
        let mut conn = self.pool.acquire()?;

        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS envelopes (
                id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
                sender VARCHAR(320) NOT NULL,
                subject TEXT NOT NULL,
                message_id VARCHAR(998) NOT NULL,
                date_header VARCHAR(998) NOT NULL,
                raw_body LONGBLOB NOT NULL,
                received_at DATETIME NOT NULL,
                PRIMARY KEY (id)
            ) ENGINE=InnoDB",
        )?;

        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS envelope_recipients (
                envelope_id BIGINT UNSIGNED NOT NULL,
                address VARCHAR(320) NOT NULL,
                kind ENUM('TO','CC','BCC') NOT NULL DEFAULT 'TO',
                KEY (envelope_id)
            ) ENGINE=InnoDB",
        )?;

        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS users (
                username VARCHAR(128) NOT NULL,
                password VARCHAR(255) NOT NULL,
                PRIMARY KEY (username)
            ) ENGINE=InnoDB",
        )?;

        Ok(())
    }

    fn insert_envelope(conn: &mut mysql::Conn, envelope: &Envelope) -> Result<u64> {
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        let received_at = envelope
            .received_at
            .format(&format)
            .map_err(|e| Error::Storage(format!("failed to format timestamp: {e}")))?;

        let mut tx = conn.start_transaction(TxOpts::default())?;

        tx.exec_drop(
            "INSERT INTO envelopes (sender, subject, message_id, date_header, raw_body, received_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                &envelope.sender,
                &envelope.subject,
                &envelope.message_id,
                &envelope.date_header,
                &envelope.raw_body,
                &received_at,
            ),
        )?;

        let envelope_id = tx
            .last_insert_id()
            .ok_or_else(|| Error::Storage("no envelope id assigned".to_string()))?;

        for recipient in &envelope.recipients {
            tx.exec_drop(
                "INSERT INTO envelope_recipients (envelope_id, address, kind) VALUES (?, ?, 'TO')",
                (envelope_id, recipient),
            )?;
        }

        tx.commit()?;
        Ok(envelope_id)
    }
}

impl Backend for MailStore {
    fn verify_credentials(&self, username: &str, secret: &str) -> Result<bool> {
        let mut conn = self.pool.acquire()?;

        let result = conn.exec_first::<u64, _, _>(
            "SELECT COUNT(*) FROM users WHERE username = ? AND password = ?",
            (username, secret),
        );

        match result {
            Ok(count) => Ok(count.unwrap_or(0) > 0),
            Err(e) => {
                conn.mark_broken();
                Err(e.into())
            }
        }
    }

    /// Persist an accepted message: one envelope row plus one row per
    /// recipient, in a single transaction. Any failure rolls the whole
    /// transaction back.
    fn store_message(&self, message: ReceivedMessage) -> Result<u64> {
        let envelope = Envelope::assemble(message, OffsetDateTime::now_utc());
        let mut conn = self.pool.acquire()?;

        let result = MailStore::insert_envelope(&mut conn, &envelope);
        if result.is_err() {
            conn.mark_broken();
        }
        result
    }
}

use crate::error::StoreError;
use crate::records::{Envelope, NewMessage, StoredMessage};
use crate::ChatStore;
use parley_proto::{Attachment, DialogueId, EnvelopeIn, MessageId};
use rusqlite::{params, Connection, OptionalExtension, Row};

const MESSAGE_COLS: &str = "id, dialogue_id, sender_id, sender_device_id, created_at_ms, \
     edited_at_ms, is_edited, delivered, content, attachments, self_destruct_at_ms, system_event";

pub(crate) fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let attachments_json: Option<String> = row.get(9)?;
    let attachments: Vec<Attachment> = match attachments_json {
        Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!(err = %e, "unparsable attachments column, dropping");
            Vec::new()
        }),
        None => Vec::new(),
    };
    Ok(StoredMessage {
        id: row.get(0)?,
        dialogue_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_device_id: row.get(3)?,
        created_at_ms: row.get::<_, i64>(4)? as u64,
        edited_at_ms: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        is_edited: row.get(6)?,
        delivered: row.get(7)?,
        content: row.get(8)?,
        attachments,
        self_destruct_at_ms: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        system_event: row.get(11)?,
    })
}

fn load_message(conn: &Connection, id: &str) -> Result<Option<StoredMessage>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"),
            params![id],
            row_to_message,
        )
        .optional()?)
}

fn insert_envelopes(
    conn: &Connection,
    message_id: &str,
    envelopes: &[EnvelopeIn],
) -> Result<(), StoreError> {
    for env in envelopes {
        conn.execute(
            "INSERT INTO message_envelopes (message_id, device_id, ciphertext)
             VALUES (?1, ?2, ?3)",
            params![message_id, env.device_id, env.ciphertext],
        )?;
    }
    Ok(())
}

fn delete_message_rows(conn: &Connection, id: &str) -> Result<(), StoreError> {
    conn.execute("DELETE FROM message_envelopes WHERE message_id = ?1", params![id])?;
    conn.execute("DELETE FROM message_seen WHERE message_id = ?1", params![id])?;
    conn.execute("DELETE FROM message_deleted WHERE message_id = ?1", params![id])?;
    conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
    Ok(())
}

fn refresh_last_message(conn: &Connection, dialogue_id: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE dialogues SET last_message_id =
            (SELECT id FROM messages WHERE dialogue_id = ?1
             ORDER BY created_at_ms DESC, id DESC LIMIT 1)
         WHERE id = ?1",
        params![dialogue_id],
    )?;
    Ok(())
}

impl ChatStore {
    /// Persist a message and its envelopes atomically, updating the
    /// dialogue's cached last-message pointer.
    pub fn insert_message(&self, new: NewMessage) -> Result<StoredMessage, StoreError> {
        let attachments_json = if new.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&new.attachments)?)
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages (id, dialogue_id, sender_id, sender_device_id, created_at_ms,
                                   content, attachments, self_destruct_at_ms, system_event)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.id,
                new.dialogue_id,
                new.sender_id,
                new.sender_device_id,
                new.created_at_ms as i64,
                new.content,
                attachments_json,
                new.self_destruct_at_ms.map(|v| v as i64),
                new.system_event,
            ],
        )?;
        insert_envelopes(&tx, &new.id, &new.envelopes)?;
        tx.execute(
            "UPDATE dialogues SET last_message_id = ?2 WHERE id = ?1",
            params![new.dialogue_id, new.id],
        )?;
        let message = load_message(&tx, &new.id)?.ok_or(StoreError::MessageNotFound)?;
        tx.commit()?;
        Ok(message)
    }

    pub fn message(&self, id: &str) -> Result<Option<StoredMessage>, StoreError> {
        let conn = self.lock()?;
        load_message(&conn, id)
    }

    /// Apply an edit. A new envelope set replaces the old one in the same
    /// transaction (delete-all-then-insert), so concurrent readers only
    /// ever observe the pre-edit or post-edit set in full.
    pub fn edit_message(
        &self,
        id: &str,
        new_content: Option<&str>,
        new_envelopes: Option<&[EnvelopeIn]>,
        edited_at_ms: u64,
    ) -> Result<StoredMessage, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if load_message(&tx, id)?.is_none() {
            return Err(StoreError::MessageNotFound);
        }
        if let Some(content) = new_content {
            tx.execute(
                "UPDATE messages SET content = ?2 WHERE id = ?1",
                params![id, content],
            )?;
        }
        if let Some(envelopes) = new_envelopes {
            tx.execute(
                "DELETE FROM message_envelopes WHERE message_id = ?1",
                params![id],
            )?;
            insert_envelopes(&tx, id, envelopes)?;
        }
        tx.execute(
            "UPDATE messages SET is_edited = 1, edited_at_ms = ?2 WHERE id = ?1",
            params![id, edited_at_ms as i64],
        )?;
        let message = load_message(&tx, id)?.ok_or(StoreError::MessageNotFound)?;
        tx.commit()?;
        Ok(message)
    }

    /// Transition Sent → Delivered. Returns true only on the first call;
    /// replays are no-ops.
    pub fn mark_delivered(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE messages SET delivered = 1 WHERE id = ?1 AND delivered = 0",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Mark every unseen message in a dialogue as seen by `user_id`,
    /// skipping the user's own messages. Returns only the newly-seen ids,
    /// so concurrent or repeated calls cannot double-report.
    pub fn mark_seen_bulk(
        &self,
        dialogue_id: &str,
        user_id: &str,
    ) -> Result<Vec<MessageId>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ids: Vec<MessageId> = {
            let mut stmt = tx.prepare(
                "SELECT m.id FROM messages m
                 WHERE m.dialogue_id = ?1 AND m.sender_id != ?2
                   AND NOT EXISTS (SELECT 1 FROM message_seen s
                                   WHERE s.message_id = m.id AND s.user_id = ?2)
                   AND NOT EXISTS (SELECT 1 FROM message_deleted d
                                   WHERE d.message_id = m.id AND d.user_id = ?2)
                 ORDER BY m.created_at_ms",
            )?;
            stmt.query_map(params![dialogue_id, user_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        for id in &ids {
            tx.execute(
                "INSERT OR IGNORE INTO message_seen (message_id, user_id) VALUES (?1, ?2)",
                params![id, user_id],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn seen_by(&self, message_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id FROM message_seen WHERE message_id = ?1 ORDER BY user_id",
        )?;
        let users = stmt
            .query_map(params![message_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    /// Hide a message from one user's view.
    pub fn soft_delete_message(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<StoredMessage, StoreError> {
        let conn = self.lock()?;
        let message = load_message(&conn, id)?.ok_or(StoreError::MessageNotFound)?;
        conn.execute(
            "INSERT OR IGNORE INTO message_deleted (message_id, user_id) VALUES (?1, ?2)",
            params![id, user_id],
        )?;
        Ok(message)
    }

    /// Destroy a message and its envelope/seen/deleted rows.
    pub fn hard_delete_message(&self, id: &str) -> Result<StoredMessage, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let message = load_message(&tx, id)?.ok_or(StoreError::MessageNotFound)?;
        delete_message_rows(&tx, id)?;
        refresh_last_message(&tx, &message.dialogue_id)?;
        tx.commit()?;
        Ok(message)
    }

    /// Undelivered messages addressed to a user across all their
    /// dialogues, oldest first. Feeds the connect-time catch-up scan.
    pub fn undelivered_for_user(&self, user_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages m
             WHERE m.delivered = 0 AND m.sender_id != ?1
               AND EXISTS (SELECT 1 FROM participants p
                           WHERE p.dialogue_id = m.dialogue_id AND p.user_id = ?1)
               AND NOT EXISTS (SELECT 1 FROM message_deleted d
                               WHERE d.message_id = m.id AND d.user_id = ?1)
             ORDER BY m.created_at_ms"
        ))?;
        let messages = stmt
            .query_map(params![user_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Ids of messages still `Sent`, for the periodic redelivery sweep.
    pub fn undelivered_message_ids(&self, limit: usize) -> Result<Vec<MessageId>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM messages WHERE delivered = 0 AND system_event IS NULL
             ORDER BY created_at_ms LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Delete the sender's own messages whose self-destruct deadline has
    /// passed. Best-effort; called opportunistically on each send.
    pub fn purge_self_destructed(
        &self,
        sender_id: &str,
        now_ms: u64,
    ) -> Result<Vec<(MessageId, DialogueId)>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let expired: Vec<(MessageId, DialogueId)> = {
            let mut stmt = tx.prepare(
                "SELECT id, dialogue_id FROM messages
                 WHERE sender_id = ?1 AND self_destruct_at_ms IS NOT NULL
                   AND self_destruct_at_ms <= ?2",
            )?;
            stmt.query_map(params![sender_id, now_ms as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        for (id, dialogue_id) in &expired {
            delete_message_rows(&tx, id)?;
            refresh_last_message(&tx, dialogue_id)?;
        }
        tx.commit()?;
        Ok(expired)
    }

    pub fn envelopes_for(&self, message_id: &str) -> Result<Vec<Envelope>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, device_id, ciphertext FROM message_envelopes
             WHERE message_id = ?1 ORDER BY device_id",
        )?;
        let envelopes = stmt
            .query_map(params![message_id], |row| {
                Ok(Envelope {
                    message_id: row.get(0)?,
                    device_id: row.get(1)?,
                    ciphertext: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(envelopes)
    }

    pub fn envelope_for_device(
        &self,
        message_id: &str,
        device_id: &str,
    ) -> Result<Option<Envelope>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT message_id, device_id, ciphertext FROM message_envelopes
                 WHERE message_id = ?1 AND device_id = ?2",
                params![message_id, device_id],
                |row| {
                    Ok(Envelope {
                        message_id: row.get(0)?,
                        device_id: row.get(1)?,
                        ciphertext: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }
}

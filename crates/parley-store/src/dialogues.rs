use crate::error::StoreError;
use crate::records::{Dialogue, NewDialogue, Participant};
use crate::ChatStore;
use parley_proto::{DialogueId, Role, UserId};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(crate) fn row_to_dialogue(row: &Row<'_>) -> rusqlite::Result<Dialogue> {
    Ok(Dialogue {
        id: row.get(0)?,
        slug: row.get(1)?,
        is_group: row.get(2)?,
        last_message_id: row.get(3)?,
        created_at_ms: row.get::<_, i64>(4)? as u64,
    })
}

pub(crate) fn parse_role(s: &str) -> Result<Role, StoreError> {
    Role::parse(s).ok_or_else(|| StoreError::RoleViolation(format!("unknown role '{s}'")))
}

pub(crate) fn role_of(
    conn: &Connection,
    dialogue_id: &str,
    user_id: &str,
) -> Result<Option<Role>, StoreError> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM participants WHERE dialogue_id = ?1 AND user_id = ?2",
            params![dialogue_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    role.as_deref().map(parse_role).transpose()
}

pub(crate) fn load_dialogue(
    conn: &Connection,
    dialogue_id: &str,
) -> Result<Option<Dialogue>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, slug, is_group, last_message_id, created_at_ms
             FROM dialogues WHERE id = ?1",
            params![dialogue_id],
            row_to_dialogue,
        )
        .optional()?)
}

impl ChatStore {
    /// Create a dialogue and its initial membership in one transaction.
    ///
    /// Direct dialogues get exactly two `participant` members; groups get
    /// one `founder` plus `participant` members.
    pub fn create_dialogue(&self, new: NewDialogue) -> Result<Dialogue, StoreError> {
        if new.is_group {
            let founder = new
                .founder
                .as_ref()
                .ok_or_else(|| StoreError::InvalidDialogue("group requires a founder".into()))?;
            if !new.members.contains(founder) {
                return Err(StoreError::InvalidDialogue(
                    "founder must be listed among members".into(),
                ));
            }
        } else {
            if new.members.len() != 2 || new.members[0] == new.members[1] {
                return Err(StoreError::InvalidDialogue(
                    "direct dialogue requires exactly two distinct participants".into(),
                ));
            }
            if new.founder.is_some() {
                return Err(StoreError::InvalidDialogue(
                    "direct dialogues have no founder".into(),
                ));
            }
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO dialogues (id, slug, is_group, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![new.id, new.slug, new.is_group, new.created_at_ms as i64],
        )?;
        for member in &new.members {
            let role = if new.founder.as_deref() == Some(member.as_str()) {
                Role::Founder
            } else {
                Role::Participant
            };
            tx.execute(
                "INSERT INTO participants (dialogue_id, user_id, role, joined_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![new.id, member, role.as_str(), new.created_at_ms as i64],
            )?;
        }
        tx.commit()?;

        Ok(Dialogue {
            id: new.id,
            slug: new.slug,
            is_group: new.is_group,
            last_message_id: None,
            created_at_ms: new.created_at_ms,
        })
    }

    pub fn dialogue(&self, dialogue_id: &str) -> Result<Option<Dialogue>, StoreError> {
        let conn = self.lock()?;
        load_dialogue(&conn, dialogue_id)
    }

    /// Dialogues the user participates in and has not soft-deleted.
    pub fn dialogue_ids_for_user(&self, user_id: &str) -> Result<Vec<DialogueId>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT p.dialogue_id FROM participants p
             WHERE p.user_id = ?1
               AND NOT EXISTS (SELECT 1 FROM dialogue_deleted dd
                               WHERE dd.dialogue_id = p.dialogue_id AND dd.user_id = ?1)
             ORDER BY p.dialogue_id",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn participants(&self, dialogue_id: &str) -> Result<Vec<Participant>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT dialogue_id, user_id, role, joined_at_ms FROM participants
             WHERE dialogue_id = ?1 ORDER BY joined_at_ms, user_id",
        )?;
        let rows = stmt
            .query_map(params![dialogue_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(dialogue_id, user_id, role, joined_at_ms)| {
                Ok(Participant {
                    dialogue_id,
                    user_id,
                    role: parse_role(&role)?,
                    joined_at_ms: joined_at_ms as u64,
                })
            })
            .collect()
    }

    pub fn participant_role(
        &self,
        dialogue_id: &str,
        user_id: &str,
    ) -> Result<Option<Role>, StoreError> {
        let conn = self.lock()?;
        role_of(&conn, dialogue_id, user_id)
    }

    pub fn is_participant(&self, dialogue_id: &str, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.participant_role(dialogue_id, user_id)?.is_some())
    }

    /// Hide the dialogue and all its current messages from one user's view.
    pub fn soft_delete_dialogue_for(
        &self,
        dialogue_id: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        soft_delete_dialogue_in_tx(&tx, dialogue_id, user_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn is_dialogue_deleted_for(
        &self,
        dialogue_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM dialogue_deleted WHERE dialogue_id = ?1 AND user_id = ?2",
                params![dialogue_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Messages in the dialogue the user has not seen, excluding their own
    /// and anything soft-deleted from their view.
    pub fn unread_count(&self, dialogue_id: &str, user_id: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.dialogue_id = ?1 AND m.sender_id != ?2
               AND NOT EXISTS (SELECT 1 FROM message_seen s
                               WHERE s.message_id = m.id AND s.user_id = ?2)
               AND NOT EXISTS (SELECT 1 FROM message_deleted d
                               WHERE d.message_id = m.id AND d.user_id = ?2)",
            params![dialogue_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    #[cfg(test)]
    pub(crate) fn set_role_for_test(&self, dialogue_id: &str, user_id: &str, role: Role) {
        let conn = self.lock().unwrap();
        conn.execute(
            "UPDATE participants SET role = ?3 WHERE dialogue_id = ?1 AND user_id = ?2",
            params![dialogue_id, user_id, role.as_str()],
        )
        .unwrap();
    }
}

pub(crate) fn soft_delete_dialogue_in_tx(
    tx: &Connection,
    dialogue_id: &str,
    user_id: &str,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR IGNORE INTO dialogue_deleted (dialogue_id, user_id) VALUES (?1, ?2)",
        params![dialogue_id, user_id],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO message_deleted (message_id, user_id)
         SELECT id, ?2 FROM messages WHERE dialogue_id = ?1",
        params![dialogue_id, user_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::NewDialogue;
    use crate::testutil::{mem, seed_direct, seed_group};

    #[test]
    fn direct_dialogue_requires_two_distinct_members() {
        let store = mem();
        let err = store
            .create_dialogue(NewDialogue {
                id: "d".into(),
                slug: "solo".into(),
                is_group: false,
                founder: None,
                members: vec!["a".into()],
                created_at_ms: 1,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDialogue(_)));

        let err = store
            .create_dialogue(NewDialogue {
                id: "d".into(),
                slug: "dup".into(),
                is_group: false,
                founder: None,
                members: vec!["a".into(), "a".into()],
                created_at_ms: 1,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDialogue(_)));
    }

    #[test]
    fn group_has_exactly_one_founder() {
        let store = mem();
        let d = seed_group(&store);
        let founders: Vec<_> = store
            .participants(&d.id)
            .unwrap()
            .into_iter()
            .filter(|p| p.role == Role::Founder)
            .collect();
        assert_eq!(founders.len(), 1);
        assert_eq!(founders[0].user_id, "f");
    }

    #[test]
    fn membership_queries() {
        let store = mem();
        let d = seed_direct(&store);
        assert!(store.is_participant(&d.id, "a").unwrap());
        assert!(!store.is_participant(&d.id, "z").unwrap());
        assert_eq!(
            store.participant_role(&d.id, "b").unwrap(),
            Some(Role::Participant)
        );
        assert_eq!(store.dialogue_ids_for_user("a").unwrap(), vec![d.id.clone()]);
    }

    #[test]
    fn soft_delete_hides_dialogue_from_listing() {
        let store = mem();
        let d = seed_direct(&store);
        store.soft_delete_dialogue_for(&d.id, "a").unwrap();
        assert!(store.is_dialogue_deleted_for(&d.id, "a").unwrap());
        assert!(store.dialogue_ids_for_user("a").unwrap().is_empty());
        // The other participant still sees it.
        assert_eq!(store.dialogue_ids_for_user("b").unwrap(), vec![d.id]);
    }
}

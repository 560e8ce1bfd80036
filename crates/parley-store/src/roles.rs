//! Group role transitions.
//!
//! Every transition runs in a single transaction and upholds the group
//! invariant: exactly one founder at all times. The caller layers the
//! synthetic system message and broadcasts on top.

use crate::dialogues::{load_dialogue, role_of, soft_delete_dialogue_in_tx};
use crate::error::StoreError;
use crate::ChatStore;
use parley_proto::{Role, UserId};
use rusqlite::{params, Connection};

/// Outcome of a committed role transition, for system-message rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleChange {
    Promoted { user_id: UserId },
    Demoted { user_id: UserId },
    Resigned { user_id: UserId },
    Added { user_id: UserId, restored: bool },
    Removed { user_id: UserId },
    Left { user_id: UserId },
    FounderTransferred { old_founder: UserId, new_founder: UserId },
    GroupDeleted,
}

fn require_group(conn: &Connection, dialogue_id: &str) -> Result<(), StoreError> {
    let dialogue = load_dialogue(conn, dialogue_id)?.ok_or(StoreError::DialogueNotFound)?;
    if !dialogue.is_group {
        return Err(StoreError::RoleViolation(
            "role transitions apply to group dialogues only".into(),
        ));
    }
    Ok(())
}

fn require_role(conn: &Connection, dialogue_id: &str, user_id: &str) -> Result<Role, StoreError> {
    role_of(conn, dialogue_id, user_id)?.ok_or(StoreError::NotParticipant)
}

fn set_role(
    conn: &Connection,
    dialogue_id: &str,
    user_id: &str,
    role: Role,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE participants SET role = ?3 WHERE dialogue_id = ?1 AND user_id = ?2",
        params![dialogue_id, user_id, role.as_str()],
    )?;
    Ok(())
}

fn elder_count(conn: &Connection, dialogue_id: &str) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM participants WHERE dialogue_id = ?1 AND role = 'elder'",
        params![dialogue_id],
        |row| row.get(0),
    )?)
}

fn remove_membership(
    conn: &Connection,
    dialogue_id: &str,
    user_id: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM participants WHERE dialogue_id = ?1 AND user_id = ?2",
        params![dialogue_id, user_id],
    )?;
    // Leaving or being removed hides the dialogue from the user's view.
    soft_delete_dialogue_in_tx(conn, dialogue_id, user_id)?;
    Ok(())
}

impl ChatStore {
    /// participant → elder. Founder only.
    pub fn promote_to_elder(
        &self,
        dialogue_id: &str,
        actor: &str,
        target: &str,
    ) -> Result<RoleChange, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_group(&tx, dialogue_id)?;
        if require_role(&tx, dialogue_id, actor)? != Role::Founder {
            return Err(StoreError::RoleViolation(
                "only the founder may promote".into(),
            ));
        }
        if require_role(&tx, dialogue_id, target)? != Role::Participant {
            return Err(StoreError::RoleViolation(
                "only participants can be promoted to elder".into(),
            ));
        }
        set_role(&tx, dialogue_id, target, Role::Elder)?;
        tx.commit()?;
        Ok(RoleChange::Promoted { user_id: target.to_string() })
    }

    /// elder → participant. Founder only.
    pub fn demote_elder(
        &self,
        dialogue_id: &str,
        actor: &str,
        target: &str,
    ) -> Result<RoleChange, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_group(&tx, dialogue_id)?;
        if require_role(&tx, dialogue_id, actor)? != Role::Founder {
            return Err(StoreError::RoleViolation(
                "only the founder may demote".into(),
            ));
        }
        if require_role(&tx, dialogue_id, target)? != Role::Elder {
            return Err(StoreError::RoleViolation("target is not an elder".into()));
        }
        set_role(&tx, dialogue_id, target, Role::Participant)?;
        tx.commit()?;
        Ok(RoleChange::Demoted { user_id: target.to_string() })
    }

    /// Self-service elder → participant.
    pub fn resign_elder(&self, dialogue_id: &str, actor: &str) -> Result<RoleChange, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_group(&tx, dialogue_id)?;
        if require_role(&tx, dialogue_id, actor)? != Role::Elder {
            return Err(StoreError::RoleViolation("only elders may resign".into()));
        }
        set_role(&tx, dialogue_id, actor, Role::Participant)?;
        tx.commit()?;
        Ok(RoleChange::Resigned { user_id: actor.to_string() })
    }

    /// Add (or restore) a participant. Founder or elder.
    pub fn add_participant(
        &self,
        dialogue_id: &str,
        actor: &str,
        target: &str,
        now_ms: u64,
    ) -> Result<RoleChange, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_group(&tx, dialogue_id)?;
        if !require_role(&tx, dialogue_id, actor)?.can_manage_members() {
            return Err(StoreError::RoleViolation(
                "only the founder or an elder may add participants".into(),
            ));
        }
        let restored = match role_of(&tx, dialogue_id, target)? {
            Some(_) => {
                // Already a member: restoring their soft-deleted view is
                // the only meaningful outcome.
                let cleared = tx.execute(
                    "DELETE FROM dialogue_deleted WHERE dialogue_id = ?1 AND user_id = ?2",
                    params![dialogue_id, target],
                )?;
                if cleared == 0 {
                    return Err(StoreError::RoleViolation(
                        "user is already a participant".into(),
                    ));
                }
                true
            }
            None => {
                tx.execute(
                    "INSERT INTO participants (dialogue_id, user_id, role, joined_at_ms)
                     VALUES (?1, ?2, 'participant', ?3)",
                    params![dialogue_id, target, now_ms as i64],
                )?;
                // A re-added user gets the dialogue back in their list.
                tx.execute(
                    "DELETE FROM dialogue_deleted WHERE dialogue_id = ?1 AND user_id = ?2",
                    params![dialogue_id, target],
                )?;
                false
            }
        };
        tx.commit()?;
        Ok(RoleChange::Added { user_id: target.to_string(), restored })
    }

    /// Remove a participant. Founder or elder actor; the founder cannot be
    /// removed, nor can the last elder.
    pub fn remove_participant(
        &self,
        dialogue_id: &str,
        actor: &str,
        target: &str,
    ) -> Result<RoleChange, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_group(&tx, dialogue_id)?;
        if !require_role(&tx, dialogue_id, actor)?.can_manage_members() {
            return Err(StoreError::RoleViolation(
                "only the founder or an elder may remove participants".into(),
            ));
        }
        match require_role(&tx, dialogue_id, target)? {
            Role::Founder => {
                return Err(StoreError::RoleViolation(
                    "the founder cannot be removed".into(),
                ));
            }
            Role::Elder if elder_count(&tx, dialogue_id)? <= 1 => {
                return Err(StoreError::RoleViolation(
                    "the last elder cannot be removed".into(),
                ));
            }
            _ => {}
        }
        remove_membership(&tx, dialogue_id, target)?;
        tx.commit()?;
        Ok(RoleChange::Removed { user_id: target.to_string() })
    }

    /// Leave the group. Participants only: the founder must transfer or
    /// delete instead, and an elder must resign first.
    pub fn leave_group(&self, dialogue_id: &str, actor: &str) -> Result<RoleChange, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_group(&tx, dialogue_id)?;
        match require_role(&tx, dialogue_id, actor)? {
            Role::Founder => {
                return Err(StoreError::RoleViolation(
                    "the founder must transfer ownership or delete the group".into(),
                ));
            }
            Role::Elder => {
                return Err(StoreError::RoleViolation(
                    "elders must resign before leaving".into(),
                ));
            }
            Role::Participant => {}
        }
        remove_membership(&tx, dialogue_id, actor)?;
        tx.commit()?;
        Ok(RoleChange::Left { user_id: actor.to_string() })
    }

    /// Hand the founder role to a specific elder. The old founder becomes
    /// a plain participant in the same transaction, so there is never a
    /// moment with zero or two founders.
    pub fn transfer_founder(
        &self,
        dialogue_id: &str,
        actor: &str,
        new_founder: &str,
    ) -> Result<RoleChange, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_group(&tx, dialogue_id)?;
        if require_role(&tx, dialogue_id, actor)? != Role::Founder {
            return Err(StoreError::RoleViolation(
                "only the founder may transfer ownership".into(),
            ));
        }
        if require_role(&tx, dialogue_id, new_founder)? != Role::Elder {
            return Err(StoreError::RoleViolation(
                "ownership can only be transferred to an elder".into(),
            ));
        }
        set_role(&tx, dialogue_id, actor, Role::Participant)?;
        set_role(&tx, dialogue_id, new_founder, Role::Founder)?;
        tx.commit()?;
        Ok(RoleChange::FounderTransferred {
            old_founder: actor.to_string(),
            new_founder: new_founder.to_string(),
        })
    }

    /// Destroy the group and everything attached to it. Founder only.
    pub fn delete_group(&self, dialogue_id: &str, actor: &str) -> Result<RoleChange, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_group(&tx, dialogue_id)?;
        if require_role(&tx, dialogue_id, actor)? != Role::Founder {
            return Err(StoreError::RoleViolation(
                "only the founder may delete the group".into(),
            ));
        }
        tx.execute(
            "DELETE FROM message_envelopes WHERE message_id IN
                 (SELECT id FROM messages WHERE dialogue_id = ?1)",
            params![dialogue_id],
        )?;
        tx.execute(
            "DELETE FROM message_seen WHERE message_id IN
                 (SELECT id FROM messages WHERE dialogue_id = ?1)",
            params![dialogue_id],
        )?;
        tx.execute(
            "DELETE FROM message_deleted WHERE message_id IN
                 (SELECT id FROM messages WHERE dialogue_id = ?1)",
            params![dialogue_id],
        )?;
        tx.execute("DELETE FROM messages WHERE dialogue_id = ?1", params![dialogue_id])?;
        tx.execute("DELETE FROM participants WHERE dialogue_id = ?1", params![dialogue_id])?;
        tx.execute("DELETE FROM dialogue_deleted WHERE dialogue_id = ?1", params![dialogue_id])?;
        tx.execute("DELETE FROM dialogues WHERE id = ?1", params![dialogue_id])?;
        tx.commit()?;
        Ok(RoleChange::GroupDeleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{mem, seed_direct, seed_group};

    fn founders(store: &ChatStore, dialogue_id: &str) -> Vec<String> {
        store
            .participants(dialogue_id)
            .unwrap()
            .into_iter()
            .filter(|p| p.role == Role::Founder)
            .map(|p| p.user_id)
            .collect()
    }

    #[test]
    fn promote_requires_founder() {
        let store = mem();
        let d = seed_group(&store);
        let err = store.promote_to_elder(&d.id, "e", "p").unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));

        store.promote_to_elder(&d.id, "f", "p").unwrap();
        assert_eq!(
            store.participant_role(&d.id, "p").unwrap(),
            Some(Role::Elder)
        );
    }

    #[test]
    fn demote_and_resign() {
        let store = mem();
        let d = seed_group(&store);
        store.demote_elder(&d.id, "f", "e").unwrap();
        assert_eq!(
            store.participant_role(&d.id, "e").unwrap(),
            Some(Role::Participant)
        );

        store.promote_to_elder(&d.id, "f", "e").unwrap();
        store.resign_elder(&d.id, "e").unwrap();
        assert_eq!(
            store.participant_role(&d.id, "e").unwrap(),
            Some(Role::Participant)
        );
        // A participant cannot resign.
        let err = store.resign_elder(&d.id, "p").unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));
    }

    #[test]
    fn participant_cannot_remove_founder() {
        let store = mem();
        let d = seed_group(&store);
        // Scenario C: P tries to remove F.
        let err = store.remove_participant(&d.id, "p", "f").unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));
        assert_eq!(founders(&store, &d.id), vec!["f".to_string()]);
        assert_eq!(store.participants(&d.id).unwrap().len(), 3);
    }

    #[test]
    fn elder_cannot_be_removed_when_last() {
        let store = mem();
        let d = seed_group(&store);
        let err = store.remove_participant(&d.id, "f", "e").unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));

        // With a second elder the removal goes through.
        store.promote_to_elder(&d.id, "f", "p").unwrap();
        store.remove_participant(&d.id, "f", "e").unwrap();
        assert_eq!(store.participant_role(&d.id, "e").unwrap(), None);
    }

    #[test]
    fn founder_cannot_be_removed_even_by_elder() {
        let store = mem();
        let d = seed_group(&store);
        let err = store.remove_participant(&d.id, "e", "f").unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));
    }

    #[test]
    fn removal_soft_deletes_view() {
        let store = mem();
        let d = seed_group(&store);
        store.remove_participant(&d.id, "e", "p").unwrap();
        assert!(store.is_dialogue_deleted_for(&d.id, "p").unwrap());
        assert!(store.dialogue_ids_for_user("p").unwrap().is_empty());
    }

    #[test]
    fn add_restores_soft_deleted_member() {
        let store = mem();
        let d = seed_group(&store);
        store.soft_delete_dialogue_for(&d.id, "p").unwrap();

        let change = store.add_participant(&d.id, "e", "p", 2_000).unwrap();
        assert_eq!(
            change,
            RoleChange::Added { user_id: "p".to_string(), restored: true }
        );
        assert!(!store.is_dialogue_deleted_for(&d.id, "p").unwrap());

        // Adding an untouched existing member is rejected.
        let err = store.add_participant(&d.id, "e", "p", 2_001).unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));
    }

    #[test]
    fn add_new_member() {
        let store = mem();
        let d = seed_group(&store);
        let change = store.add_participant(&d.id, "f", "q", 2_000).unwrap();
        assert_eq!(
            change,
            RoleChange::Added { user_id: "q".to_string(), restored: false }
        );
        assert_eq!(
            store.participant_role(&d.id, "q").unwrap(),
            Some(Role::Participant)
        );
        // Participants cannot add.
        let err = store.add_participant(&d.id, "p", "r", 2_001).unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));
    }

    #[test]
    fn leave_rules() {
        let store = mem();
        let d = seed_group(&store);
        assert!(matches!(
            store.leave_group(&d.id, "f").unwrap_err(),
            StoreError::RoleViolation(_)
        ));
        assert!(matches!(
            store.leave_group(&d.id, "e").unwrap_err(),
            StoreError::RoleViolation(_)
        ));
        store.leave_group(&d.id, "p").unwrap();
        assert_eq!(store.participant_role(&d.id, "p").unwrap(), None);
        assert!(store.is_dialogue_deleted_for(&d.id, "p").unwrap());
    }

    #[test]
    fn transfer_founder_keeps_exactly_one_founder() {
        let store = mem();
        let d = seed_group(&store);
        // Scenario B: F transfers to elder E.
        let change = store.transfer_founder(&d.id, "f", "e").unwrap();
        assert_eq!(
            change,
            RoleChange::FounderTransferred {
                old_founder: "f".to_string(),
                new_founder: "e".to_string(),
            }
        );
        assert_eq!(store.participant_role(&d.id, "e").unwrap(), Some(Role::Founder));
        assert_eq!(
            store.participant_role(&d.id, "f").unwrap(),
            Some(Role::Participant)
        );
        assert_eq!(founders(&store, &d.id).len(), 1);
    }

    #[test]
    fn transfer_requires_elder_target() {
        let store = mem();
        let d = seed_group(&store);
        let err = store.transfer_founder(&d.id, "f", "p").unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));
        assert_eq!(founders(&store, &d.id), vec!["f".to_string()]);
    }

    #[test]
    fn delete_group_founder_only() {
        let store = mem();
        let d = seed_group(&store);
        let err = store.delete_group(&d.id, "e").unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));
        assert!(store.dialogue(&d.id).unwrap().is_some());

        store.delete_group(&d.id, "f").unwrap();
        assert!(store.dialogue(&d.id).unwrap().is_none());
        assert!(store.participants(&d.id).unwrap().is_empty());
    }

    #[test]
    fn role_ops_rejected_on_direct_dialogues() {
        let store = mem();
        let d = seed_direct(&store);
        let err = store.promote_to_elder(&d.id, "a", "b").unwrap_err();
        assert!(matches!(err, StoreError::RoleViolation(_)));
    }
}

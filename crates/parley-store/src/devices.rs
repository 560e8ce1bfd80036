use crate::error::StoreError;
use crate::records::DeviceKey;
use crate::ChatStore;
use rusqlite::{params, OptionalExtension, Row};

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<DeviceKey> {
    Ok(DeviceKey {
        device_id: row.get(0)?,
        user_id: row.get(1)?,
        public_key: row.get(2)?,
        is_active: row.get(3)?,
        is_verified: row.get(4)?,
        last_used_at_ms: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        proof_expires_at_ms: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
    })
}

impl ChatStore {
    /// Register or rotate a device key. The verification workflow itself
    /// is external; this is the ingress it writes through.
    pub fn upsert_device_key(&self, key: &DeviceKey) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO device_keys (device_id, user_id, public_key, is_active, is_verified,
                                      last_used_at_ms, proof_expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (device_id) DO UPDATE SET
                 public_key = excluded.public_key,
                 is_active = excluded.is_active,
                 is_verified = excluded.is_verified,
                 proof_expires_at_ms = excluded.proof_expires_at_ms
             WHERE device_keys.user_id = excluded.user_id",
            params![
                key.device_id,
                key.user_id,
                key.public_key,
                key.is_active,
                key.is_verified,
                key.last_used_at_ms.map(|v| v as i64),
                key.proof_expires_at_ms.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    pub fn device_key(&self, device_id: &str) -> Result<Option<DeviceKey>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT device_id, user_id, public_key, is_active, is_verified,
                        last_used_at_ms, proof_expires_at_ms
                 FROM device_keys WHERE device_id = ?1",
                params![device_id],
                row_to_device,
            )
            .optional()?)
    }

    /// Gate check for sends: the device must belong to the user, be
    /// active and verified, and its proof-of-possession must not have
    /// expired.
    pub fn is_device_verified(
        &self,
        device_id: &str,
        user_id: &str,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let Some(key) = self.device_key(device_id)? else {
            return Ok(false);
        };
        Ok(key.user_id == user_id
            && key.is_active
            && key.is_verified
            && key.proof_expires_at_ms.is_none_or(|exp| exp > now_ms))
    }

    pub fn touch_device(&self, device_id: &str, now_ms: u64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE device_keys SET last_used_at_ms = ?2 WHERE device_id = ?1",
            params![device_id, now_ms as i64],
        )?;
        Ok(())
    }

    /// Active devices registered to any of the given users.
    pub fn active_devices_for_users(
        &self,
        user_ids: &[String],
    ) -> Result<Vec<DeviceKey>, StoreError> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT device_id, user_id, public_key, is_active, is_verified,
                    last_used_at_ms, proof_expires_at_ms
             FROM device_keys WHERE user_id = ?1 AND is_active = 1",
        )?;
        for user_id in user_ids {
            let devices = stmt
                .query_map(params![user_id], row_to_device)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            out.extend(devices);
        }
        Ok(out)
    }
}

use dashmap::DashMap;
use parley_proto::{ConnId, ServerEvent};
use tokio::sync::mpsc;
use tracing::debug;

pub fn dialogue_group(dialogue_id: &str) -> String {
    format!("dialogue:{dialogue_id}")
}

pub fn user_group(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub fn device_group(device_id: &str) -> String {
    format!("device:{device_id}")
}

/// In-process broadcast fabric: named groups of connection senders.
/// Publishing to a gone subscriber is logged and dropped; fan-out never
/// fails the operation that triggered it.
///
/// Every session subscribes to its user group, its device group, and
/// the dialogue group of each dialogue the user belongs to, with
/// membership changes grafting and detaching live sessions. One publish
/// to a dialogue group therefore reaches exactly the participants'
/// sessions, without a per-user fan-out loop.
#[derive(Default)]
pub struct Fabric {
    groups: DashMap<String, DashMap<ConnId, mpsc::Sender<ServerEvent>>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, group: &str, conn_id: &str, tx: mpsc::Sender<ServerEvent>) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(conn_id.to_string(), tx);
    }

    pub fn unsubscribe(&self, group: &str, conn_id: &str) {
        if let Some(members) = self.groups.get(group) {
            members.remove(conn_id);
        }
    }

    /// Drop a connection from every group it joined.
    pub fn unsubscribe_all(&self, conn_id: &str) {
        for members in self.groups.iter() {
            members.remove(conn_id);
        }
    }

    /// Current members of a group. Used to graft a user's live
    /// connections onto a dialogue they were just added to.
    pub fn members(&self, group: &str) -> Vec<(ConnId, mpsc::Sender<ServerEvent>)> {
        self.groups
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a group outright (e.g. a deleted dialogue).
    pub fn drop_group(&self, group: &str) {
        self.groups.remove(group);
    }

    pub async fn publish(&self, group: &str, event: &ServerEvent) {
        self.publish_excluding(group, event, None).await
    }

    /// Publish to every group member except `skip_conn`. Senders are
    /// cloned out of the map before any await.
    pub async fn publish_excluding(
        &self,
        group: &str,
        event: &ServerEvent,
        skip_conn: Option<&str>,
    ) {
        let targets: Vec<(ConnId, mpsc::Sender<ServerEvent>)> = match self.groups.get(group) {
            Some(members) => members
                .iter()
                .filter(|e| skip_conn != Some(e.key().as_str()))
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            None => return,
        };
        for (conn_id, tx) in targets {
            if tx.send(event.clone()).await.is_err() {
                debug!(group, conn = %conn_id, "subscriber gone, dropping");
                self.unsubscribe(group, &conn_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_but_excluded() {
        let fabric = Fabric::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        fabric.subscribe("dialogue:d1", "c1", tx1);
        fabric.subscribe("dialogue:d1", "c2", tx2);

        fabric
            .publish_excluding("dialogue:d1", &ServerEvent::Ping, Some("c1"))
            .await;
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(ServerEvent::Ping)));
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned() {
        let fabric = Fabric::new();
        let (tx, rx) = mpsc::channel(4);
        fabric.subscribe("user:u", "c1", tx);
        drop(rx);

        fabric.publish("user:u", &ServerEvent::Ping).await;
        assert!(fabric.members("user:u").is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_every_group() {
        let fabric = Fabric::new();
        let (tx, _rx) = mpsc::channel(4);
        fabric.subscribe("user:u", "c1", tx.clone());
        fabric.subscribe("dialogue:d1", "c1", tx);

        fabric.unsubscribe_all("c1");
        assert!(fabric.members("user:u").is_empty());
        assert!(fabric.members("dialogue:d1").is_empty());
    }
}

//! Cluster membership on etcd. Each replica advertises itself under
//! `members/{id}` bound to a short lease; a prefix watch keeps the live
//! member map current, and the lowest live id is announced as leader. The
//! leader role is operational only — proposals never consult it.

use std::collections::HashMap;
use std::time::Duration;

use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::sync::RwLock;
use tracing::{info, warn};

use scoot_types::{NodeId, ScootError};

const MEMBER_PREFIX: &str = "members/";
/// Seconds until an unrefreshed membership entry expires.
const LEASE_TTL_SECS: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: NodeId,
    pub address: String,
}

type LeaderCallback = Box<dyn Fn(NodeId) + Send + Sync>;

struct MembershipInner {
    members: HashMap<NodeId, Member>,
    leader_id: Option<NodeId>,
}

pub struct Membership {
    client: Client,
    id: NodeId,
    address: String,
    inner: RwLock<MembershipInner>,
    on_leader_change: Option<LeaderCallback>,
}

impl Membership {
    /// Dial the coordination service. Failing here is fatal to startup.
    pub async fn connect(
        id: NodeId,
        address: impl Into<String>,
        endpoints: Vec<String>,
        dial_timeout: Duration,
    ) -> Result<Self, ScootError> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| ScootError::Transport(e.to_string()))?;

        Ok(Membership {
            client,
            id,
            address: address.into(),
            inner: RwLock::new(MembershipInner {
                members: HashMap::new(),
                leader_id: None,
            }),
            on_leader_change: None,
        })
    }

    /// Register a callback invoked whenever the elected leader changes.
    /// Must be set before `watch` starts.
    pub fn on_leader_change(&mut self, callback: impl Fn(NodeId) + Send + Sync + 'static) {
        self.on_leader_change = Some(Box::new(callback));
    }

    /// Advertise this replica under a lease and keep the lease alive in a
    /// background task. Losing the keepalive lets the entry expire, which
    /// is how peers learn the replica is gone.
    pub async fn start(&self) -> Result<(), ScootError> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(LEASE_TTL_SECS, None)
            .await
            .map_err(|e| ScootError::Transport(e.to_string()))?;
        client
            .put(
                format!("{MEMBER_PREFIX}{}", self.id),
                self.address.clone(),
                Some(PutOptions::new().with_lease(lease.id())),
            )
            .await
            .map_err(|e| ScootError::Transport(e.to_string()))?;

        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease.id())
            .await
            .map_err(|e| ScootError::Transport(e.to_string()))?;

        let id = self.id;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(LEASE_TTL_SECS as u64 / 2));
            loop {
                ticker.tick().await;
                if let Err(err) = keeper.keep_alive().await {
                    warn!(node_id = id, error = %err, "lease keepalive failed");
                    break;
                }
                match responses.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        warn!(node_id = id, "lease keepalive stream closed");
                        break;
                    }
                }
            }
        });

        info!(node_id = self.id, address = %self.address, "membership registered");
        Ok(())
    }

    /// Follow the member prefix forever: seed from a snapshot read, then
    /// fold watch events into the map, re-electing after every change.
    pub async fn watch(&self) -> Result<(), ScootError> {
        let mut client = self.client.clone();

        if let Ok(response) = client
            .get(MEMBER_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
        {
            {
                let mut g = self.inner.write().await;
                for kv in response.kvs() {
                    if let Some(member) = parse_member(kv.key(), kv.value()) {
                        g.members.insert(member.id, member);
                    }
                }
            }
            self.elect_leader().await;
        }

        let (_watcher, mut stream) = client
            .watch(MEMBER_PREFIX, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| ScootError::Transport(e.to_string()))?;

        while let Ok(Some(response)) = stream.message().await {
            for event in response.events() {
                let Some(kv) = event.kv() else { continue };
                match event.event_type() {
                    EventType::Put => {
                        if let Some(member) = parse_member(kv.key(), kv.value()) {
                            info!(id = member.id, address = %member.address, "member joined");
                            self.inner.write().await.members.insert(member.id, member);
                        }
                    }
                    EventType::Delete => {
                        if let Some(id) = parse_member_id(kv.key()) {
                            info!(id, "member left");
                            self.inner.write().await.members.remove(&id);
                        }
                    }
                }
            }
            self.elect_leader().await;
        }
        Ok(())
    }

    async fn elect_leader(&self) {
        let mut g = self.inner.write().await;
        let Some(new_leader) = lowest_member_id(&g.members) else {
            return;
        };
        if g.leader_id != Some(new_leader) {
            g.leader_id = Some(new_leader);
            drop(g);
            info!(leader_id = new_leader, "leader elected");
            if let Some(callback) = &self.on_leader_change {
                callback(new_leader);
            }
        }
    }

    pub async fn members(&self) -> Vec<Member> {
        self.inner.read().await.members.values().cloned().collect()
    }

    pub async fn leader_id(&self) -> Option<NodeId> {
        self.inner.read().await.leader_id
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.read().await.leader_id == Some(self.id)
    }
}

/// Deterministic election: the lowest live id wins.
fn lowest_member_id(members: &HashMap<NodeId, Member>) -> Option<NodeId> {
    members.keys().min().copied()
}

fn parse_member_id(key: &[u8]) -> Option<NodeId> {
    std::str::from_utf8(key)
        .ok()?
        .strip_prefix(MEMBER_PREFIX)?
        .parse()
        .ok()
}

fn parse_member(key: &[u8], value: &[u8]) -> Option<Member> {
    Some(Member {
        id: parse_member_id(key)?,
        address: String::from_utf8(value.to_vec()).ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: NodeId) -> Member {
        Member {
            id,
            address: format!("10.0.0.{id}:26000"),
        }
    }

    #[test]
    fn parses_member_keys() {
        let parsed = parse_member(b"members/3", b"10.0.0.3:26000").unwrap();
        assert_eq!(parsed.id, 3);
        assert_eq!(parsed.address, "10.0.0.3:26000");

        assert!(parse_member(b"members/", b"x").is_none());
        assert!(parse_member(b"members/abc", b"x").is_none());
        assert!(parse_member(b"leases/3", b"x").is_none());
    }

    #[test]
    fn lowest_live_id_wins_the_election() {
        let mut members = HashMap::new();
        assert_eq!(lowest_member_id(&members), None);

        members.insert(2, member(2));
        members.insert(3, member(3));
        assert_eq!(lowest_member_id(&members), Some(2));

        members.insert(1, member(1));
        assert_eq!(lowest_member_id(&members), Some(1));

        // The leader's entry expiring promotes the next lowest id.
        members.remove(&1);
        assert_eq!(lowest_member_id(&members), Some(2));
    }
}

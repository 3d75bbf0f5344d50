//! # Repository
//!
//! Persistence capability for finalized records. The node stores accepted
//! market data through it; voting itself never persists anything.
//!
//! `MemoryRepository` keeps everything in `RwLock`-guarded maps and is what
//! the node uses out of the box. A durable backend implements the same trait.

use crate::error::{Result, TallyError};
use crate::market_data::{DataType, MarketData};
use crate::peer::{Peer, PeerRole};
use crate::types::PeerId;
use crate::vote::Vote;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stake a peer has locked in the network
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stake {
    pub id: String,
    pub peer_id: PeerId,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
    /// Stake cannot be withdrawn before this time
    pub locked_until: Option<DateTime<Utc>>,
}

impl Stake {
    pub fn new(peer_id: PeerId, amount: f64, locked_until: Option<DateTime<Utc>>) -> Result<Self> {
        if peer_id.is_empty() {
            return Err(TallyError::Validation("stake has empty peer id".into()));
        }
        if !(amount > 0.0) {
            return Err(TallyError::Validation(format!(
                "stake amount must be positive, got {}",
                amount
            )));
        }
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_id,
            amount,
            created_at: Utc::now(),
            locked_until,
        })
    }

    /// Whether the lock is still in force at `now`
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map_or(false, |until| now < until)
    }
}

/// Query parameters for market data listings
#[derive(Clone, Debug, Default)]
pub struct MarketDataFilter {
    pub symbol: Option<String>,
    pub source: Option<String>,
    pub data_type: Option<DataType>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of records, 0 for no limit
    pub limit: usize,
    pub offset: usize,
}

impl MarketDataFilter {
    fn matches(&self, data: &MarketData) -> bool {
        self.symbol.as_ref().map_or(true, |s| &data.symbol == s)
            && self.source.as_ref().map_or(true, |s| &data.source == s)
            && self.data_type.map_or(true, |t| data.data_type == t)
            && self.min_price.map_or(true, |p| data.price >= p)
            && self.max_price.map_or(true, |p| data.price <= p)
            && self.from.map_or(true, |t| data.timestamp >= t)
            && self.to.map_or(true, |t| data.timestamp <= t)
    }
}

/// Query parameters for peer listings
#[derive(Clone, Debug, Default)]
pub struct PeerFilter {
    pub min_reputation: Option<f64>,
    pub max_reputation: Option<f64>,
    pub connected: Option<bool>,
    /// Peer must carry every listed role
    pub roles: Vec<PeerRole>,
    /// Maximum number of records, 0 for no limit
    pub limit: usize,
    pub offset: usize,
}

impl PeerFilter {
    fn matches(&self, peer: &Peer) -> bool {
        self.min_reputation.map_or(true, |r| peer.reputation >= r)
            && self.max_reputation.map_or(true, |r| peer.reputation <= r)
            && self.connected.map_or(true, |c| peer.connected == c)
            && self.roles.iter().all(|r| peer.has_role(*r))
    }
}

/// Persistence operations for market data, votes, peers and stakes
#[async_trait]
pub trait Repository: Send + Sync {
    // Market data
    async fn save_market_data(&self, data: &MarketData) -> Result<()>;
    async fn get_market_data(&self, id: &str) -> Result<MarketData>;
    async fn list_market_data(&self, filter: &MarketDataFilter) -> Result<Vec<MarketData>>;
    async fn update_market_data(&self, data: &MarketData) -> Result<()>;
    async fn delete_market_data(&self, id: &str) -> Result<()>;

    // Votes
    async fn save_vote(&self, vote: &Vote) -> Result<()>;
    async fn votes_by_market_data(&self, market_data_id: &str) -> Result<Vec<Vote>>;
    async fn votes_by_validator(&self, validator_id: &PeerId) -> Result<Vec<Vote>>;

    // Peers
    async fn save_peer(&self, peer: &Peer) -> Result<()>;
    async fn get_peer(&self, id: &PeerId) -> Result<Peer>;
    async fn list_peers(&self, filter: &PeerFilter) -> Result<Vec<Peer>>;
    async fn update_peer(&self, peer: &Peer) -> Result<()>;
    async fn delete_peer(&self, id: &PeerId) -> Result<()>;

    // Stakes
    async fn save_stake(&self, stake: &Stake) -> Result<()>;
    async fn get_stake(&self, id: &str) -> Result<Stake>;
    async fn stakes_by_peer(&self, peer_id: &PeerId) -> Result<Vec<Stake>>;
    async fn update_stake(&self, stake: &Stake) -> Result<()>;
}

fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

/// In-memory repository
pub struct MemoryRepository {
    market_data: RwLock<HashMap<String, MarketData>>,
    votes: RwLock<Vec<Vote>>,
    peers: RwLock<HashMap<PeerId, Peer>>,
    stakes: RwLock<HashMap<String, Stake>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            market_data: RwLock::new(HashMap::new()),
            votes: RwLock::new(Vec::new()),
            peers: RwLock::new(HashMap::new()),
            stakes: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored market data records
    pub fn market_data_count(&self) -> usize {
        self.market_data.read().len()
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_market_data(&self, data: &MarketData) -> Result<()> {
        data.validate()?;
        let mut store = self.market_data.write();
        if store.contains_key(&data.id) {
            return Err(TallyError::Conflict(format!("market data {} exists", data.id)));
        }
        store.insert(data.id.clone(), data.clone());
        Ok(())
    }

    async fn get_market_data(&self, id: &str) -> Result<MarketData> {
        self.market_data
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TallyError::NotFound(format!("market data {}", id)))
    }

    async fn list_market_data(&self, filter: &MarketDataFilter) -> Result<Vec<MarketData>> {
        let mut items: Vec<MarketData> = self
            .market_data
            .read()
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        // Newest first
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(paginate(items, filter.offset, filter.limit))
    }

    async fn update_market_data(&self, data: &MarketData) -> Result<()> {
        data.validate()?;
        let mut store = self.market_data.write();
        match store.get_mut(&data.id) {
            Some(existing) => {
                *existing = data.clone();
                Ok(())
            }
            None => Err(TallyError::NotFound(format!("market data {}", data.id))),
        }
    }

    async fn delete_market_data(&self, id: &str) -> Result<()> {
        self.market_data
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TallyError::NotFound(format!("market data {}", id)))
    }

    async fn save_vote(&self, vote: &Vote) -> Result<()> {
        vote.validate()?;
        self.votes.write().push(vote.clone());
        Ok(())
    }

    async fn votes_by_market_data(&self, market_data_id: &str) -> Result<Vec<Vote>> {
        Ok(self
            .votes
            .read()
            .iter()
            .filter(|v| v.market_data_id == market_data_id)
            .cloned()
            .collect())
    }

    async fn votes_by_validator(&self, validator_id: &PeerId) -> Result<Vec<Vote>> {
        Ok(self
            .votes
            .read()
            .iter()
            .filter(|v| &v.validator_id == validator_id)
            .cloned()
            .collect())
    }

    async fn save_peer(&self, peer: &Peer) -> Result<()> {
        let mut store = self.peers.write();
        if store.contains_key(&peer.id) {
            return Err(TallyError::Conflict(format!("peer {} exists", peer.id)));
        }
        store.insert(peer.id.clone(), peer.clone());
        Ok(())
    }

    async fn get_peer(&self, id: &PeerId) -> Result<Peer> {
        self.peers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TallyError::NotFound(format!("peer {}", id)))
    }

    async fn list_peers(&self, filter: &PeerFilter) -> Result<Vec<Peer>> {
        let mut peers: Vec<Peer> = self
            .peers
            .read()
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        peers.sort_by(|a, b| {
            b.reputation
                .partial_cmp(&a.reputation)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(paginate(peers, filter.offset, filter.limit))
    }

    async fn update_peer(&self, peer: &Peer) -> Result<()> {
        let mut store = self.peers.write();
        match store.get_mut(&peer.id) {
            Some(existing) => {
                *existing = peer.clone();
                Ok(())
            }
            None => Err(TallyError::NotFound(format!("peer {}", peer.id))),
        }
    }

    async fn delete_peer(&self, id: &PeerId) -> Result<()> {
        self.peers
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TallyError::NotFound(format!("peer {}", id)))
    }

    async fn save_stake(&self, stake: &Stake) -> Result<()> {
        let mut store = self.stakes.write();
        if store.contains_key(&stake.id) {
            return Err(TallyError::Conflict(format!("stake {} exists", stake.id)));
        }
        store.insert(stake.id.clone(), stake.clone());
        Ok(())
    }

    async fn get_stake(&self, id: &str) -> Result<Stake> {
        self.stakes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TallyError::NotFound(format!("stake {}", id)))
    }

    async fn stakes_by_peer(&self, peer_id: &PeerId) -> Result<Vec<Stake>> {
        Ok(self
            .stakes
            .read()
            .values()
            .filter(|s| &s.peer_id == peer_id)
            .cloned()
            .collect())
    }

    async fn update_stake(&self, stake: &Stake) -> Result<()> {
        let mut store = self.stakes.write();
        match store.get_mut(&stake.id) {
            Some(existing) => {
                *existing = stake.clone();
                Ok(())
            }
            None => Err(TallyError::NotFound(format!("stake {}", stake.id))),
        }
    }
}

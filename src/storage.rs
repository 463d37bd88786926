//! Persistence of captured exchanges.
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::errors::{Error, Result};
use crate::record::CapturedExchange;

/// Where captured exchanges go. Implementations must accept concurrent inserts.
#[async_trait]
pub trait Repository: Send + Sync {
  /// Persist one exchange and return the identifier assigned to it.
  async fn create(&self, exchange: CapturedExchange) -> Result<u64>;
  /// Fetch one exchange. Fails with [`Error::NotFound`] when `id` is unused.
  async fn read_one(&self, id: u64) -> Result<CapturedExchange>;
  /// Every stored exchange in insertion order.
  async fn read_all(&self) -> Result<Vec<CapturedExchange>>;
}

/// In-process repository. Ids start at 1 and increase by one per insert.
#[derive(Debug, Default)]
pub struct MemoryRepository {
  exchanges: RwLock<Vec<CapturedExchange>>,
}

impl MemoryRepository {
  /// Empty repository.
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Repository for MemoryRepository {
  async fn create(&self, mut exchange: CapturedExchange) -> Result<u64> {
    let mut exchanges = self.exchanges.write().await;
    let id = exchanges.len() as u64 + 1;
    exchange.id = id;
    exchange.created_at = OffsetDateTime::now_utc();
    exchanges.push(exchange);
    tracing::debug!(id, "exchange stored");
    Ok(id)
  }

  async fn read_one(&self, id: u64) -> Result<CapturedExchange> {
    let exchanges = self.exchanges.read().await;
    id.checked_sub(1)
      .and_then(|index| exchanges.get(index as usize))
      .cloned()
      .ok_or(Error::NotFound(id))
  }

  async fn read_all(&self) -> Result<Vec<CapturedExchange>> {
    Ok(self.exchanges.read().await.clone())
  }
}

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{Region, RegionHeartbeatResponse, Store, StoreId, StoreStats};

/// Stream of scheduling decisions pushed back to a node.
pub type ResponseStream = mpsc::UnboundedReceiver<RegionHeartbeatResponse>;

/// Client surface a node uses to talk to the scheduler under test.
///
/// Region heartbeats are fire-and-forget; decisions arrive asynchronously on
/// the stream returned by [`SchedulerClient::take_response_stream`].
#[async_trait]
pub trait SchedulerClient: Send + Sync + 'static {
    async fn bootstrap(&self, store: Store, region: Region) -> anyhow::Result<()>;

    async fn put_store(&self, store: Store) -> anyhow::Result<()>;

    async fn store_heartbeat(&self, stats: StoreStats) -> anyhow::Result<()>;

    async fn region_heartbeat(&self, region: Region) -> anyhow::Result<()>;

    /// Hands out the response stream. Returns `None` once it has been taken.
    fn take_response_stream(&self) -> Option<ResponseStream>;

    /// Allocates an id that is unique and increasing from this client's view.
    async fn alloc_id(&self) -> anyhow::Result<u64>;

    /// Closes the client. Calling it more than once is a no-op.
    async fn close(&self);
}

/// Produces one client per store.
pub trait SchedulerConnector: Send + Sync + 'static {
    fn connect(&self, store_id: StoreId) -> anyhow::Result<Arc<dyn SchedulerClient>>;
}

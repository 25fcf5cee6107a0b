use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{PendingRequestRecord, RequestId, Topic};

/// Durable request/response correlation records.
///
/// The relay interactor inserts a record before every outbound request and on
/// every first inbound request; a response mutates the record exactly once.
#[async_trait]
pub trait RequestHistory: Send + Sync {
    /// Insert a record for a not-yet-seen id.
    ///
    /// Returns `false` without writing when a record for this id already
    /// exists; the caller uses this both as the in-flight duplicate guard on
    /// the outbound path and as the resend filter on the inbound path.
    async fn set_request(&self, record: PendingRequestRecord) -> Result<bool, StoreError>;

    /// Attach the response body to the record for `id`.
    ///
    /// Returns `true` when the response was recorded, `false` when the record
    /// already carried one (duplicate response). Unknown ids are `NotFound`.
    async fn update_with_response(
        &self,
        id: RequestId,
        response: String,
    ) -> Result<bool, StoreError>;

    async fn get(&self, id: RequestId) -> Result<Option<PendingRequestRecord>, StoreError>;

    async fn exists(&self, id: RequestId) -> Result<bool, StoreError>;

    /// Prune every record for a deleted topic.
    async fn delete_by_topic(&self, topic: &Topic) -> Result<(), StoreError>;
}

//! Quota ledger.

use crate::error::MetadataResult;
use crate::models::{QuotaReservationRow, QuotaUsage};
use async_trait::async_trait;
use uuid::Uuid;

/// Per-owner storage allotment with reservations keyed by upload session.
///
/// `finalize` and `release` report whether they changed anything so that
/// callers can tell the first effective call from replays.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Reserve `amount` bytes for `owner_id` under `key`.
    ///
    /// Fails with `QuotaExceeded` when the remaining allotment is smaller
    /// than `amount`. Reserving an existing key is a no-op.
    async fn reserve(&self, owner_id: &str, amount: u64, key: Uuid) -> MetadataResult<()>;

    /// Convert a reservation into permanent usage.
    async fn finalize(&self, key: Uuid) -> MetadataResult<bool>;

    /// Return a reservation (or its usage) to the owner's allotment.
    async fn release(&self, key: Uuid) -> MetadataResult<bool>;

    /// Get a reservation by key.
    async fn get_reservation(&self, key: Uuid) -> MetadataResult<Option<QuotaReservationRow>>;

    /// Current limit and totals for an owner.
    async fn usage(&self, owner_id: &str) -> MetadataResult<QuotaUsage>;

    /// Set an explicit limit for an owner.
    async fn set_limit(&self, owner_id: &str, limit_bytes: u64) -> MetadataResult<()>;
}

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::client::{
    ApiClient, ClientRecord, ClientSettings, ClientStatus, Reservation, TierLimits, UsagePeriods,
};
use crate::error::StoreError;

/// Trait for API client storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`).
///
/// A metered call holds a slot from `reserve_call` until it either completes
/// with `record_usage` or gives the slot back with `release_call`. Checking
/// the tier caps and taking the slot is a single atomic step, so concurrent
/// calls cannot overshoot a cap. `record_usage` applies the usage increment
/// and the billing increment as one unit: no reader may observe one without
/// the other.
pub trait ClientStore: Send + Sync {
    /// Insert a new client. Fails with `Duplicate` if the id or key hash exists.
    fn insert(&self, record: ClientRecord) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<ClientRecord>, StoreError>;

    fn find_by_key_hash(&self, api_key_hash: &str) -> Result<Option<ClientRecord>, StoreError>;

    fn set_status(&self, id: &str, status: ClientStatus) -> Result<ApiClient, StoreError>;

    /// Swap the API key hash. The old hash stops resolving immediately.
    fn replace_key(
        &self,
        id: &str,
        api_key_hash: &str,
        key_prefix: &str,
    ) -> Result<ApiClient, StoreError>;

    fn update_settings(&self, id: &str, settings: ClientSettings) -> Result<ApiClient, StoreError>;

    /// Hold a slot under the client's tier caps, counting both recorded and
    /// still-running calls.
    fn reserve_call(
        &self,
        id: &str,
        limits: &TierLimits,
        periods: &UsagePeriods,
    ) -> Result<Reservation, StoreError>;

    /// Give back a slot held by a call that will not be recorded.
    fn release_call(&self, id: &str) -> Result<(), StoreError>;

    /// Count one successful call to `endpoint`, add `cost` to the billing
    /// accumulator and free the call's slot. A lapsed billing cycle is reset
    /// before the cost is added. Returns the client after the update.
    fn record_usage(
        &self,
        id: &str,
        endpoint: &str,
        cost: Decimal,
        periods: &UsagePeriods,
    ) -> Result<ApiClient, StoreError>;

    fn list(&self) -> Result<Vec<ApiClient>, StoreError>;
}

/// In-memory client store backed by DashMap. Each client is locked only for
/// the duration of its own update.
#[derive(Debug, Default)]
pub struct InMemoryClientStore {
    clients: DashMap<String, Slot>,
    /// api key hash -> client id
    key_index: DashMap<String, String>,
}

#[derive(Debug)]
struct Slot {
    record: ClientRecord,
    /// Reserved calls not yet recorded or released.
    in_flight: u64,
}

impl InMemoryClientStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<T, F>(&self, id: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Slot) -> T,
    {
        let mut slot = self
            .clients
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(f(&mut slot))
    }

    fn update<F>(&self, id: &str, f: F) -> Result<ApiClient, StoreError>
    where
        F: FnOnce(&mut ClientRecord),
    {
        self.with_slot(id, |slot| {
            f(&mut slot.record);
            slot.record.client.clone()
        })
    }
}

impl ClientStore for InMemoryClientStore {
    fn insert(&self, record: ClientRecord) -> Result<(), StoreError> {
        match self.key_index.entry(record.api_key_hash.clone()) {
            Entry::Occupied(_) => return Err(StoreError::Duplicate),
            Entry::Vacant(v) => {
                v.insert(record.client.id.clone());
            }
        }
        match self.clients.entry(record.client.id.clone()) {
            Entry::Occupied(_) => {
                self.key_index.remove(&record.api_key_hash);
                Err(StoreError::Duplicate)
            }
            Entry::Vacant(v) => {
                v.insert(Slot {
                    record,
                    in_flight: 0,
                });
                Ok(())
            }
        }
    }

    fn get(&self, id: &str) -> Result<Option<ClientRecord>, StoreError> {
        Ok(self.clients.get(id).map(|s| s.record.clone()))
    }

    fn find_by_key_hash(&self, api_key_hash: &str) -> Result<Option<ClientRecord>, StoreError> {
        let Some(id) = self.key_index.get(api_key_hash).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self
            .clients
            .get(&id)
            .filter(|s| s.record.api_key_hash == api_key_hash)
            .map(|s| s.record.clone()))
    }

    fn set_status(&self, id: &str, status: ClientStatus) -> Result<ApiClient, StoreError> {
        self.update(id, |r| r.client.status = status)
    }

    fn replace_key(
        &self,
        id: &str,
        api_key_hash: &str,
        key_prefix: &str,
    ) -> Result<ApiClient, StoreError> {
        match self.key_index.entry(api_key_hash.to_string()) {
            Entry::Occupied(_) => return Err(StoreError::Duplicate),
            Entry::Vacant(v) => {
                v.insert(id.to_string());
            }
        }

        let mut old_hash = None;
        let result = self.update(id, |r| {
            old_hash = Some(std::mem::replace(
                &mut r.api_key_hash,
                api_key_hash.to_string(),
            ));
            r.client.key_prefix = key_prefix.to_string();
        });

        match (&result, old_hash) {
            (Ok(_), Some(old)) => {
                self.key_index.remove(&old);
            }
            _ => {
                self.key_index.remove(api_key_hash);
            }
        }
        result
    }

    fn update_settings(&self, id: &str, settings: ClientSettings) -> Result<ApiClient, StoreError> {
        self.update(id, |r| r.client.settings = settings)
    }

    fn reserve_call(
        &self,
        id: &str,
        limits: &TierLimits,
        periods: &UsagePeriods,
    ) -> Result<Reservation, StoreError> {
        self.with_slot(id, |slot| {
            let reservation = slot.record.client.usage.reserve(limits, periods, slot.in_flight);
            if let Reservation::Granted { .. } = reservation {
                slot.in_flight += 1;
            }
            reservation
        })
    }

    fn release_call(&self, id: &str) -> Result<(), StoreError> {
        self.with_slot(id, |slot| slot.in_flight = slot.in_flight.saturating_sub(1))
    }

    fn record_usage(
        &self,
        id: &str,
        endpoint: &str,
        cost: Decimal,
        periods: &UsagePeriods,
    ) -> Result<ApiClient, StoreError> {
        // Usage, billing and the slot all change under the same shard guard.
        self.with_slot(id, |slot| {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            let client = &mut slot.record.client;
            client.usage.record(endpoint, periods);
            client.billing.accrue(cost, periods.now);
            client.clone()
        })
    }

    fn list(&self) -> Result<Vec<ApiClient>, StoreError> {
        let mut clients: Vec<ApiClient> = self.clients.iter().map(|s| s.record.client.clone()).collect();
        clients.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(clients)
    }
}

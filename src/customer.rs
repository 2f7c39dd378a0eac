//! Unifies the three identifiers a referred customer can be seen under.
//!
//! Keys are tried strongest first (storefront id, billing id, email). A hit
//! through one key backfills any key the row is missing; existing keys are
//! never overwritten.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ledger::{LedgerError, LedgerResult, LedgerStore};
use crate::types::ReferredCustomer;

/// Identifiers observed on one event. Any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerKeys {
    pub storefront_id: Option<String>,
    pub billing_id: Option<String>,
    pub email: Option<String>,
}

impl CustomerKeys {
    pub fn new(
        storefront_id: Option<String>,
        billing_id: Option<String>,
        email: Option<String>,
    ) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        Self {
            storefront_id: clean(storefront_id),
            billing_id: clean(billing_id),
            email: clean(email).map(|e| e.to_lowercase()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.storefront_id.is_none() && self.billing_id.is_none() && self.email.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CustomerResolution {
    /// Found, and the row already carried every observed key.
    FoundExact(ReferredCustomer),
    /// Found, and missing keys were written onto the row.
    FoundAndBackfilled(ReferredCustomer),
    NotFound,
}

impl CustomerResolution {
    pub fn customer(&self) -> Option<&ReferredCustomer> {
        match self {
            Self::FoundExact(c) | Self::FoundAndBackfilled(c) => Some(c),
            Self::NotFound => None,
        }
    }
}

/// Fills every `None` key on `existing` from `observed`. Returns whether
/// anything changed.
pub fn backfill(existing: &mut ReferredCustomer, observed: &CustomerKeys) -> bool {
    let mut changed = false;
    let pairs = [
        (&mut existing.storefront_customer_id, &observed.storefront_id),
        (&mut existing.billing_customer_id, &observed.billing_id),
        (&mut existing.email, &observed.email),
    ];
    for (slot, value) in pairs {
        if slot.is_none() {
            if let Some(v) = value {
                *slot = Some(v.clone());
                changed = true;
            }
        }
    }
    changed
}

pub struct CustomerResolver<'a> {
    ledger: &'a dyn LedgerStore,
}

impl<'a> CustomerResolver<'a> {
    pub fn new(ledger: &'a dyn LedgerStore) -> Self {
        Self { ledger }
    }

    async fn lookup(&self, keys: &CustomerKeys) -> LedgerResult<Option<ReferredCustomer>> {
        if let Some(id) = &keys.storefront_id {
            if let Some(c) = self.ledger.find_customer_by_storefront_id(id).await? {
                return Ok(Some(c));
            }
        }
        if let Some(id) = &keys.billing_id {
            if let Some(c) = self.ledger.find_customer_by_billing_id(id).await? {
                return Ok(Some(c));
            }
        }
        if let Some(email) = &keys.email {
            return self.ledger.find_customer_by_email(email).await;
        }
        Ok(None)
    }

    pub async fn resolve(&self, keys: &CustomerKeys) -> LedgerResult<CustomerResolution> {
        let Some(mut customer) = self.lookup(keys).await? else {
            return Ok(CustomerResolution::NotFound);
        };
        if !backfill(&mut customer, keys) {
            return Ok(CustomerResolution::FoundExact(customer));
        }
        match self.ledger.update_customer_keys(&customer).await {
            Ok(()) => Ok(CustomerResolution::FoundAndBackfilled(customer)),
            // The key we tried to backfill belongs to another row; keep this one as-is.
            Err(LedgerError::Conflict(_)) => {
                let unchanged = self.lookup(keys).await?;
                Ok(unchanged.map_or(CustomerResolution::NotFound, CustomerResolution::FoundExact))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves the customer, creating a row credited to `affiliate_id` when
    /// none exists yet. An existing row keeps its original affiliate.
    pub async fn resolve_or_create(
        &self,
        keys: &CustomerKeys,
        affiliate_id: Uuid,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<(ReferredCustomer, CustomerResolution)> {
        let resolution = self.resolve(keys).await?;
        if let Some(existing) = resolution.customer() {
            return Ok((existing.clone(), resolution));
        }

        let customer = ReferredCustomer {
            id: Uuid::new_v4(),
            affiliate_id,
            storefront_customer_id: keys.storefront_id.clone(),
            billing_customer_id: keys.billing_id.clone(),
            email: keys.email.clone(),
            first_order_id: order_id.to_string(),
            created_at: now,
        };
        match self.ledger.insert_customer(&customer).await {
            Ok(()) => Ok((customer, CustomerResolution::NotFound)),
            // Lost a race with a concurrent first order for the same customer.
            Err(LedgerError::Conflict(_)) => match self.resolve(keys).await? {
                CustomerResolution::NotFound => Err(LedgerError::Conflict(format!(
                    "customer for order {order_id} vanished after conflict"
                ))),
                found => {
                    let existing = found.customer().cloned().ok_or_else(|| {
                        LedgerError::not_found("customer", order_id)
                    })?;
                    Ok((existing, found))
                }
            },
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    fn keys(storefront: Option<&str>, billing: Option<&str>, email: Option<&str>) -> CustomerKeys {
        CustomerKeys::new(
            storefront.map(String::from),
            billing.map(String::from),
            email.map(String::from),
        )
    }

    #[test]
    fn keys_are_trimmed_and_email_lowercased() {
        let k = keys(Some(" 42 "), Some(""), Some("Ann@Example.COM"));
        assert_eq!(k.storefront_id.as_deref(), Some("42"));
        assert_eq!(k.billing_id, None);
        assert_eq!(k.email.as_deref(), Some("ann@example.com"));
    }

    #[tokio::test]
    async fn first_sighting_creates_row() {
        let ledger = MemoryLedger::new();
        let resolver = CustomerResolver::new(&ledger);
        let affiliate = Uuid::new_v4();

        let (customer, resolution) = resolver
            .resolve_or_create(&keys(Some("42"), None, Some("ann@example.com")), affiliate, "1001", Utc::now())
            .await
            .unwrap();

        assert_eq!(resolution, CustomerResolution::NotFound);
        assert_eq!(customer.affiliate_id, affiliate);
        assert_eq!(ledger.customers().await.len(), 1);
    }

    #[tokio::test]
    async fn later_billing_id_is_backfilled_via_email() {
        let ledger = MemoryLedger::new();
        let resolver = CustomerResolver::new(&ledger);
        let affiliate = Uuid::new_v4();
        resolver
            .resolve_or_create(&keys(Some("42"), None, Some("ann@example.com")), affiliate, "1001", Utc::now())
            .await
            .unwrap();

        let resolution = resolver
            .resolve(&keys(None, Some("cus_9"), Some("ANN@example.com")))
            .await
            .unwrap();

        let CustomerResolution::FoundAndBackfilled(customer) = resolution else {
            panic!("expected backfill, got {resolution:?}");
        };
        assert_eq!(customer.billing_customer_id.as_deref(), Some("cus_9"));
        assert_eq!(customer.storefront_customer_id.as_deref(), Some("42"));

        let again = resolver.resolve(&keys(None, Some("cus_9"), None)).await.unwrap();
        assert!(matches!(again, CustomerResolution::FoundExact(_)));
        assert_eq!(ledger.customers().await.len(), 1);
    }

    #[tokio::test]
    async fn backfill_never_steals_another_customers_key() {
        let ledger = MemoryLedger::new();
        let resolver = CustomerResolver::new(&ledger);
        let (ann, _) = resolver
            .resolve_or_create(&keys(Some("42"), None, Some("ann@example.com")), Uuid::new_v4(), "1001", Utc::now())
            .await
            .unwrap();
        let (bob, _) = resolver
            .resolve_or_create(&keys(None, Some("cus_9"), Some("bob@example.com")), Uuid::new_v4(), "2001", Utc::now())
            .await
            .unwrap();

        let resolution = resolver.resolve(&keys(Some("42"), Some("cus_9"), None)).await.unwrap();

        let CustomerResolution::FoundExact(found) = resolution else {
            panic!("expected the storefront match unchanged, got {resolution:?}");
        };
        assert_eq!(found.id, ann.id);
        assert_eq!(found.billing_customer_id, None);
        let stored = ledger.customers().await;
        let bob_row = stored.iter().find(|c| c.id == bob.id).unwrap();
        assert_eq!(bob_row.billing_customer_id.as_deref(), Some("cus_9"));
        assert_eq!(stored.iter().filter(|c| c.billing_customer_id.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn existing_customer_keeps_original_affiliate() {
        let ledger = MemoryLedger::new();
        let resolver = CustomerResolver::new(&ledger);
        let first = Uuid::new_v4();
        resolver
            .resolve_or_create(&keys(Some("42"), None, None), first, "1001", Utc::now())
            .await
            .unwrap();

        let (customer, _) = resolver
            .resolve_or_create(&keys(Some("42"), None, None), Uuid::new_v4(), "1002", Utc::now())
            .await
            .unwrap();
        assert_eq!(customer.affiliate_id, first);
        assert_eq!(customer.first_order_id, "1001");
    }

    #[tokio::test]
    async fn no_keys_resolves_to_not_found() {
        let ledger = MemoryLedger::new();
        let resolver = CustomerResolver::new(&ledger);
        assert_eq!(
            resolver.resolve(&CustomerKeys::default()).await.unwrap(),
            CustomerResolution::NotFound
        );
    }
}

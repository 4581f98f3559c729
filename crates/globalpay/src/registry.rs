//! API client registry: credential issuance, validation and lifecycle.

use rust_decimal::Decimal;
use std::net::IpAddr;
use std::sync::Arc;

use crate::client::{
    ApiClient, Billing, ClientRecord, ClientSettings, ClientStatus, Credentials, NewClient,
    TierTable, UsageCounters, UsageReport, BILLING_CYCLE_SECS,
};
use crate::clock::Clock;
use crate::crypto::{
    credential_hash, generate_token, verify_credential, API_KEY_PREFIX, SECRET_KEY_PREFIX,
};
use crate::error::{RegistryError, StoreError};
use crate::client_store::ClientStore;

/// Characters of the API key kept on the record for display.
const KEY_PREFIX_LEN: usize = 12;

/// Caller attributes checked against a client's settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerContext<'a> {
    pub ip: Option<IpAddr>,
    pub origin: Option<&'a str>,
}

pub struct ClientRegistry {
    store: Arc<dyn ClientStore>,
    tiers: TierTable,
    pepper: Vec<u8>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("tiers", &self.tiers)
            .field("pepper", &"[REDACTED]")
            .finish()
    }
}

impl ClientRegistry {
    pub fn new(
        store: Arc<dyn ClientStore>,
        tiers: TierTable,
        pepper: impl Into<Vec<u8>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            tiers,
            pepper: pepper.into(),
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn ClientStore> {
        &self.store
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Register a client. The returned secret is never retrievable again.
    pub fn create_client(&self, profile: NewClient) -> Result<Credentials, RegistryError> {
        let name = profile.name.trim();
        if name.is_empty() || name.len() > 200 {
            return Err(RegistryError::InvalidProfile(
                "name must be 1-200 characters".to_string(),
            ));
        }
        let email = profile.email.trim();
        if !looks_like_email(email) {
            return Err(RegistryError::InvalidProfile("invalid email".to_string()));
        }
        validate_settings(&profile.settings)?;
        let limits = self.tiers.limits(profile.tier).ok_or_else(|| {
            RegistryError::InvalidProfile(format!("unknown tier {}", profile.tier.as_str()))
        })?;

        let now = self.clock.now();
        let client_id = format!("cli_{}", uuid::Uuid::new_v4().simple());
        let api_key = generate_token(API_KEY_PREFIX);
        let secret_key = generate_token(SECRET_KEY_PREFIX);

        let record = ClientRecord {
            client: ApiClient {
                id: client_id.clone(),
                name: name.to_string(),
                email: email.to_string(),
                tier: profile.tier,
                status: ClientStatus::Active,
                created_at: now,
                key_prefix: display_prefix(&api_key),
                usage: UsageCounters::default(),
                billing: Billing {
                    period_cost: Decimal::ZERO,
                    monthly_fee: limits.monthly_fee,
                    next_billing_at: now + BILLING_CYCLE_SECS,
                },
                settings: profile.settings,
            },
            api_key_hash: credential_hash(&self.pepper, &api_key),
            secret_hash: credential_hash(&self.pepper, &secret_key),
        };
        self.store.insert(record)?;

        tracing::info!(client_id = %client_id, tier = profile.tier.as_str(), "API client created");
        Ok(Credentials {
            client_id,
            api_key,
            secret_key,
        })
    }

    /// Reverse-lookup a key. Unknown keys and non-active clients are rejected.
    pub fn validate_key(&self, api_key: &str) -> Result<ApiClient, RegistryError> {
        if !api_key.starts_with(API_KEY_PREFIX) {
            return Err(RegistryError::InvalidKey);
        }
        let hash = credential_hash(&self.pepper, api_key);
        let record = self
            .store
            .find_by_key_hash(&hash)?
            .ok_or(RegistryError::InvalidKey)?;
        // The index lookup already matched; re-check in constant time so a
        // backend that matches loosely cannot admit a different key.
        if !verify_credential(&self.pepper, api_key, &record.api_key_hash) {
            return Err(RegistryError::InvalidKey);
        }
        if record.client.status != ClientStatus::Active {
            return Err(RegistryError::Suspended(record.client.id));
        }
        Ok(record.client)
    }

    /// Validate a key and enforce the client's IP allow-list and allowed domains.
    pub fn authorize(
        &self,
        api_key: &str,
        caller: CallerContext<'_>,
    ) -> Result<ApiClient, RegistryError> {
        let client = self.validate_key(api_key)?;
        let settings = &client.settings;

        if !settings.ip_allow_list.is_empty()
            && !caller
                .ip
                .is_some_and(|ip| settings.ip_allow_list.contains(&ip))
        {
            tracing::warn!(client_id = %client.id, ip = ?caller.ip, "request from address outside allow-list");
            return Err(RegistryError::IpNotAllowed);
        }

        if !settings.allowed_domains.is_empty() {
            if let Some(origin) = caller.origin {
                if !origin_allowed(origin, &settings.allowed_domains) {
                    return Err(RegistryError::OriginNotAllowed);
                }
            }
        }

        Ok(client)
    }

    pub fn verify_secret(&self, client_id: &str, secret_key: &str) -> Result<bool, RegistryError> {
        let record = self
            .store
            .get(client_id)?
            .ok_or_else(|| RegistryError::UnknownClient(client_id.to_string()))?;
        Ok(verify_credential(&self.pepper, secret_key, &record.secret_hash))
    }

    pub fn get_client(&self, client_id: &str) -> Result<ApiClient, RegistryError> {
        self.store
            .get(client_id)?
            .map(|r| r.client)
            .ok_or_else(|| RegistryError::UnknownClient(client_id.to_string()))
    }

    pub fn suspend_client(&self, client_id: &str) -> Result<ApiClient, RegistryError> {
        let client = self
            .store
            .set_status(client_id, ClientStatus::Suspended)
            .map_err(|e| not_found_as_unknown(e, client_id))?;
        tracing::warn!(client_id = %client_id, "API client suspended");
        Ok(client)
    }

    pub fn reactivate_client(&self, client_id: &str) -> Result<ApiClient, RegistryError> {
        let client = self
            .store
            .set_status(client_id, ClientStatus::Active)
            .map_err(|e| not_found_as_unknown(e, client_id))?;
        tracing::info!(client_id = %client_id, "API client reactivated");
        Ok(client)
    }

    /// Issue a new API key. The previous key stops validating immediately;
    /// the secret key is unchanged.
    pub fn rotate_key(&self, client_id: &str) -> Result<String, RegistryError> {
        let api_key = generate_token(API_KEY_PREFIX);
        self.store
            .replace_key(
                client_id,
                &credential_hash(&self.pepper, &api_key),
                &display_prefix(&api_key),
            )
            .map_err(|e| not_found_as_unknown(e, client_id))?;
        tracing::info!(client_id = %client_id, "API key rotated");
        Ok(api_key)
    }

    pub fn update_settings(
        &self,
        client_id: &str,
        settings: ClientSettings,
    ) -> Result<ApiClient, RegistryError> {
        validate_settings(&settings)?;
        self.store
            .update_settings(client_id, settings)
            .map_err(|e| not_found_as_unknown(e, client_id))
    }

    pub fn usage_report(&self, client_id: &str) -> Result<UsageReport, RegistryError> {
        let client = self.get_client(client_id)?;
        Ok(UsageReport::build(&client, self.clock.now()))
    }

    pub fn list_clients(&self) -> Result<Vec<ApiClient>, RegistryError> {
        Ok(self.store.list()?)
    }
}

fn not_found_as_unknown(e: StoreError, client_id: &str) -> RegistryError {
    match e {
        StoreError::NotFound(_) => RegistryError::UnknownClient(client_id.to_string()),
        other => RegistryError::Store(other),
    }
}

fn display_prefix(api_key: &str) -> String {
    api_key.chars().take(KEY_PREFIX_LEN).collect()
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && email.len() <= 254
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn validate_settings(settings: &ClientSettings) -> Result<(), RegistryError> {
    if let Some(webhook) = &settings.webhook_url {
        let parsed = url::Url::parse(webhook)
            .map_err(|_| RegistryError::InvalidProfile("invalid webhook URL".to_string()))?;
        if parsed.scheme() != "https" {
            return Err(RegistryError::InvalidProfile(
                "webhook URL must use https".to_string(),
            ));
        }
    }
    for domain in &settings.allowed_domains {
        if domain.trim().is_empty() || domain.contains('/') {
            return Err(RegistryError::InvalidProfile(format!(
                "invalid allowed domain {domain:?}"
            )));
        }
    }
    Ok(())
}

/// Match an `Origin` header's host against allowed domains. A domain also
/// admits its subdomains.
fn origin_allowed(origin: &str, allowed: &[String]) -> bool {
    let Some(host) = url::Url::parse(origin)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    else {
        return false;
    };
    allowed.iter().any(|d| {
        let d = d.trim().to_ascii_lowercase();
        host == d || host.ends_with(&format!(".{d}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::client::Tier;
    use crate::client_store::InMemoryClientStore;
    use crate::clock::ManualClock;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(
            Arc::new(InMemoryClientStore::new()),
            Catalog::builtin().tiers,
            b"test-pepper".to_vec(),
            Arc::new(ManualClock::new(1_700_000_000)),
        )
    }

    fn profile(tier: Tier) -> NewClient {
        NewClient {
            name: "Acme".into(),
            email: "ops@acme.test".into(),
            tier,
            settings: ClientSettings::default(),
        }
    }

    #[test]
    fn test_create_then_validate() {
        let reg = registry();
        let creds = reg.create_client(profile(Tier::Basic)).unwrap();
        assert!(creds.api_key.starts_with("gpk_"));
        assert!(creds.secret_key.starts_with("gps_"));
        assert_ne!(creds.api_key, creds.secret_key);

        let client = reg.validate_key(&creds.api_key).unwrap();
        assert_eq!(client.id, creds.client_id);
        assert_eq!(client.status, ClientStatus::Active);
        assert_eq!(client.usage.total, 0);
        assert_eq!(client.billing.period_cost, Decimal::ZERO);
        assert_eq!(client.billing.monthly_fee, Decimal::new(2_900, 2));
        assert_eq!(client.billing.next_billing_at, 1_700_000_000 + 30 * 86_400);
    }

    #[test]
    fn test_secret_is_not_a_valid_api_key() {
        let reg = registry();
        let creds = reg.create_client(profile(Tier::Free)).unwrap();
        assert!(matches!(
            reg.validate_key(&creds.secret_key),
            Err(RegistryError::InvalidKey)
        ));
        assert!(reg.verify_secret(&creds.client_id, &creds.secret_key).unwrap());
        assert!(!reg.verify_secret(&creds.client_id, "gps_wrong").unwrap());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.validate_key("gpk_doesnotexist"),
            Err(RegistryError::InvalidKey)
        ));
        assert!(matches!(reg.validate_key(""), Err(RegistryError::InvalidKey)));
    }

    #[test]
    fn test_suspended_client_rejected_until_reactivated() {
        let reg = registry();
        let creds = reg.create_client(profile(Tier::Basic)).unwrap();
        reg.suspend_client(&creds.client_id).unwrap();
        assert!(matches!(
            reg.validate_key(&creds.api_key),
            Err(RegistryError::Suspended(_))
        ));
        reg.reactivate_client(&creds.client_id).unwrap();
        assert!(reg.validate_key(&creds.api_key).is_ok());
    }

    #[test]
    fn test_rotate_key_invalidates_old_key() {
        let reg = registry();
        let creds = reg.create_client(profile(Tier::Basic)).unwrap();
        let new_key = reg.rotate_key(&creds.client_id).unwrap();
        assert!(reg.validate_key(&creds.api_key).is_err());
        let client = reg.validate_key(&new_key).unwrap();
        assert!(new_key.starts_with(&client.key_prefix));
        // Secret survives rotation
        assert!(reg.verify_secret(&creds.client_id, &creds.secret_key).unwrap());
    }

    #[test]
    fn test_lifecycle_on_unknown_client() {
        let reg = registry();
        assert!(matches!(
            reg.suspend_client("cli_missing"),
            Err(RegistryError::UnknownClient(_))
        ));
        assert!(matches!(
            reg.rotate_key("cli_missing"),
            Err(RegistryError::UnknownClient(_))
        ));
    }

    #[test]
    fn test_ip_allow_list_and_origin() {
        let reg = registry();
        let mut p = profile(Tier::Professional);
        p.settings = ClientSettings {
            webhook_url: Some("https://hooks.acme.test/usage".into()),
            ip_allow_list: vec!["203.0.113.7".parse().unwrap()],
            allowed_domains: vec!["acme.test".into()],
        };
        let creds = reg.create_client(p).unwrap();

        let ok = CallerContext {
            ip: Some("203.0.113.7".parse().unwrap()),
            origin: Some("https://app.acme.test"),
        };
        assert!(reg.authorize(&creds.api_key, ok).is_ok());

        let wrong_ip = CallerContext {
            ip: Some("198.51.100.1".parse().unwrap()),
            ..ok
        };
        assert!(matches!(
            reg.authorize(&creds.api_key, wrong_ip),
            Err(RegistryError::IpNotAllowed)
        ));

        let wrong_origin = CallerContext {
            origin: Some("https://evil-acme.test"),
            ..ok
        };
        assert!(matches!(
            reg.authorize(&creds.api_key, wrong_origin),
            Err(RegistryError::OriginNotAllowed)
        ));
    }

    #[test]
    fn test_invalid_profiles_rejected() {
        let reg = registry();
        let mut p = profile(Tier::Basic);
        p.email = "not-an-email".into();
        assert!(matches!(
            reg.create_client(p),
            Err(RegistryError::InvalidProfile(_))
        ));

        let mut p = profile(Tier::Basic);
        p.settings.webhook_url = Some("http://insecure.test/hook".into());
        assert!(matches!(
            reg.create_client(p),
            Err(RegistryError::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_keys_are_unique_across_many_clients() {
        let reg = registry();
        let mut keys = std::collections::HashSet::new();
        for _ in 0..200 {
            let creds = reg.create_client(profile(Tier::Free)).unwrap();
            assert!(keys.insert(creds.api_key));
        }
        assert_eq!(reg.list_clients().unwrap().len(), 200);
    }
}

//! Just-in-time credential refresh.
//!
//! Every remote operation asks [`AuthCache::ensure_credential`] first. The
//! cached credential is returned while it outlives the caller's guard
//! window; otherwise one `generateToken` call replaces it. A per-scope async
//! mutex serializes refreshes, so concurrent records of one push batch wait
//! for the refresh in flight and then read the persisted result instead of
//! issuing their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::issuer::{TokenIssuer, TokenRequest};
use super::store::CredentialStore;
use super::{AuthResponse, Credential, CredentialScope};
use crate::config::{origin, AuthSettings};
use crate::{Result, SyncError};

pub struct AuthCache {
    issuer: Arc<dyn TokenIssuer>,
    store: Arc<dyn CredentialStore>,
    refresh_locks: Mutex<HashMap<CredentialScope, Arc<tokio::sync::Mutex<()>>>>,
}

impl AuthCache {
    pub fn new(issuer: Arc<dyn TokenIssuer>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            issuer,
            store,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return a credential for `scope` valid beyond `guard`, refreshing if
    /// needed.
    ///
    /// `Ok(None)` means no authentication is configured and the caller
    /// proceeds anonymously. A configured token without a login is returned
    /// as-is and never refreshed.
    pub async fn ensure_credential(
        &self,
        scope: &CredentialScope,
        settings: &AuthSettings,
        service_url: &str,
        guard: Duration,
    ) -> Result<Option<Credential>> {
        if !settings.has_login() {
            return match settings.token.as_deref().filter(|t| !t.trim().is_empty()) {
                Some(token) => Ok(Some(Credential {
                    token: token.trim().to_string(),
                    expires_at: DateTime::<Utc>::MAX_UTC,
                    referer: Some(origin(service_url)?),
                })),
                None => Ok(None),
            };
        }

        let lock = self.refresh_lock(scope);
        let _refreshing = lock.lock().await;

        if let Some(cached) = self.store.load(scope)? {
            if cached.is_usable(Utc::now(), guard) {
                tracing::debug!(scope = %scope, expires_at = %cached.expires_at, "Reusing cached token");
                return Ok(Some(cached));
            }
        }

        let credential = self.refresh(scope, settings, service_url).await?;
        Ok(Some(credential))
    }

    async fn refresh(
        &self,
        scope: &CredentialScope,
        settings: &AuthSettings,
        service_url: &str,
    ) -> Result<Credential> {
        let referer = origin(settings.portal.as_deref().unwrap_or(service_url))?;
        let request = TokenRequest {
            endpoint: TokenRequest::endpoint_for(settings.portal.as_deref(), service_url)?,
            username: settings.username.clone().unwrap_or_default(),
            password: settings.password.clone().unwrap_or_default(),
            referer,
        };

        tracing::info!(scope = %scope, endpoint = %request.endpoint, "Requesting new token");

        match self.issuer.issue(&request).await? {
            AuthResponse::Issued {
                token,
                expires_at,
                referer,
            } => {
                let credential = Credential {
                    token,
                    expires_at,
                    referer: Some(referer),
                };
                self.store.save(scope, &credential)?;
                tracing::info!(scope = %scope, expires_at = %expires_at, "Token refreshed");
                Ok(credential)
            }
            AuthResponse::Rejected { reason } => {
                tracing::error!(scope = %scope, reason = %reason, "Token request rejected");
                Err(SyncError::Auth(reason))
            }
        }
    }

    fn refresh_lock(&self, scope: &CredentialScope) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .entry(scope.clone())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryCredentialStore, PULL_GUARD, PUSH_GUARD};
    use crate::config::Direction;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SERVICE: &str = "https://gis.example.com/arcgis/rest/services/Cot/FeatureServer/0";

    struct CountingIssuer {
        calls: AtomicUsize,
        reject: bool,
    }

    impl CountingIssuer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reject: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenIssuer for CountingIssuer {
        async fn issue(&self, request: &TokenRequest) -> Result<AuthResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.reject {
                return Ok(AuthResponse::Rejected {
                    reason: "Invalid username or password.".into(),
                });
            }
            Ok(AuthResponse::Issued {
                token: format!("token-{n}"),
                expires_at: Utc::now() + TimeDelta::hours(2),
                referer: request.referer.clone(),
            })
        }
    }

    fn login() -> AuthSettings {
        AuthSettings {
            username: Some("sync".into()),
            password: Some("secret".into()),
            ..AuthSettings::default()
        }
    }

    fn scope() -> CredentialScope {
        CredentialScope::new("abc", Direction::Outgoing)
    }

    #[tokio::test]
    async fn valid_cached_credential_makes_no_calls() {
        let cached = Credential {
            token: "cached".into(),
            expires_at: Utc::now() + TimeDelta::hours(3),
            referer: Some("https://gis.example.com".into()),
        };
        let store = Arc::new(MemoryCredentialStore::new().with(scope(), cached.clone()));
        let issuer = Arc::new(CountingIssuer::new());
        let cache = AuthCache::new(issuer.clone(), store);

        let got = cache
            .ensure_credential(&scope(), &login(), SERVICE, PULL_GUARD)
            .await
            .unwrap();
        assert_eq!(got, Some(cached));
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn expired_credential_refreshes_once_and_persists() {
        let stale = Credential {
            token: "stale".into(),
            expires_at: Utc::now() + TimeDelta::seconds(2),
            referer: Some("https://gis.example.com".into()),
        };
        let store = Arc::new(MemoryCredentialStore::new().with(scope(), stale));
        let issuer = Arc::new(CountingIssuer::new());
        let cache = AuthCache::new(issuer.clone(), store.clone());

        let got = cache
            .ensure_credential(&scope(), &login(), SERVICE, PUSH_GUARD)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.token, "token-1");
        assert_eq!(got.referer.as_deref(), Some("https://gis.example.com"));
        assert_eq!(issuer.calls(), 1);
        assert_eq!(store.load(&scope()).unwrap(), Some(got));
    }

    #[tokio::test]
    async fn missing_referer_forces_refresh() {
        let orphan = Credential {
            token: "orphan".into(),
            expires_at: Utc::now() + TimeDelta::days(1),
            referer: None,
        };
        let store = Arc::new(MemoryCredentialStore::new().with(scope(), orphan));
        let issuer = Arc::new(CountingIssuer::new());
        let cache = AuthCache::new(issuer.clone(), store);

        cache
            .ensure_credential(&scope(), &login(), SERVICE, PUSH_GUARD)
            .await
            .unwrap();
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn pull_reuses_token_issued_with_requested_lifetime() {
        struct HonorsLifetime(AtomicUsize);

        #[async_trait]
        impl TokenIssuer for HonorsLifetime {
            async fn issue(&self, request: &TokenRequest) -> Result<AuthResponse> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(AuthResponse::Issued {
                    token: "t".into(),
                    expires_at: Utc::now()
                        + TimeDelta::minutes(i64::from(crate::auth::TOKEN_LIFETIME_MINUTES)),
                    referer: request.referer.clone(),
                })
            }
        }

        let issuer = Arc::new(HonorsLifetime(AtomicUsize::new(0)));
        let cache = AuthCache::new(issuer.clone(), Arc::new(MemoryCredentialStore::new()));
        let incoming = CredentialScope::new("abc", Direction::Incoming);

        for _ in 0..3 {
            cache
                .ensure_credential(&incoming, &login(), SERVICE, PULL_GUARD)
                .await
                .unwrap();
        }
        assert_eq!(issuer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let store = Arc::new(MemoryCredentialStore::new());
        let issuer = Arc::new(CountingIssuer::new());
        let cache = AuthCache::new(issuer.clone(), store);
        let settings = login();
        let scope = scope();

        let calls = (0..5).map(|_| cache.ensure_credential(&scope, &settings, SERVICE, PUSH_GUARD));
        let results = futures_util::future::join_all(calls).await;

        assert_eq!(issuer.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap().unwrap().token, "token-1");
        }
    }

    #[tokio::test]
    async fn scopes_refresh_independently() {
        let store = Arc::new(MemoryCredentialStore::new());
        let issuer = Arc::new(CountingIssuer::new());
        let cache = AuthCache::new(issuer.clone(), store);

        let incoming = CredentialScope::new("abc", Direction::Incoming);
        cache
            .ensure_credential(&incoming, &login(), SERVICE, PULL_GUARD)
            .await
            .unwrap();
        cache
            .ensure_credential(&scope(), &login(), SERVICE, PUSH_GUARD)
            .await
            .unwrap();
        assert_eq!(issuer.calls(), 2);
    }

    #[tokio::test]
    async fn rejection_propagates_as_auth_error() {
        let issuer = Arc::new(CountingIssuer {
            calls: AtomicUsize::new(0),
            reject: true,
        });
        let store = Arc::new(MemoryCredentialStore::new());
        let cache = AuthCache::new(issuer, store.clone());

        let err = cache
            .ensure_credential(&scope(), &login(), SERVICE, PUSH_GUARD)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert!(store.load(&scope()).unwrap().is_none());
    }

    #[tokio::test]
    async fn anonymous_when_nothing_configured() {
        let issuer = Arc::new(CountingIssuer::new());
        let cache = AuthCache::new(issuer.clone(), Arc::new(MemoryCredentialStore::new()));

        let got = cache
            .ensure_credential(&scope(), &AuthSettings::default(), SERVICE, PUSH_GUARD)
            .await
            .unwrap();
        assert!(got.is_none());
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn static_token_is_used_without_issuance() {
        let issuer = Arc::new(CountingIssuer::new());
        let cache = AuthCache::new(issuer.clone(), Arc::new(MemoryCredentialStore::new()));
        let settings = AuthSettings {
            token: Some("preissued".into()),
            ..AuthSettings::default()
        };

        let got = cache
            .ensure_credential(&scope(), &settings, SERVICE, PULL_GUARD)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.token, "preissued");
        assert_eq!(got.referer.as_deref(), Some("https://gis.example.com"));
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn portal_is_used_for_issuance_and_referer() {
        struct Capture(Mutex<Option<TokenRequest>>);

        #[async_trait]
        impl TokenIssuer for Capture {
            async fn issue(&self, request: &TokenRequest) -> Result<AuthResponse> {
                *self.0.lock() = Some(request.clone());
                Ok(AuthResponse::Issued {
                    token: "t".into(),
                    expires_at: Utc::now() + TimeDelta::hours(1),
                    referer: request.referer.clone(),
                })
            }
        }

        let issuer = Arc::new(Capture(Mutex::new(None)));
        let cache = AuthCache::new(issuer.clone(), Arc::new(MemoryCredentialStore::new()));
        let settings = AuthSettings {
            portal: Some("https://portal.example.org/portal".into()),
            ..login()
        };

        cache
            .ensure_credential(&scope(), &settings, SERVICE, PUSH_GUARD)
            .await
            .unwrap();

        let request = issuer.0.lock().clone().unwrap();
        assert_eq!(
            request.endpoint,
            "https://portal.example.org/portal/sharing/rest/generateToken"
        );
        assert_eq!(request.referer, "https://portal.example.org");
        assert_eq!(request.username, "sync");
    }
}

/*!
Bearer token caching

A `TokenCache` holds a single access token for one upstream and refreshes
it through its `TokenSource` when it is about to expire. Fresh reads share
a read lock; refreshes take the write lock and re-check freshness first so
that callers who queued up behind an in-flight refresh reuse its result
instead of issuing another exchange.
*/
use async_std::sync::RwLock;
use chrono::{DateTime, Duration, Utc};
use std::convert::TryFrom;
use std::fmt;

use crate::LOG;

/// The result of one token exchange with an upstream auth server
#[derive(serde::Deserialize, Debug, Clone)]
pub struct Grant {
    pub access_token: String,
    // seconds until `access_token` expires, as reported by the server
    pub expires_in: u64,
}

/// Something that can produce a new access token
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// short name used in log lines
    fn name(&self) -> &'static str;

    async fn fetch(&self) -> crate::Result<Grant>;
}

#[derive(Debug, Default)]
struct BearerToken {
    value: String,
    // `None` until the first successful exchange
    expires_at: Option<DateTime<Utc>>,
}

impl BearerToken {
    fn is_fresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => now + buffer < expires_at,
            None => false,
        }
    }
}

/// When a token granted at `now` for `expires_in` seconds expires.
/// Lifetimes that don't fit a timestamp are rejected.
fn expiry(now: DateTime<Utc>, expires_in: u64) -> crate::Result<DateTime<Utc>> {
    i64::try_from(expires_in)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| se!("invalid expires_in {}", expires_in).into())
}

/// Returned by `TokenCache::get_token` when a refresh was needed and failed.
///
/// `token` is whatever value was cached before the failed refresh. It may
/// already be expired, and it is empty if no token was ever obtained.
#[derive(Debug)]
pub struct StaleToken {
    pub token: String,
    pub source: crate::Error,
}

impl fmt::Display for StaleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed refreshing access token: {}", self.source)
    }
}

impl std::error::Error for StaleToken {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

pub struct TokenCache<S> {
    source: S,
    buffer: Duration,
    token: RwLock<BearerToken>,
}

impl<S: TokenSource> TokenCache<S> {
    pub fn new(source: S, buffer: Duration) -> Self {
        Self {
            source,
            buffer,
            token: RwLock::new(BearerToken::default()),
        }
    }

    /// Return a token that stays valid for at least the buffer window.
    pub async fn get_token(&self) -> std::result::Result<String, StaleToken> {
        {
            let token = self.token.read().await;
            if token.is_fresh(Utc::now(), self.buffer) {
                return Ok(token.value.clone());
            }
        }

        match self.refresh().await {
            Ok(value) => Ok(value),
            Err(e) => {
                slog::warn!(
                    LOG, "failed to refresh access token";
                    "source" => self.source.name(), "error" => %e,
                );
                let token = self.token.read().await;
                Err(StaleToken {
                    token: token.value.clone(),
                    source: e,
                })
            }
        }
    }

    async fn refresh(&self) -> crate::Result<String> {
        let mut token = self.token.write().await;

        // another caller may have refreshed while we waited for the lock
        if token.is_fresh(Utc::now(), self.buffer) {
            return Ok(token.value.clone());
        }

        let grant = self.source.fetch().await?;
        let expires_at = expiry(Utc::now(), grant.expires_in)?;
        slog::info!(
            LOG, "refreshed access token";
            "source" => self.source.name(), "expires_at" => expires_at.to_rfc3339(),
        );
        *token = BearerToken {
            value: grant.access_token,
            expires_at: Some(expires_at),
        };
        Ok(token.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Hands out "token-1", "token-2", ... and counts exchanges.
    /// Fails every exchange after the first `succeed_for` ones.
    struct Counting {
        calls: AtomicUsize,
        expires_in: u64,
        succeed_for: usize,
        delay_ms: u64,
    }

    impl Counting {
        fn new(expires_in: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                expires_in,
                succeed_for: usize::MAX,
                delay_ms: 0,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TokenSource for Arc<Counting> {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch(&self) -> crate::Result<Grant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.delay_ms > 0 {
                async_std::task::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if n > self.succeed_for {
                return Err(se!("auth server unavailable (call {})", n).into());
            }
            Ok(Grant {
                access_token: format!("token-{}", n),
                expires_in: self.expires_in,
            })
        }
    }

    fn cache(source: &Arc<Counting>) -> Arc<TokenCache<Arc<Counting>>> {
        Arc::new(TokenCache::new(source.clone(), Duration::seconds(30)))
    }

    #[test]
    fn freshness_respects_buffer() {
        let now = Utc::now();
        let buffer = Duration::seconds(30);
        let token = BearerToken {
            value: "t".to_string(),
            expires_at: Some(now + Duration::seconds(60)),
        };
        assert!(token.is_fresh(now, buffer));
        assert!(token.is_fresh(now + Duration::seconds(29), buffer));
        assert!(!token.is_fresh(now + Duration::seconds(30), buffer));
        assert!(!token.is_fresh(now + Duration::seconds(90), buffer));
        assert!(!BearerToken::default().is_fresh(now, buffer));
    }

    #[async_std::test]
    async fn fresh_token_is_served_without_refreshing() {
        let source = Arc::new(Counting::new(3600));
        let cache = cache(&source);
        assert_eq!(cache.get_token().await.unwrap(), "token-1");

        let mut handles = vec![];
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(async_std::task::spawn(
                async move { cache.get_token().await },
            ));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "token-1");
        }
        assert_eq!(source.calls(), 1);
    }

    #[async_std::test]
    async fn concurrent_stale_callers_share_one_refresh() {
        let mut counting = Counting::new(3600);
        counting.delay_ms = 50;
        let source = Arc::new(counting);
        let cache = cache(&source);

        let mut handles = vec![];
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(async_std::task::spawn(
                async move { cache.get_token().await },
            ));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "token-1");
        }
        assert_eq!(source.calls(), 1);
    }

    #[async_std::test]
    async fn token_inside_buffer_is_refreshed() {
        // expires in 10s, which is already inside the 30s buffer
        let source = Arc::new(Counting::new(10));
        let cache = cache(&source);
        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
        assert_eq!(source.calls(), 2);
    }

    #[async_std::test]
    async fn failed_refresh_returns_previous_token() {
        let mut counting = Counting::new(10);
        counting.succeed_for = 1;
        let source = Arc::new(counting);
        let cache = cache(&source);
        assert_eq!(cache.get_token().await.unwrap(), "token-1");

        let stale = cache.get_token().await.unwrap_err();
        assert_eq!(stale.token, "token-1");
        assert!(stale.to_string().contains("auth server unavailable"));

        // the failed exchange did not clobber the cached value
        let stale = cache.get_token().await.unwrap_err();
        assert_eq!(stale.token, "token-1");
        assert_eq!(source.calls(), 3);
    }

    /// Grants with the given lifetimes, one per exchange
    struct Lifetimes {
        calls: AtomicUsize,
        expires_in: Vec<u64>,
    }

    #[async_trait::async_trait]
    impl TokenSource for Lifetimes {
        fn name(&self) -> &'static str {
            "lifetimes"
        }

        async fn fetch(&self) -> crate::Result<Grant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let expires_in = *self
                .expires_in
                .get(n)
                .ok_or_else(|| se!("no grant for call {}", n))?;
            Ok(Grant {
                access_token: format!("token-{}", n + 1),
                expires_in,
            })
        }
    }

    #[async_std::test]
    async fn unrepresentable_lifetimes_are_refresh_errors() {
        let cache = TokenCache::new(
            Lifetimes {
                calls: AtomicUsize::new(0),
                expires_in: vec![10, 100_000_000_000_000, u64::MAX, 3600],
            },
            Duration::seconds(30),
        );
        assert_eq!(cache.get_token().await.unwrap(), "token-1");

        let stale = cache.get_token().await.unwrap_err();
        assert_eq!(stale.token, "token-1");
        assert!(stale.to_string().contains("invalid expires_in 100000000000000"));

        let stale = cache.get_token().await.unwrap_err();
        assert_eq!(stale.token, "token-1");
        assert!(stale.to_string().contains("invalid expires_in"));

        assert_eq!(cache.get_token().await.unwrap(), "token-4");
    }

    #[test]
    fn expiry_adds_the_lifetime() {
        let now = Utc::now();
        assert_eq!(expiry(now, 3600).unwrap(), now + Duration::seconds(3600));
        assert!(expiry(now, u64::MAX).is_err());
        assert!(expiry(now, i64::MAX as u64).is_err());
    }

    #[async_std::test]
    async fn failed_first_refresh_returns_empty_token() {
        let mut counting = Counting::new(3600);
        counting.succeed_for = 0;
        let source = Arc::new(counting);
        let cache = cache(&source);

        let stale = cache.get_token().await.unwrap_err();
        assert_eq!(stale.token, "");
        assert_eq!(source.calls(), 1);
    }
}

//! Source-of-truth loaders invoked on a total miss.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use stratum_core::LoaderError;

/// Fetches the authoritative value for a key.
///
/// The coordinator wraps every call in a timeout and guarantees at most one
/// in-flight call per key.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, key: &str) -> Result<Vec<u8>, LoaderError>;
}

struct FnLoader<F>(F);

#[async_trait]
impl<F, Fut> Loader for FnLoader<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, LoaderError>> + Send,
{
    async fn load(&self, key: &str) -> Result<Vec<u8>, LoaderError> {
        (self.0)(key.to_string()).await
    }
}

/// Build a loader from an async closure.
///
/// ```ignore
/// let loader = loader_fn(|key| async move { db.fetch(&key).await });
/// ```
pub fn loader_fn<F, Fut>(f: F) -> Arc<dyn Loader>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, LoaderError>> + Send + 'static,
{
    Arc::new(FnLoader(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loader_fn() {
        let loader = loader_fn(|key| async move { Ok::<_, LoaderError>(format!("v:{key}").into_bytes()) });
        assert_eq!(loader.load("a").await.unwrap(), b"v:a");

        let failing = loader_fn(|key| async move { Err::<Vec<u8>, _>(LoaderError::failed(key, "db down")) });
        assert!(matches!(
            failing.load("b").await,
            Err(LoaderError::Failed { .. })
        ));
    }
}

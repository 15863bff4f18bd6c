use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use fleet_core::{traits::LeaseService, FleetResult};

/// 持有分布式租约时执行任务，租约被其他实例持有时返回 `None`
///
/// 周期任务用它保证同一时刻只有一个实例在执行同一个扫描。
pub async fn run_exclusive<F, T>(
    lease: &dyn LeaseService,
    key: &str,
    holder: &str,
    ttl: Duration,
    job: F,
) -> FleetResult<Option<T>>
where
    F: Future<Output = FleetResult<T>>,
{
    if !lease.try_acquire(key, holder, ttl).await? {
        debug!("租约 {} 由其他实例持有，跳过本轮", key);
        return Ok(None);
    }

    let result = job.await;

    if let Err(e) = lease.release(key, holder).await {
        warn!("释放租约 {} 失败，将等待过期: {}", key, e);
    }

    result.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_testing_utils::InMemoryCache;

    #[tokio::test]
    async fn test_second_holder_is_skipped() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(30);
        cache.try_acquire("lease:x", "other", ttl).await.unwrap();

        let ran = run_exclusive(&cache, "lease:x", "me", ttl, async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(ran, None);
    }

    #[tokio::test]
    async fn test_lease_released_after_failure() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(30);

        let result: FleetResult<Option<()>> = run_exclusive(&cache, "lease:x", "me", ttl, async {
            Err(fleet_core::FleetError::Internal("boom".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert!(!cache.contains("lease:x"));
    }
}

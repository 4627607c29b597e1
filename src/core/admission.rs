//! 回退抓取的全局并发许可
//!
//! 每次实时抓取都占用一个浏览器会话；许可用 `Semaphore` 限制，排队超过 queue_timeout 返回 Overloaded。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::{ErrorKind, OpError};

#[derive(Clone)]
pub struct FallbackAdmission {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    queue_timeout: Duration,
}

impl FallbackAdmission {
    pub fn new(max_concurrent: usize, queue_timeout: Duration) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            queue_timeout,
        }
    }

    /// 获取许可；排队超时返回 Overloaded
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, OpError> {
        let waited = tokio::time::timeout(self.queue_timeout, self.semaphore.clone().acquire_owned()).await;
        match waited {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(OpError::new(ErrorKind::UpstreamUnavailable, "fallback admission closed")),
            Err(_) => {
                tracing::warn!(capacity = self.capacity, "fallback admission limit reached");
                Err(OpError::new(
                    ErrorKind::Overloaded,
                    format!("all {} live-fetch slots busy", self.capacity),
                ))
            }
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overloaded_when_full() {
        let admission = FallbackAdmission::new(1, Duration::from_millis(20));
        let held = admission.acquire().await.unwrap();
        assert_eq!(admission.available(), 0);
        let err = admission.acquire().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Overloaded);
        drop(held);
        assert!(admission.acquire().await.is_ok());
    }
}

//! 会话存储：conversation id → 单写者会话
//!
//! 每个会话包在 `Arc<tokio::sync::Mutex<_>>` 中，一轮处理期间独占持有；
//! 同一会话的第二轮会排队等待，不会并发修改已引用配件列表。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::session::Session;

/// 内存会话表，带空闲过期清理
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    max_transcript_messages: usize,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(max_transcript_messages: usize, idle_timeout_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_transcript_messages,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
        }
    }

    /// 生成新的会话 ID
    pub fn new_conversation_id() -> String {
        format!("session_{}", uuid::Uuid::new_v4())
    }

    /// 取得会话的独占写权限；不存在时创建
    pub async fn checkout(&self, conversation_id: &str) -> OwnedMutexGuard<Session> {
        let existing = self.sessions.read().await.get(conversation_id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut sessions = self.sessions.write().await;
                sessions
                    .entry(conversation_id.to_string())
                    .or_insert_with(|| {
                        tracing::debug!(conversation = %conversation_id, "session created");
                        Arc::new(Mutex::new(Session::new(
                            conversation_id,
                            self.max_transcript_messages,
                        )))
                    })
                    .clone()
            }
        };
        slot.lock_owned().await
    }

    /// 清理空闲超时的会话；正在被某一轮持有的会话跳过
    pub async fn cleanup_expired(&self) -> usize {
        let idle = chrono::Duration::from_std(self.idle_timeout).unwrap_or_else(|_| chrono::Duration::days(36500));
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, slot| match slot.try_lock() {
            Ok(session) => {
                let keep = now - session.updated_at < idle;
                if !keep {
                    tracing::info!(conversation = %id, "session expired");
                }
                keep
            }
            Err(_) => true,
        });
        before - sessions.len()
    }

    pub async fn remove(&self, conversation_id: &str) -> bool {
        self.sessions.write().await.remove(conversation_id).is_some()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

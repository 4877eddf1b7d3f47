//! Per-tenant pool of parked agents.
//!
//! Agents that stopped to wait for user input or approval live here between
//! messages, keyed by `(tenant_id, agent_id)`.  Entries carry a TTL and the
//! schema version of their agent type at insertion time; expired or
//! version-mismatched entries are removed lazily on access and eagerly by
//! the background sweeper.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::registry::AgentRegistry;
use super::session::{AgentSession, AgentStatus};
use super::store::PoolStore;
use crate::config::PoolConfig;
use crate::triggers::TriggerEngine;

// ─── PoolEntry ────────────────────────────────────────────────────────────────

/// Serializable record of a parked agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolEntry {
    pub agent_id: String,
    pub agent_type: String,
    pub tenant_id: String,
    pub status: AgentStatus,
    pub schema_version: String,
    pub collected_fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub ttl_deadline: DateTime<Utc>,
    /// Deadline for an unanswered approval, when status is approval-waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_deadline: Option<DateTime<Utc>>,
    /// Triggered-task id to mark EXPIRED when the approval lapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// A pooled agent: the serializable entry plus its live session.
#[derive(Clone)]
pub struct PooledAgent {
    pub entry: PoolEntry,
    pub session: AgentSession,
}

struct Slot {
    pooled: PooledAgent,
    seq: u64,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<(String, String), Slot>,
    next_seq: u64,
}

// ─── AgentPool ────────────────────────────────────────────────────────────────

/// Stores non-terminal agent instances across messages.
pub struct AgentPool {
    config: PoolConfig,
    registry: Arc<AgentRegistry>,
    store: Option<Arc<dyn PoolStore>>,
    inner: RwLock<PoolInner>,
}

impl AgentPool {
    pub fn new(config: PoolConfig, registry: Arc<AgentRegistry>) -> Self {
        Self {
            config,
            registry,
            store: None,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    /// Attach a write-through persistence backend.
    pub fn with_store(mut self, store: Arc<dyn PoolStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Park a session.  Idempotent on `agent_id`: re-parking updates the
    /// entry and resets its TTL deadline while keeping its insertion order.
    pub async fn put(
        &self,
        session: AgentSession,
        status: AgentStatus,
        approval_deadline: Option<DateTime<Utc>>,
        task_id: Option<String>,
    ) {
        let schema_version = self
            .registry
            .schema_version_of(session.agent_type())
            .unwrap_or_default()
            .to_string();
        let entry = PoolEntry {
            agent_id: session.agent_id.clone(),
            agent_type: session.agent_type().to_string(),
            tenant_id: session.tenant_id.clone(),
            status,
            schema_version,
            collected_fields: session.collected_fields.clone(),
            created_at: session.created_at,
            ttl_deadline: Utc::now() + self.config.entry_ttl(),
            approval_deadline,
            task_id,
        };

        let mut evicted: Option<PoolEntry> = None;
        {
            let mut inner = self.inner.write().await;
            let key = (entry.tenant_id.clone(), entry.agent_id.clone());
            let existing_seq = inner.entries.get(&key).map(|slot| slot.seq);
            let seq = match existing_seq {
                Some(seq) => seq,
                None => {
                    // Enforce the per-tenant cap before inserting a new entry.
                    let tenant_count = inner
                        .entries
                        .keys()
                        .filter(|(t, _)| *t == entry.tenant_id)
                        .count();
                    if tenant_count >= self.config.max_agents_per_tenant {
                        if let Some(oldest_key) = inner
                            .entries
                            .iter()
                            .filter(|((t, _), _)| *t == entry.tenant_id)
                            .min_by_key(|(_, slot)| slot.seq)
                            .map(|(k, _)| k.clone())
                        {
                            if let Some(slot) = inner.entries.remove(&oldest_key) {
                                tracing::warn!(
                                    tenant = %entry.tenant_id,
                                    agent_id = %slot.pooled.entry.agent_id,
                                    "evicting oldest pooled agent for tenant over capacity"
                                );
                                evicted = Some(slot.pooled.entry);
                            }
                        }
                    }
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    seq
                }
            };
            inner.entries.insert(
                key,
                Slot {
                    pooled: PooledAgent {
                        entry: entry.clone(),
                        session,
                    },
                    seq,
                },
            );
        }

        if let Some(store) = &self.store {
            if let Some(old) = &evicted {
                if let Err(e) = store.remove(&old.tenant_id, &old.agent_id).await {
                    tracing::error!(error = %e, "failed to remove evicted pool entry");
                }
            }
            if let Err(e) = store.save(&entry).await {
                tracing::error!(error = %e, agent_id = %entry.agent_id, "failed to persist pool entry");
            }
        }
    }

    /// Fetch a parked agent.  Expired entries and entries whose schema
    /// version no longer matches the registry are removed and reported as
    /// absent.
    pub async fn get(&self, tenant_id: &str, agent_id: &str) -> Option<PooledAgent> {
        let key = (tenant_id.to_string(), agent_id.to_string());
        let (pooled, stale) = {
            let inner = self.inner.read().await;
            let slot = inner.entries.get(&key)?;
            let stale = self.is_stale(&slot.pooled.entry);
            (slot.pooled.clone(), stale)
        };
        if stale {
            self.remove(tenant_id, agent_id).await;
            return None;
        }
        Some(pooled)
    }

    /// The oldest waiting agent for a tenant, by insertion order.
    pub async fn find_pending(&self, tenant_id: &str) -> Option<PooledAgent> {
        loop {
            let candidate = {
                let inner = self.inner.read().await;
                inner
                    .entries
                    .iter()
                    .filter(|((t, _), slot)| {
                        t == tenant_id
                            && matches!(
                                slot.pooled.entry.status,
                                AgentStatus::WaitingForInput | AgentStatus::WaitingForApproval
                            )
                    })
                    .min_by_key(|(_, slot)| slot.seq)
                    .map(|(_, slot)| (slot.pooled.clone(), self.is_stale(&slot.pooled.entry)))
            };
            match candidate {
                Some((pooled, false)) => return Some(pooled),
                Some((pooled, true)) => {
                    self.remove(tenant_id, &pooled.entry.agent_id).await;
                }
                None => return None,
            }
        }
    }

    /// All approval-waiting entries for a tenant, oldest first.
    pub async fn pending_approvals(&self, tenant_id: &str) -> Vec<PooledAgent> {
        let inner = self.inner.read().await;
        let mut waiting: Vec<(&Slot, u64)> = inner
            .entries
            .iter()
            .filter(|((t, _), slot)| {
                t == tenant_id
                    && slot.pooled.entry.status == AgentStatus::WaitingForApproval
                    && !self.is_stale(&slot.pooled.entry)
            })
            .map(|(_, slot)| (slot, slot.seq))
            .collect();
        waiting.sort_by_key(|(_, seq)| *seq);
        waiting
            .into_iter()
            .map(|(slot, _)| slot.pooled.clone())
            .collect()
    }

    /// Remove an entry.  No-op if absent.
    pub async fn remove(&self, tenant_id: &str, agent_id: &str) {
        let removed = {
            let mut inner = self.inner.write().await;
            inner
                .entries
                .remove(&(tenant_id.to_string(), agent_id.to_string()))
                .is_some()
        };
        if removed {
            if let Some(store) = &self.store {
                if let Err(e) = store.remove(tenant_id, agent_id).await {
                    tracing::error!(error = %e, %agent_id, "failed to remove persisted pool entry");
                }
            }
        }
    }

    /// Remove every expired entry.  Returns the removed entries whose
    /// approval lapsed, so the caller can mark their originating tasks.
    pub async fn sweep(&self) -> Vec<PoolEntry> {
        let now = Utc::now();
        let expired: Vec<PoolEntry> = {
            let inner = self.inner.read().await;
            inner
                .entries
                .values()
                .filter(|slot| {
                    let e = &slot.pooled.entry;
                    e.ttl_deadline <= now
                        || e.approval_deadline.is_some_and(|d| d <= now)
                })
                .map(|slot| slot.pooled.entry.clone())
                .collect()
        };

        let mut approval_expired = Vec::new();
        for entry in expired {
            tracing::info!(
                tenant = %entry.tenant_id,
                agent_id = %entry.agent_id,
                status = entry.status.as_str(),
                "sweeping expired pool entry"
            );
            self.remove(&entry.tenant_id, &entry.agent_id).await;
            if entry.approval_deadline.is_some_and(|d| d <= now) {
                approval_expired.push(entry);
            }
        }
        approval_expired
    }

    /// Spawn the background sweeper.  Runs every quarter-TTL; approval
    /// expiries are reported to the trigger engine when one is attached.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        triggers: Option<Arc<dyn TriggerEngine>>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let approval_expired = pool.sweep().await;
                if let Some(engine) = &triggers {
                    for entry in approval_expired {
                        if let Some(task_id) = &entry.task_id {
                            if let Err(e) = engine.mark_expired(task_id).await {
                                tracing::error!(error = %e, %task_id, "failed to mark task expired");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Reload persisted entries on startup, discarding those whose schema
    /// version no longer matches the registry.  Returns the restored count.
    pub async fn restore(&self) -> Result<usize, String> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let entries = store.load_all().await?;
        let mut restored = 0;
        for entry in entries {
            let definition = self.registry.get(&entry.agent_type);
            let current = self.registry.schema_version_of(&entry.agent_type);
            let Some(definition) = definition else {
                tracing::warn!(
                    agent_type = %entry.agent_type,
                    agent_id = %entry.agent_id,
                    "discarding pool entry for unregistered agent type"
                );
                let _ = store.remove(&entry.tenant_id, &entry.agent_id).await;
                continue;
            };
            if current != Some(entry.schema_version.as_str()) {
                tracing::warn!(
                    agent_type = %entry.agent_type,
                    agent_id = %entry.agent_id,
                    recorded = %entry.schema_version,
                    "discarding pool entry with outdated schema version"
                );
                let _ = store.remove(&entry.tenant_id, &entry.agent_id).await;
                continue;
            }
            if entry.ttl_deadline <= Utc::now() {
                let _ = store.remove(&entry.tenant_id, &entry.agent_id).await;
                continue;
            }

            let session = AgentSession::restore(
                definition,
                entry.tenant_id.clone(),
                entry.agent_id.clone(),
                entry.collected_fields.clone(),
                entry.status,
                entry.created_at,
            );
            let mut inner = self.inner.write().await;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.insert(
                (entry.tenant_id.clone(), entry.agent_id.clone()),
                Slot {
                    pooled: PooledAgent { entry, session },
                    seq,
                },
            );
            restored += 1;
        }
        Ok(restored)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    fn is_stale(&self, entry: &PoolEntry) -> bool {
        if entry.ttl_deadline <= Utc::now() {
            return true;
        }
        self.registry.schema_version_of(&entry.agent_type) != Some(entry.schema_version.as_str())
    }
}

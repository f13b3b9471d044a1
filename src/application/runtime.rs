//! Shared runtime state: agent table, registration workers and active calls
//!
//! Every SIP handler and the agent watcher hold the same `Arc<RuntimeState>`.
//! Agents and calls live behind one `RwLock`; reloads are serialized by a
//! separate mutex that also owns the running registration workers.

use crate::config::{ResolvedAgents, Settings};
use crate::domain::{Agent, DomainError, Result};
use crate::infrastructure::media::{FlushPolicy, MediaMode};
use crate::infrastructure::net::FALLBACK_IPV4;
use crate::infrastructure::protocols::sip::registration::{
    RegistrationTarget, RegistrationWorker, ResponseMatchPolicy,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Behavior knobs shared by every call and registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeOptions {
    pub match_policy: ResponseMatchPolicy,
    pub flush: FlushPolicy,
}

impl RuntimeOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            match_policy: settings.register_match_policy,
            flush: FlushPolicy::from_min_rate(settings.audio_flush_min_rate),
        }
    }
}

/// Addresses this agent advertises to the PBX and to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    /// Host in Via and Contact
    pub contact_host: String,
    /// Address in the SDP answer
    pub sdp_ip: String,
    /// Port of the SIP listener
    pub listen_port: u16,
}

impl NetworkIdentity {
    pub fn contact_uri(&self, user: &str) -> String {
        format!(
            "<sip:{}@{}:{};transport=udp>",
            user, self.contact_host, self.listen_port
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Ringing,
    Answered,
}

/// One active call, keyed by Call-ID
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub extension: String,
    /// Distinguishes this session from a later one reusing the Call-ID
    pub generation: u64,
    pub mode: MediaMode,
    pub rtp_port: u16,
    pub phase: CallPhase,
    pub cancel: CancellationToken,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        extension: impl Into<String>,
        generation: u64,
        mode: MediaMode,
        rtp_port: u16,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            extension: extension.into(),
            generation,
            mode,
            rtp_port,
            phase: CallPhase::Ringing,
            cancel: CancellationToken::new(),
        }
    }
}

struct Inner {
    agents: HashMap<String, Agent>,
    calls: HashMap<String, CallSession>,
    identity: NetworkIdentity,
}

pub struct RuntimeState {
    inner: RwLock<Inner>,
    workers: Mutex<Vec<RegistrationWorker>>,
    generation: AtomicU64,
    listen_port: u16,
    options: RuntimeOptions,
}

impl RuntimeState {
    /// Empty state: no agents, so every INVITE is answered 404 until the
    /// first reload.
    pub fn new(listen_port: u16, options: RuntimeOptions) -> Self {
        Self {
            inner: RwLock::new(Inner {
                agents: HashMap::new(),
                calls: HashMap::new(),
                identity: NetworkIdentity {
                    contact_host: FALLBACK_IPV4.to_string(),
                    sdp_ip: FALLBACK_IPV4.to_string(),
                    listen_port,
                },
            }),
            workers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(1),
            listen_port,
            options,
        }
    }

    pub fn options(&self) -> RuntimeOptions {
        self.options
    }

    /// Swap in a new agent table. The old workers are stopped and joined
    /// before the new set starts.
    pub async fn replace_agents(&self, resolved: ResolvedAgents) {
        let mut workers = self.workers.lock().await;

        let identity = NetworkIdentity {
            contact_host: resolved.contact_host,
            sdp_ip: resolved.sdp_ip,
            listen_port: self.listen_port,
        };
        let agents: HashMap<String, Agent> = resolved
            .agents
            .into_iter()
            .filter(|agent| agent.enabled)
            .map(|agent| (agent.user.clone(), agent))
            .collect();
        let targets: Vec<RegistrationTarget> = agents
            .values()
            .map(|agent| {
                RegistrationTarget::for_agent(agent, &identity.contact_host, identity.listen_port)
            })
            .collect();

        {
            let mut inner = self.inner.write().await;
            inner.agents = agents;
            inner.identity = identity;
        }

        for worker in workers.drain(..) {
            debug!("Stopping registration worker for {}", worker.user());
            worker.stop().await;
        }
        *workers = targets
            .into_iter()
            .map(|target| RegistrationWorker::spawn(target, self.options.match_policy))
            .collect();
        info!("{} registration worker(s) running", workers.len());
    }

    pub async fn agent(&self, user: &str) -> Option<Agent> {
        self.inner
            .read()
            .await
            .agents
            .get(user)
            .filter(|agent| agent.enabled)
            .cloned()
    }

    pub async fn agent_count(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    pub async fn registration_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn network_identity(&self) -> NetworkIdentity {
        self.inner.read().await.identity.clone()
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn has_call(&self, call_id: &str) -> bool {
        self.inner.read().await.calls.contains_key(call_id)
    }

    pub async fn call(&self, call_id: &str) -> Option<CallSession> {
        self.inner.read().await.calls.get(call_id).cloned()
    }

    pub async fn active_call_count(&self) -> usize {
        self.inner.read().await.calls.len()
    }

    /// Check-then-insert under one write lock.
    pub async fn try_insert_call(&self, session: CallSession) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.calls.contains_key(&session.call_id) {
            return Err(DomainError::CallExists(session.call_id));
        }
        inner.calls.insert(session.call_id.clone(), session);
        Ok(())
    }

    pub async fn mark_answered(&self, call_id: &str) {
        if let Some(session) = self.inner.write().await.calls.get_mut(call_id) {
            session.phase = CallPhase::Answered;
        }
    }

    /// Remove the session and cancel its media.
    pub async fn remove_call(&self, call_id: &str) -> Option<CallSession> {
        let session = self.inner.write().await.calls.remove(call_id)?;
        session.cancel.cancel();
        Some(session)
    }

    /// Remove the session only if it is still the one started as
    /// `generation`. Returns whether anything was removed.
    pub async fn remove_call_if(&self, call_id: &str, generation: u64) -> bool {
        let mut inner = self.inner.write().await;
        match inner.calls.get(call_id) {
            Some(session) if session.generation == generation => {
                if let Some(session) = inner.calls.remove(call_id) {
                    session.cancel.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Stop every registration worker and cancel every call.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.stop().await;
        }

        let calls: Vec<CallSession> = self.inner.write().await.calls.drain().map(|(_, s)| s).collect();
        for session in &calls {
            session.cancel.cancel();
        }
        info!("Runtime stopped, {} calls cancelled", calls.len());
    }
}

//! # Lookup Orchestrator
//!
//! Runs one iterative FIND_NODES lookup from seeding to the result callback.
//!
//! ```text
//! Seeding ──▶ Dispatching ──▶ AwaitingResponses ──▶ Done
//!                 ▲                   │
//!                 └───── next round ──┘
//! ```
//!
//! Every dispatched RPC runs in its own task. When it finishes (reply,
//! error or timeout) the task locks the session, hands the outcome to the
//! round driver, releases the lock, and then either dispatches the next
//! round's candidates or delivers the result. The lock is never held across
//! network I/O or the user callback.
//!
//! The result callback fires exactly once: the session's completed flag and
//! callback slot are only touched under the session lock, and whoever flips
//! the flag takes the callback.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::{ConfigError, LookupConfig};
use crate::identity::{Contact, Identity};
use crate::protocols::{ContactSource, FindNodesRpc};
use crate::round::{self, ResponseOutcome, RoundDecision};
use crate::session::{LookupCallback, LookupSession, SessionStats};

type SharedSession = Arc<Mutex<LookupSession>>;

/// Parameters for a single lookup.
#[derive(Clone, Debug)]
pub struct LookupRequest {
    pub target: Identity,
    /// Contacts to seed in addition to (or instead of) the routing table.
    pub start: Vec<Contact>,
    /// Identities that must never be queried or returned.
    pub exclude: HashSet<Identity>,
    pub use_routing_table: bool,
}

impl LookupRequest {
    /// A lookup for `target` seeded from the routing table.
    pub fn new(target: Identity) -> Self {
        Self {
            target,
            start: Vec::new(),
            exclude: HashSet::new(),
            use_routing_table: true,
        }
    }

    pub fn with_start(mut self, contacts: impl IntoIterator<Item = Contact>) -> Self {
        self.start.extend(contacts);
        self
    }

    pub fn with_exclude(mut self, identities: impl IntoIterator<Item = Identity>) -> Self {
        self.exclude.extend(identities);
        self
    }

    pub fn without_routing_table(mut self) -> Self {
        self.use_routing_table = false;
        self
    }
}

/// Drives iterative lookups over a [`FindNodesRpc`] transport, seeding from a
/// [`ContactSource`].
pub struct LookupEngine<N, R>
where
    N: FindNodesRpc,
    R: ContactSource,
{
    network: Arc<N>,
    routing: Arc<R>,
    config: LookupConfig,
    local_id: Option<Identity>,
}

impl<N, R> Clone for LookupEngine<N, R>
where
    N: FindNodesRpc,
    R: ContactSource,
{
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            routing: self.routing.clone(),
            config: self.config.clone(),
            local_id: self.local_id,
        }
    }
}

impl<N, R> LookupEngine<N, R>
where
    N: FindNodesRpc,
    R: ContactSource,
{
    pub fn new(network: Arc<N>, routing: Arc<R>, config: LookupConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            network,
            routing,
            config,
            local_id: None,
        })
    }

    /// Never query or return the local node, even if peers advertise it.
    pub fn with_local_identity(mut self, identity: Identity) -> Self {
        self.local_id = Some(identity);
        self
    }

    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub fn routing(&self) -> &Arc<R> {
        &self.routing
    }

    /// Start a lookup. `callback` receives the closest live contacts, nearest
    /// first, at most K of them and possibly none.
    ///
    /// Returns immediately; the callback always runs on a runtime task, never
    /// inside this call. Must be called from within a Tokio runtime.
    pub fn find_nodes<F>(&self, request: LookupRequest, callback: F) -> LookupHandle
    where
        F: FnOnce(Vec<Contact>) + Send + 'static,
    {
        let LookupRequest {
            target,
            start,
            exclude,
            use_routing_table,
        } = request;

        let mut session = LookupSession::new(target, &self.config, Box::new(callback));
        for identity in exclude {
            session.exclude(identity);
        }
        if let Some(local) = self.local_id {
            session.exclude(local);
        }

        let from_table = if use_routing_table {
            let seeds = self
                .routing
                .find_closest_contacts(&target, self.config.k, session.excluded());
            session.add_seeds(seeds)
        } else {
            0
        };
        let from_start = session.add_seeds(start);

        debug!(
            target = %target.short(),
            from_table,
            from_start,
            k = self.config.k,
            alpha = self.config.alpha,
            beta = self.config.beta,
            "starting lookup"
        );

        let decision = round::seed(&mut session);
        if decision.should_call_back() {
            let callback = session.take_callback();
            deliver(callback, decision.closest);
            return LookupHandle::new(Arc::new(Mutex::new(session)));
        }

        let session = Arc::new(Mutex::new(session));
        if let Some(deadline) = self.config.lookup_timeout {
            spawn_watchdog(Arc::downgrade(&session), deadline);
        }
        self.dispatch(&session, decision);
        LookupHandle::new(session)
    }

    /// [`find_nodes`](Self::find_nodes), awaiting the result.
    pub async fn find_nodes_async(&self, request: LookupRequest) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        let _handle = self.find_nodes(request, move |contacts| {
            let _ = tx.send(contacts);
        });
        rx.await.unwrap_or_default()
    }

    fn dispatch(&self, session: &SharedSession, decision: RoundDecision) {
        let round = decision.next_round;
        for contact in decision.next_candidates {
            let engine = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                engine.query(session, contact, round).await;
            });
        }
    }

    async fn query(self, session: SharedSession, contact: Contact, round: u32) {
        let target = *session.lock().await.target();

        let outcome = match timeout(
            self.config.rpc_timeout,
            self.network.find_nodes(&contact, target),
        )
        .await
        {
            Ok(Ok(discovered)) => ResponseOutcome::Replied { discovered },
            Ok(Err(error)) => {
                trace!(
                    peer = %contact.identity.short(),
                    error = %error,
                    "find_nodes rpc failed"
                );
                ResponseOutcome::Failed
            }
            Err(_) => {
                trace!(
                    peer = %contact.identity.short(),
                    timeout_ms = self.config.rpc_timeout.as_millis(),
                    "find_nodes rpc timed out"
                );
                ResponseOutcome::Failed
            }
        };

        let (decision, callback) = {
            let mut guard = session.lock().await;
            let decision = round::process_response(&mut guard, &contact.identity, round, outcome);
            let callback = if decision.should_call_back() {
                guard.take_callback()
            } else {
                None
            };
            (decision, callback)
        };

        if decision.terminated {
            if let Some(callback) = callback {
                callback(decision.closest);
            }
            return;
        }
        if !decision.next_candidates.is_empty() {
            self.dispatch(&session, decision);
        }
    }
}

fn deliver(callback: Option<LookupCallback>, closest: Vec<Contact>) {
    if let Some(callback) = callback {
        tokio::spawn(async move { callback(closest) });
    }
}

fn spawn_watchdog(session: Weak<Mutex<LookupSession>>, deadline: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if cancel_session(&session).await {
            debug!(
                deadline_ms = deadline.as_millis(),
                "lookup deadline reached, returning current results"
            );
        }
    });
}

/// Complete the session if it has not completed yet, delivering the current
/// live top-K. Returns whether this call completed it.
async fn cancel_session(session: &Mutex<LookupSession>) -> bool {
    let (closest, callback, stats) = {
        let mut guard = session.lock().await;
        if !guard.complete() {
            return false;
        }
        (guard.closest_live(), guard.take_callback(), guard.stats())
    };
    debug!(
        found = closest.len(),
        round = stats.round,
        pending = stats.pending,
        "lookup cancelled"
    );
    if let Some(callback) = callback {
        callback(closest);
    }
    true
}

/// Handle to a running (or finished) lookup.
///
/// Dropping the handle does not stop the lookup.
#[derive(Clone)]
pub struct LookupHandle {
    session: SharedSession,
}

impl LookupHandle {
    fn new(session: SharedSession) -> Self {
        Self { session }
    }

    /// Stop the lookup and deliver whatever it has found so far.
    ///
    /// In-flight RPCs still finish but no longer affect the result. Returns
    /// `false` if the lookup had already completed.
    pub async fn cancel(&self) -> bool {
        cancel_session(&self.session).await
    }

    pub async fn is_completed(&self) -> bool {
        self.session.lock().await.is_completed()
    }

    pub async fn round(&self) -> u32 {
        self.session.lock().await.round()
    }

    pub async fn stats(&self) -> SessionStats {
        self.session.lock().await.stats()
    }

    pub async fn target(&self) -> Identity {
        *self.session.lock().await.target()
    }
}

impl std::fmt::Debug for LookupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupHandle").finish_non_exhaustive()
    }
}

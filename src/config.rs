//! Lookup parameters.
//!
//! | Parameter | Meaning | Default |
//! |-----------|---------|---------|
//! | `k` | result-set size (replication factor) | [`DEFAULT_K`] |
//! | `alpha` | RPCs issued per round | [`DEFAULT_ALPHA`] |
//! | `beta` | replies required before the next round may start | [`DEFAULT_BETA`] |
//! | `rpc_timeout` | deadline for a single FIND_NODES call | [`DEFAULT_RPC_TIMEOUT`] |
//! | `lookup_timeout` | optional deadline for the whole lookup | [`DEFAULT_LOOKUP_TIMEOUT`] |
//!
//! All values are fixed for the lifetime of a lookup session.

use std::time::Duration;

use tracing::warn;

/// Default Kademlia replication factor (bucket size and result-set size).
pub const DEFAULT_K: usize = 20;

/// Default Kademlia concurrency factor (parallel queries per round).
pub const DEFAULT_ALPHA: usize = 3;

/// Default reply quorum per round.
pub const DEFAULT_BETA: usize = 1;

/// Per-query timeout to avoid slow nodes blocking a round.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Total timeout for the entire lookup operation.
/// Prevents spending excessive time in sparse or unresponsive networks.
pub const DEFAULT_LOOKUP_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupConfig {
    pub k: usize,
    pub alpha: usize,
    pub beta: usize,
    pub rpc_timeout: Duration,
    /// `None` disables the lookup-wide deadline.
    pub lookup_timeout: Option<Duration>,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

impl LookupConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_beta(mut self, beta: usize) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Check that every parameter is usable.
    ///
    /// `alpha < beta` is legal but means a round can only advance once every
    /// dispatched contact has replied, so it is logged rather than rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k == 0 {
            return Err(ConfigError::ZeroK);
        }
        if self.alpha == 0 {
            return Err(ConfigError::ZeroAlpha);
        }
        if self.beta == 0 {
            return Err(ConfigError::ZeroBeta);
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::ZeroRpcTimeout);
        }
        if matches!(self.lookup_timeout, Some(t) if t.is_zero()) {
            return Err(ConfigError::ZeroLookupTimeout);
        }
        if self.alpha < self.beta {
            warn!(
                alpha = self.alpha,
                beta = self.beta,
                "beta exceeds alpha; rounds will wait for every reply"
            );
        }
        Ok(())
    }
}

/// Reasons a [`LookupConfig`] is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ZeroK,
    ZeroAlpha,
    ZeroBeta,
    ZeroRpcTimeout,
    ZeroLookupTimeout,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroK => write!(f, "k must be at least 1"),
            Self::ZeroAlpha => write!(f, "alpha must be at least 1"),
            Self::ZeroBeta => write!(f, "beta must be at least 1"),
            Self::ZeroRpcTimeout => write!(f, "rpc timeout must be non-zero"),
            Self::ZeroLookupTimeout => write!(f, "lookup timeout must be non-zero when set"),
        }
    }
}

impl std::error::Error for ConfigError {}

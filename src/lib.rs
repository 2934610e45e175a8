//! # kadwalk - Kademlia Iterative Node Lookup
//!
//! kadwalk finds the K peers closest (by XOR distance) to a target key in a
//! Kademlia-style overlay. It queries progressively closer peers in rounds of
//! at most `alpha` parallel FIND_NODES RPCs, advancing once a quorum of
//! `beta` replies is in, and stops when the K-th closest candidate stays put
//! across a round with every top-K candidate heard from.
//!
//! ## Architecture
//!
//! - Each lookup owns a [`LookupSession`] (contact ledger, round counter,
//!   watermark, completed flag) behind one `tokio::sync::Mutex`
//! - Every RPC runs in its own task and re-enters the round driver under
//!   that lock; dispatch and the result callback happen outside it
//! - Transport and routing state are injected through the [`FindNodesRpc`]
//!   and [`ContactSource`] traits
//!
//! ## Guarantees
//!
//! - The result callback fires exactly once, even with concurrent, late or
//!   duplicate responses
//! - RPC failures never escalate; the contact is marked down and the lookup
//!   continues
//! - An empty or fully unreachable seed set yields an empty result, not an
//!   error
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Keypairs, identities, contacts, XOR distance |
//! | `ledger` | Per-lookup contact ledger with state and round indices |
//! | `session` | Per-lookup state shared by in-flight RPCs |
//! | `round` | Round-advance and termination decisions |
//! | `lookup` | Lookup orchestration, cancellation and deadlines |
//! | `protocols` | Transport and routing-table traits |
//! | `routing` | XOR-metric k-bucket routing table |
//! | `config` | Lookup parameters and validation |
//! | `sim` | In-process simulated network |

mod config;
mod identity;
mod ledger;
mod lookup;
mod protocols;
mod round;
mod routing;
mod session;
mod sim;

pub use config::{
    ConfigError, LookupConfig, DEFAULT_ALPHA, DEFAULT_BETA, DEFAULT_K, DEFAULT_LOOKUP_TIMEOUT,
    DEFAULT_RPC_TIMEOUT,
};
pub use identity::{distance_cmp, hash_key, sort_by_distance, Contact, Identity, Keypair, ID_LEN};
pub use ledger::{ContactLedger, ContactState, LedgerEntry, MarkOutcome, RoundProgress};
pub use lookup::{LookupEngine, LookupHandle, LookupRequest};
pub use protocols::{ContactSource, FindNodesRpc, NoContacts};
pub use round::{process_response, seed, ResponseOutcome, RoundDecision, Termination};
pub use routing::{bucket_index, RoutingTable, UpdateOutcome};
pub use session::{LookupCallback, LookupSession, SessionStats, MAX_DISCOVERED_PER_RESPONSE};
pub use sim::{SimConfig, SimPeer, SimulatedNetwork};

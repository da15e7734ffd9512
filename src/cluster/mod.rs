//! Distributed Coordination Module
//!
//! Extends the local archive across a set of ranked peers with loose,
//! best-effort consistency: a `load` miss on one node is resolved from
//! whichever live peer still holds the value.
//!
//! ## Core Mechanisms
//! - **Tagged messaging**: All coordination flows over eight message tags on an
//!   abstract rank transport (`transport.rs`). A cooperative dispatcher
//!   (`dispatcher.rs`) probes for messages and hands each one to the handler
//!   registered for its tag.
//! - **Liveness tracking**: Nodes announce themselves at construction and sign
//!   off at destruction. The alive vector gates every broadcast and lets
//!   in-flight lookups terminate when a peer dies mid-request.
//! - **Remote lookup**: A missing key is requested from every live peer; the
//!   first positive answer picks the node the data is pulled from. Requests
//!   are identified by a `{key, counter}` pair so repeated lookups for the
//!   same key cannot confuse each other (`registry.rs`).
//! - **Opportunistic replication**: A user filter can direct a node to pull its
//!   own durable copy of values inserted elsewhere, so they outlive the
//!   inserting peer.

pub mod dispatcher;
pub mod mesh;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod transport;

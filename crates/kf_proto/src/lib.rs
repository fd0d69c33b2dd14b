//! kf_proto - Keyfold domain types and serialisation
//!
//! Plain serde shapes shared between the store and its UI/CLI/sync
//! collaborators. These map directly to JSON on the wire and carry no
//! plaintext secret values: wrapped keys travel as sealed envelopes, and
//! listing types expose metadata only.
//!
//! # Module layout
//! - `types`  - vaults, members, roles, invites, shares, identity status
//! - `backup` - portable encrypted backup bundle shapes

pub mod backup;
pub mod types;

pub use types::*;

//! Out-of-band firmware update orchestration for heterogeneous server
//! fleets.
//!
//! The crate is organized around a protocol abstraction: every management
//! protocol a BMC may expose (Redfish, WS-Man, the vendor CLI, IPMI, SSH)
//! implements the same [`protocol::ProtocolClient`] contract, the
//! [`protocol::ProtocolManager`] drives priority-ordered fallback across
//! them, the [`poller::TaskPoller`] tracks asynchronous Redfish update
//! jobs to completion, and the [`state_controller`] sequences the
//! per-host maintenance/apply/verify workflow.

pub mod cfg;
pub mod detect;
pub mod errors;
pub mod model;
pub mod poller;
pub mod protocol;
pub mod state_controller;

pub use errors::{AnvilError, AnvilResult, ErrorClass};

//! Gestparc - incident and report lifecycle for facility and IT asset management.
//!
//! # Overview
//!
//! An incident is declared against a piece of equipment, assigned to a
//! technician, diagnosed in a report, optionally scheduled, and finally
//! validated or sent back for correction by the IT manager. The crate
//! provides:
//!
//! - the lifecycle rules as pure functions ([`lifecycle`]), shared by the
//!   service and the client so both reject the same actions;
//! - a reference HTTP service backed by SQLite ([`api`], [`storage`]) that
//!   is the system of record and settles concurrent reviewers;
//! - a typed client ([`client`]), a session coordinator that validates
//!   locally before any call ([`coordinator`]) and a live subscription that
//!   keeps notifications and reports current ([`sync`]).
//!
//! # Modules
//!
//! - [`model`]: Incidents, reports, notifications and wire enums
//! - [`error`]: Lifecycle violations and client errors
//! - [`lifecycle`]: Transition rules, lead-time policy, available actions
//! - [`scheduling`]: The "to schedule" / "scheduled" board
//! - [`feed`]: Client-side notification feed and live state
//! - [`storage`]: SQLite storage layer
//! - [`api`]: HTTP API handlers and router
//! - [`backend`]: The backend seam used by the coordinator
//! - [`client`]: HTTP implementation of the backend and SSE reader
//! - [`coordinator`]: Client-side lifecycle coordinator
//! - [`sync`]: Live subscription with reconnect and resync
//! - [`config`]: Environment configuration

pub mod api;
pub mod backend;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod model;
pub mod scheduling;
pub mod storage;
pub mod sync;

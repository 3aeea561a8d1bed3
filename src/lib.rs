// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! # wmi-bridge
//!
//! A thin bridge over Windows Management Instrumentation: namespace-qualified
//! class queries, intrinsic event subscriptions, and conversion of class
//! objects into ordered JSON value trees.
//!
//! ## Components
//!
//! - [`session`]: bootstrap of the root connection and namespace handles
//! - [`query`]: `SELECT * FROM <class>` over any namespace
//! - [`events`]: instance creation/deletion/modification subscriptions
//! - [`marshal`]: property values to text
//! - [`tree`]: nested value trees and their JSON rendering
//! - [`provider`]: the COM backend and an in-process stand-in
//!
//! ## Example
//!
//! ```no_run
//! use wbridgelib::{BridgeConfig, Session};
//!
//! let session = Session::connect_local(BridgeConfig::default())?;
//! for tree in session.query_trees("cimv2\\Win32_Process")? {
//!     println!("{}", tree.render("\t")?);
//! }
//! # Ok::<(), wbridgelib::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod marshal;
pub mod namespace;
pub mod provider;
pub mod query;
pub mod session;
pub mod tree;
pub mod variant;

pub use config::{BridgeConfig, LogLevel};
pub use error::{Error, HResult, Result};
pub use events::{event_types, Subscription};
pub use marshal::Marshaler;
pub use namespace::QualifiedName;
pub use provider::{CallbackSink, ClassObject, EventSink};
pub use session::Session;
pub use tree::ValueTree;
pub use variant::Variant;

/*
 * Provisioning E2E - Convergence harness for the cluster provisioning control plane
 * Copyright (C) 2025 Provisioning QA
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Provisioning end-to-end harness
//!
//! Drives a provisioning control plane through cluster creation, simulated node
//! registration and convergence, then checks the machine records it produces.
//! Every resource a test creates is owned by a [`Session`] and torn down in
//! reverse order when the test finishes.

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod crds;
pub mod error;
#[cfg(test)]
mod fake_api;
pub mod matrix;
pub mod naming;
pub mod node;
pub mod provider;
pub mod scenarios;
pub mod session;
pub mod suite;
pub mod telemetry;
pub mod users;
pub mod verify;
pub mod wait;

// Re-export commonly used types
pub use bootstrap::{BootstrapScript, NodeTaint, TaintEffect};
pub use cluster::{ClusterDriver, ClusterHandle};
pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use matrix::{expand, expand_dynamic, Expansion, Identity, NodeRoles, RoleTemplate, TestCase};
pub use node::{AgentHandle, NodeLauncher};
pub use session::{CleanupError, Session};
pub use suite::{CaseOutcome, SuiteContext, SuiteReport};
pub use verify::{RoleCounts, VerificationError, Verifier};
pub use wait::{wait_until, ChangeEvent, EventStream, WaitError, WatchSelector};

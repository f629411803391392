//! # vmsync-core
//!
//! Reconciliation engine for VMs managed through an asynchronous,
//! task-based virtualization control plane.
//!
//! Given a declared VM configuration and the id of an existing VM, the
//! engine works out the minimal set of remote calls that converge the live
//! VM to the declaration and issues them one at a time, each guarded by a
//! fresh concurrency token and followed by a wait on its task.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       vmsync-core                        │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │   Reconciler    │────▶│  diff()  (per collection) │   │
//! │  │  - reconcile()  │     └──────────────────────────┘   │
//! │  │  - create()     │     ┌──────────────────────────┐   │
//! │  │  - delete()     │────▶│  hot-plug gate           │   │
//! │  │  - power_on()   │     │  (power off first?)      │   │
//! │  │  - power_off()  │     └──────────────────────────┘   │
//! │  └─────────────────┘                                    │
//! │        │       │                                         │
//! │        │       ▼                                         │
//! │        │  ┌─────────────────┐                            │
//! │        │  │   TaskPoller    │                            │
//! │        │  │   - wait()      │                            │
//! │        │  └─────────────────┘                            │
//! │        ▼           │                                     │
//! │  ┌───────────┐ ┌───────────┐                             │
//! │  │  VmApi    │ │  TaskApi  │   (implemented by callers)  │
//! │  └───────────┘ └───────────┘                             │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │              virtualization control plane                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use vmsync_core::{ReconcileConfig, Reconciler, VmConfig, VmId};
//!
//! # async fn example(client: Arc<MyClient>) -> vmsync_core::Result<()> {
//! let reconciler = Reconciler::new(client.clone(), client, ReconcileConfig::from_env()?);
//!
//! let desired = VmConfig::new("web-1").with_sockets(4);
//! let live = reconciler.reconcile(&desired, &VmId::from("0005a1b2")).await?;
//! println!("now {}", live.power_state());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Keyed Diffing**: Added, removed and updated sub-resources per collection
//! - **Hot-Plug Gate**: Powers the VM off only when a cold attribute changes
//! - **Optimistic Concurrency**: Fresh token read before every mutation
//! - **Task Polling**: Bounded waits on asynchronous tasks
//! - **Fail Fast**: Declared state is validated before the first remote call

mod client;
mod config;
pub mod diff;
mod error;
pub mod hotplug;
pub mod model;
mod reconcile;
mod task;

pub use client::{ApiError, Operation, TaskApi, VmApi};
pub use config::{ReconcileConfig, ReconcileConfigBuilder};
pub use diff::{diff, DiffResult, Keyed};
pub use error::{CoreError, Result};
pub use hotplug::requires_power_cycle;
pub use model::{
    CategoryRef, ConcurrencyToken, PowerState, SubResource, SubResourceKind, VmConfig,
    VmDesiredState, VmField, VmId, VmLiveState,
};
pub use reconcile::{validate_desired, Reconciler};
pub use task::{TaskHandle, TaskInfo, TaskOutcome, TaskPoller, TaskStatus};

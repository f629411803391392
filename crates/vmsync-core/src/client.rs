//! Control-plane client traits.
//!
//! The engine never talks to a transport directly. Callers hand it a
//! [`VmApi`] for VM reads and mutations and a [`TaskApi`] for task status;
//! a single client type may implement both.

use crate::model::{
    CategoryRef, ConcurrencyToken, SubResource, SubResourceKind, VmConfig, VmId, VmLiveState,
};
use crate::task::{TaskHandle, TaskInfo};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Error returned by a client implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The presented concurrency token no longer matches
    #[error("conflict: {0}")]
    Conflict(String),

    /// The VM or sub-resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The control plane refused the request
    #[error("rejected: {0}")]
    Rejected(String),

    /// The request never got an answer
    #[error("transport: {0}")]
    Transport(String),
}

/// One remote step of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ReadVm,
    CreateVm,
    UpdateVm,
    DeleteVm,
    PowerOn,
    PowerOff,
    CreateSubResource(SubResourceKind),
    UpdateSubResource {
        kind: SubResourceKind,
        ext_id: String,
    },
    DeleteSubResource {
        kind: SubResourceKind,
        ext_id: String,
    },
    AssociateCategories,
    DisassociateCategories,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ReadVm => write!(f, "read vm"),
            Operation::CreateVm => write!(f, "create vm"),
            Operation::UpdateVm => write!(f, "update vm"),
            Operation::DeleteVm => write!(f, "delete vm"),
            Operation::PowerOn => write!(f, "power on"),
            Operation::PowerOff => write!(f, "power off"),
            Operation::CreateSubResource(kind) => write!(f, "create {kind}"),
            Operation::UpdateSubResource { kind, ext_id } => write!(f, "update {kind} {ext_id}"),
            Operation::DeleteSubResource { kind, ext_id } => write!(f, "delete {kind} {ext_id}"),
            Operation::AssociateCategories => write!(f, "associate categories"),
            Operation::DisassociateCategories => write!(f, "disassociate categories"),
        }
    }
}

/// VM reads and mutations.
///
/// Every mutating call takes the token from the most recent read and
/// returns the handle of the task that carries out the change. A stale
/// token must yield [`ApiError::Conflict`].
#[async_trait]
pub trait VmApi: Send + Sync {
    /// Read a VM together with its current concurrency token.
    async fn get_vm(&self, id: &VmId) -> Result<VmLiveState, ApiError>;

    /// Create a VM. The new identifier is reported by the task.
    async fn create_vm(&self, config: &VmConfig) -> Result<TaskHandle, ApiError>;

    /// Replace the VM's scalar attributes.
    async fn update_vm(
        &self,
        id: &VmId,
        config: &VmConfig,
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError>;

    /// Delete a VM.
    async fn delete_vm(&self, id: &VmId, token: &ConcurrencyToken)
        -> Result<TaskHandle, ApiError>;

    async fn power_on(&self, id: &VmId, token: &ConcurrencyToken)
        -> Result<TaskHandle, ApiError>;

    async fn power_off(
        &self,
        id: &VmId,
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError>;

    /// Attach a new disk, NIC, CD-ROM, serial port or GPU.
    async fn create_sub_resource(
        &self,
        id: &VmId,
        item: &SubResource,
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError>;

    /// Modify an existing sub-resource in place.
    async fn update_sub_resource(
        &self,
        id: &VmId,
        ext_id: &str,
        item: &SubResource,
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError>;

    /// Detach and delete a sub-resource.
    async fn delete_sub_resource(
        &self,
        id: &VmId,
        kind: SubResourceKind,
        ext_id: &str,
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError>;

    /// Attach several categories in one call.
    async fn associate_categories(
        &self,
        id: &VmId,
        categories: &[CategoryRef],
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError>;

    /// Detach several categories in one call.
    async fn disassociate_categories(
        &self,
        id: &VmId,
        categories: &[CategoryRef],
        token: &ConcurrencyToken,
    ) -> Result<TaskHandle, ApiError>;
}

/// Task status reads.
#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn get_task(&self, handle: &TaskHandle) -> Result<TaskInfo, ApiError>;
}

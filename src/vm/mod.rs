//! Virtual machine lifecycle collaborator.
//!
//! The orchestrator only talks to the hypervisor through [`VmLifecycle`];
//! [`vboxmanage`] implements it on top of the VirtualBox command-line tool.
pub mod vboxmanage;

use crate::input::GuestInput;
use crate::transport::SerialEndpoint;
use std::future::Future;

/// A VM known to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub name: String,
}

/// Coarse machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Powered off, aborted or saved.
    Offline,
    /// Running, paused, or otherwise holding guest state in memory.
    Online,
    /// Starting, stopping, or in some other in-between state.
    Transitional,
}

#[derive(Debug)]
pub enum VmError {
    /// The hypervisor tool could not be started.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The hypervisor rejected a command.
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    /// The hypervisor answered with something we could not make sense of.
    UnexpectedOutput { command: String, detail: String },
    Io(std::io::Error),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Spawn { program, source } => {
                write!(f, "failed to run {}: {}", program, source)
            }
            VmError::Command {
                command,
                code,
                stderr,
            } => match code {
                Some(code) => write!(f, "`{}` exited with {}: {}", command, code, stderr),
                None => write!(f, "`{}` killed by signal: {}", command, stderr),
            },
            VmError::UnexpectedOutput { command, detail } => {
                write!(f, "unexpected output from `{}`: {}", command, detail)
            }
            VmError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Spawn { source, .. } => Some(source),
            VmError::Io(e) => Some(e),
            VmError::Command { .. } | VmError::UnexpectedOutput { .. } => None,
        }
    }
}

impl From<std::io::Error> for VmError {
    fn from(e: std::io::Error) -> Self {
        VmError::Io(e)
    }
}

/// Hypervisor operations used by the harness.
pub trait VmLifecycle {
    /// Keyboard of a running VM, used to type into the guest.
    type Keyboard: GuestInput + 'static;

    /// Look the VM up by name, creating and registering it if it does not exist.
    fn find_or_create(&self, name: &str) -> impl Future<Output = Result<VmHandle, VmError>>;

    /// Route the VM's first serial port to `endpoint` with the VM as the server side.
    fn configure_serial(
        &self,
        vm: &VmHandle,
        endpoint: &SerialEndpoint,
    ) -> impl Future<Output = Result<(), VmError>>;

    /// Make sure exactly one boot disk is attached.
    fn ensure_boot_disk(&self, vm: &VmHandle) -> impl Future<Output = Result<(), VmError>>;

    /// Start the VM. Returns once the hypervisor reports it launched.
    fn launch(&self, vm: &VmHandle) -> impl Future<Output = Result<(), VmError>>;

    fn power_off(&self, vm: &VmHandle) -> impl Future<Output = Result<(), VmError>>;

    fn current_state(&self, vm: &VmHandle) -> impl Future<Output = Result<VmState, VmError>>;

    /// Let go of the VM after an attempt, waiting for it to settle.
    fn release(&self, vm: &VmHandle) -> impl Future<Output = Result<(), VmError>>;

    fn keyboard(&self, vm: &VmHandle) -> Self::Keyboard;
}

#[cfg(test)]
pub(crate) mod fake;

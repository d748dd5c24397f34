//! Scripted in-process hypervisor for orchestrator tests.
//!
//! Every launch binds the serial socket and plays the next [`GuestScript`]
//! to whoever connects.
use super::{VmError, VmHandle, VmLifecycle, VmState};
use crate::input::testing::RecordingInput;
use crate::transport::SerialEndpoint;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

/// What the guest does on one boot.
#[derive(Debug, Clone)]
pub struct GuestScript {
    launch_fails: bool,
    serial: bool,
    output: String,
    hang: bool,
}

impl GuestScript {
    /// Print `output`, then close the serial line.
    pub fn prints(output: impl Into<String>) -> Self {
        Self {
            launch_fails: false,
            serial: true,
            output: output.into(),
            hang: false,
        }
    }

    /// Keep the serial line open after printing.
    pub fn then_hangs(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Boot without ever opening the serial port.
    pub fn no_serial() -> Self {
        Self {
            serial: false,
            ..Self::prints("")
        }
    }

    pub fn launch_failure() -> Self {
        Self {
            launch_fails: true,
            serial: true,
            output: String::new(),
            hang: false,
        }
    }
}

pub struct FakeVm {
    socket: PathBuf,
    scripts: Mutex<VecDeque<GuestScript>>,
    state: Mutex<VmState>,
    guest: Mutex<Option<JoinHandle<()>>>,
    pub keyboard: RecordingInput,
    pub launches: Mutex<usize>,
    pub power_offs: Mutex<usize>,
    pub power_off_fails: bool,
}

impl FakeVm {
    /// Scripts are used one per launch; the last one repeats.
    pub fn new(socket: PathBuf, scripts: Vec<GuestScript>) -> Self {
        Self {
            socket,
            scripts: Mutex::new(scripts.into()),
            state: Mutex::new(VmState::Offline),
            guest: Mutex::new(None),
            keyboard: RecordingInput::default(),
            launches: Mutex::new(0),
            power_offs: Mutex::new(0),
            power_off_fails: false,
        }
    }

    pub fn launches(&self) -> usize {
        *self.launches.lock().unwrap()
    }

    pub fn power_offs(&self) -> usize {
        *self.power_offs.lock().unwrap()
    }

    fn next_script(&self) -> GuestScript {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.len() > 1 {
            scripts.pop_front().unwrap()
        } else {
            scripts.front().cloned().unwrap_or_else(|| GuestScript::prints(""))
        }
    }
}

impl VmLifecycle for FakeVm {
    type Keyboard = RecordingInput;

    async fn find_or_create(&self, name: &str) -> Result<VmHandle, VmError> {
        Ok(VmHandle {
            name: name.to_string(),
        })
    }

    async fn configure_serial(
        &self,
        _vm: &VmHandle,
        _endpoint: &SerialEndpoint,
    ) -> Result<(), VmError> {
        Ok(())
    }

    async fn ensure_boot_disk(&self, _vm: &VmHandle) -> Result<(), VmError> {
        Ok(())
    }

    async fn launch(&self, _vm: &VmHandle) -> Result<(), VmError> {
        *self.launches.lock().unwrap() += 1;
        let script = self.next_script();
        if script.launch_fails {
            return Err(VmError::Command {
                command: "startvm".to_string(),
                code: Some(1),
                stderr: "scripted launch failure".to_string(),
            });
        }

        let _ = std::fs::remove_file(&self.socket);
        if !script.serial {
            *self.state.lock().unwrap() = VmState::Online;
            return Ok(());
        }
        let listener = UnixListener::bind(&self.socket)?;
        let guest = tokio::spawn(async move {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            let _ = conn.write_all(script.output.as_bytes()).await;
            if script.hang {
                std::future::pending::<()>().await;
            }
        });
        *self.guest.lock().unwrap() = Some(guest);
        *self.state.lock().unwrap() = VmState::Online;
        Ok(())
    }

    async fn power_off(&self, _vm: &VmHandle) -> Result<(), VmError> {
        *self.power_offs.lock().unwrap() += 1;
        if self.power_off_fails {
            return Err(VmError::Command {
                command: "controlvm poweroff".to_string(),
                code: Some(1),
                stderr: "scripted power-off failure".to_string(),
            });
        }
        if let Some(guest) = self.guest.lock().unwrap().take() {
            guest.abort();
        }
        *self.state.lock().unwrap() = VmState::Offline;
        Ok(())
    }

    async fn current_state(&self, _vm: &VmHandle) -> Result<VmState, VmError> {
        Ok(*self.state.lock().unwrap())
    }

    async fn release(&self, _vm: &VmHandle) -> Result<(), VmError> {
        Ok(())
    }

    fn keyboard(&self, _vm: &VmHandle) -> RecordingInput {
        self.keyboard.clone()
    }
}

//! Synthetic guest input.
//!
//! The monitor answers debugger prompts by "typing" into the guest. Depending on
//! how the guest debugger is attached this is either raw bytes written back over
//! the serial line or PS/2 scancodes pushed through the VM's keyboard.
use std::future::Future;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Keys the monitor ever needs to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    B,
    T,
    O,
    Enter,
}

impl Key {
    /// Set 1 make code.
    pub fn scancode(self) -> u8 {
        match self {
            Key::B => 0x30,
            Key::T => 0x14,
            Key::O => 0x18,
            Key::Enter => 0x1c,
        }
    }

    /// Set 1 break (release) code.
    pub fn release_scancode(self) -> u8 {
        self.scancode() | 0x80
    }

    /// Byte sent over a serial debugger connection.
    pub fn byte(self) -> u8 {
        match self {
            Key::B => b'b',
            Key::T => b't',
            Key::O => b'o',
            Key::Enter => b'\r',
        }
    }
}

/// `bt` + Enter: dump a backtrace on the first debugger entry.
pub const BACKTRACE: &[Key] = &[Key::B, Key::T, Key::Enter];
/// Show the next page of debugger output.
pub const NEXT_PAGE: &[Key] = &[Key::Enter];
/// "break Once" at an assertion prompt.
pub const BREAK_ONCE: &[Key] = &[Key::O];

/// Make/release pairs for a key sequence, in order.
pub fn scancodes(keys: &[Key]) -> Vec<u8> {
    keys.iter()
        .flat_map(|k| [k.scancode(), k.release_scancode()])
        .collect()
}

/// Something that can deliver key presses to the guest.
pub trait GuestInput: Send {
    fn send(&mut self, keys: &[Key]) -> impl Future<Output = std::io::Result<()>> + Send;
}

/// Raw-byte input written to the serial connection.
pub struct SerialInput<W> {
    writer: W,
}

impl<W> SerialInput<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: AsyncWrite + Unpin + Send> GuestInput for SerialInput<W> {
    async fn send(&mut self, keys: &[Key]) -> std::io::Result<()> {
        let bytes: Vec<u8> = keys.iter().map(|k| k.byte()).collect();
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await
    }
}

/// The two input paths of one monitoring session; raw mode selects the serial one.
pub struct Injector<S, K> {
    serial: S,
    keyboard: K,
}

impl<S: GuestInput, K: GuestInput> Injector<S, K> {
    pub fn new(serial: S, keyboard: K) -> Self {
        Self { serial, keyboard }
    }

    pub async fn send(&mut self, raw_mode: bool, keys: &[Key]) -> std::io::Result<()> {
        tracing::debug!(?keys, raw_mode, "injecting guest input");
        if raw_mode {
            self.serial.send(keys).await
        } else {
            self.keyboard.send(keys).await
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every key sequence it is asked to send.
    #[derive(Clone, Default)]
    pub struct RecordingInput {
        pub sent: Arc<Mutex<Vec<Vec<Key>>>>,
    }

    impl RecordingInput {
        pub fn sent(&self) -> Vec<Vec<Key>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl GuestInput for RecordingInput {
        async fn send(&mut self, keys: &[Key]) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(keys.to_vec());
            Ok(())
        }
    }
}

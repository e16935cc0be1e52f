use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Chip8Error, Result};

pub const NUM_KEYS: usize = 16;

type Waiters = Arc<Mutex<Vec<(u64, Sender<Key>)>>>;

fn lock(waiters: &Waiters) -> MutexGuard<'_, Vec<(u64, Sender<Key>)>> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Key0,
    Key1,
    Key2,
    Key3,
    Key4,
    Key5,
    Key6,
    Key7,
    Key8,
    Key9,
    KeyA,
    KeyB,
    KeyC,
    KeyD,
    KeyE,
    KeyF,
}
impl Key {
    pub fn from_index(index: u8) -> Result<Key> {
        match index {
            0 => Ok(Key::Key0),
            1 => Ok(Key::Key1),
            2 => Ok(Key::Key2),
            3 => Ok(Key::Key3),
            4 => Ok(Key::Key4),
            5 => Ok(Key::Key5),
            6 => Ok(Key::Key6),
            7 => Ok(Key::Key7),
            8 => Ok(Key::Key8),
            9 => Ok(Key::Key9),
            10 => Ok(Key::KeyA),
            11 => Ok(Key::KeyB),
            12 => Ok(Key::KeyC),
            13 => Ok(Key::KeyD),
            14 => Ok(Key::KeyE),
            15 => Ok(Key::KeyF),
            _ => Err(Chip8Error::InvalidKey(index)),
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

/// Pending answer to [`Keyboard::next_key_press`].
///
/// Dropping an unanswered request unregisters it from the keyboard.
pub struct KeyPress {
    id: u64,
    receiver: Receiver<Key>,
    waiters: Waiters,
}

impl KeyPress {
    /// Blocks until a key is pressed.
    pub fn wait(self) -> Option<Key> {
        self.receiver.recv().ok()
    }

    /// Blocks until a key is pressed or `cancel` fires, whichever is first.
    pub fn wait_cancellable(self, cancel: &CancelToken) -> Option<Key> {
        if cancel.is_cancelled() {
            return None;
        }
        select! {
            recv(self.receiver) -> key => key.ok(),
            recv(cancel.signal()) -> _ => None,
        }
    }

    /// Like [`KeyPress::wait_cancellable`], but calls `on_tick` every `interval`
    /// while no key has arrived.
    pub fn wait_ticking(
        self,
        cancel: &CancelToken,
        interval: Duration,
        mut on_tick: impl FnMut(Instant),
    ) -> Option<Key> {
        let ticker = crossbeam_channel::tick(interval);
        while !cancel.is_cancelled() {
            select! {
                recv(self.receiver) -> key => return key.ok(),
                recv(cancel.signal()) -> _ => return None,
                recv(ticker) -> now => {
                    if let Ok(now) = now {
                        on_tick(now);
                    }
                }
            }
        }
        None
    }

    pub fn try_key(&self) -> Option<Key> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for KeyPress {
    fn drop(&mut self) {
        lock(&self.waiters).retain(|(id, _)| *id != self.id);
    }
}

/// The 16-key hex keypad, shared between the interpreter and the input thread.
///
/// Key state is a set of atomics, so reads and writes need no external
/// locking. Every request registered with [`Keyboard::next_key_press`] that is
/// still pending when a key goes down is resolved with that key.
pub struct Keyboard {
    keys: [AtomicBool; NUM_KEYS],
    waiters: Waiters,
    next_waiter: AtomicU64,
}

impl Keyboard {
    pub fn new() -> Self {
        Keyboard {
            keys: std::array::from_fn(|_| AtomicBool::new(false)),
            waiters: Arc::new(Mutex::new(Vec::new())),
            next_waiter: AtomicU64::new(0),
        }
    }

    pub fn is_key_pressed(&self, key: Key) -> bool {
        self.keys[key as usize].load(Ordering::Acquire)
    }

    pub fn set_key_pressed(&self, key: Key, pressed: bool) {
        let was_pressed = self.keys[key as usize].swap(pressed, Ordering::AcqRel);
        if !pressed || was_pressed {
            return;
        }

        let waiters = std::mem::take(&mut *lock(&self.waiters));
        if !waiters.is_empty() {
            debug!(?key, waiters = waiters.len(), "resolving key press requests");
        }
        for (_, waiter) in waiters {
            // The requester may have given up waiting.
            let _ = waiter.send(key);
        }
    }

    pub fn next_key_press(&self) -> KeyPress {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        lock(&self.waiters).push((id, sender));
        KeyPress {
            id,
            receiver,
            waiters: Arc::clone(&self.waiters),
        }
    }

    pub fn release_all(&self) {
        for key in &self.keys {
            key.store(false, Ordering::Release);
        }
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

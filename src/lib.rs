//! A CHIP-8 virtual machine: the interpreter core runs on its own thread and
//! talks to the terminal front end through the shared keyboard, screen
//! snapshots and sound on/off events.

pub mod cancel;
pub mod display;
pub mod emulator;
pub mod error;
pub mod instruction;
pub mod interpreter;
pub mod keyboard;
pub mod state;
pub mod timer;

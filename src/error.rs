use thiserror::Error;

use crate::state::Address;

pub type Result<T> = std::result::Result<T, Chip8Error>;

/// Every error the machine can raise. None of them are recoverable: the run
/// loop stops on the first one.
#[derive(Debug, Error)]
pub enum Chip8Error {
    #[error("unknown instruction: {0:#06X}")]
    Decode(u16),
    #[error("stack overflow: call depth exceeds {0}")]
    StackOverflow(usize),
    #[error("stack underflow: return with empty call stack")]
    StackUnderflow,
    #[error("memory access out of bounds: {0:#05X}")]
    MemoryOutOfBounds(Address),
    #[error("program of {len} bytes does not fit in {max} bytes of program memory")]
    ProgramTooLarge { len: usize, max: usize },
    #[error("failed to load program: {0}")]
    Io(#[from] std::io::Error),
    #[error("timer period must be greater than zero")]
    InvalidTimerPeriod,
    #[error("invalid key index: {0}")]
    InvalidKey(u8),
}

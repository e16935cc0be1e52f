#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::cancel::CancelToken;
use crate::display::Screen;
use crate::error::Result;
use crate::instruction::{Instruction, decode};
use crate::keyboard::Keyboard;
use crate::state::{Chip8State, SoundCallback, Timing};

/// Sleep between timer polls. Well below the 2 ms instruction period.
const IDLE_SLEEP: Duration = Duration::from_micros(250);

/// Fetch/decode/execute driver.
///
/// Instruction cadence comes from a repeating CPU timer in the same
/// [`TimerManager`](crate::timer::TimerManager) as the delay and sound timers:
/// every time it fires, one instruction becomes due and [`Interpreter::run`]
/// executes it.
pub struct Interpreter {
    state: Chip8State,
    due_cycles: Arc<AtomicU32>,
}

impl Interpreter {
    pub fn new(keyboard: Arc<Keyboard>, screen: Screen, timing: &Timing) -> Result<Self> {
        let mut state = Chip8State::new(keyboard, screen, timing.timer_period)?;

        let due_cycles = Arc::new(AtomicU32::new(0));
        let cpu_clock = state.timers.add_timer(timing.cpu_period, true, 1)?;
        if let Some(timer) = state.timers.get_mut(cpu_clock) {
            let due = Arc::clone(&due_cycles);
            timer.register_callback(Box::new(move |_| {
                due.fetch_add(1, Ordering::AcqRel);
            }));
        }

        Ok(Interpreter {
            state,
            due_cycles,
        })
    }

    pub fn state(&self) -> &Chip8State {
        &self.state
    }

    pub fn screen(&self) -> &Screen {
        &self.state.screen
    }

    /// A handle that stops [`Interpreter::run`] from any thread. Tokens taken
    /// before [`Interpreter::reset`] no longer apply afterwards.
    pub fn cancel_token(&self) -> CancelToken {
        self.state.cancel.clone()
    }

    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }

    /// Called with `true` when the tone should start and `false` when it should stop.
    pub fn register_sound_callback(&mut self, callback: SoundCallback) {
        self.state.register_sound_callback(callback);
    }

    /// Returns to the power-on state with a fresh cancel token, so a cancelled
    /// interpreter can run again.
    pub fn reset(&mut self) {
        self.state.reset();
        self.state.cancel = CancelToken::new();
        self.due_cycles.store(0, Ordering::Release);
    }

    pub fn load_program(&mut self, program: &[u8]) -> Result<()> {
        self.state.memory.load_rom(program)?;
        debug!(bytes = program.len(), "program loaded");
        Ok(())
    }

    pub fn load_program_file(&mut self, path: &Path) -> Result<()> {
        let program = std::fs::read(path)?;
        self.load_program(&program)
    }

    fn fetch_instruction(&mut self) -> Result<(u16, Box<dyn Instruction>)> {
        let pc = self.state.pc;
        let high_byte = u16::from(self.state.memory.read(pc)?);
        let low_byte = u16::from(self.state.memory.read(pc + 1)?);
        let raw = (high_byte << 8) | low_byte;

        // Move the program counter to next instruction
        self.state.pc = pc + 2;

        Ok((raw, decode(raw)?))
    }

    /// Executes exactly one instruction.
    pub fn step(&mut self) -> Result<()> {
        let pc = self.state.pc;
        let (raw, instruction) = self.fetch_instruction()?;
        trace!(depth = self.state.stack.depth(), "{pc:#05X}: {raw:#06X}");
        instruction.execute(&mut self.state)?;
        self.state.sync_sound();
        Ok(())
    }

    /// Runs until cancelled or until an instruction fails.
    pub fn run(&mut self) -> Result<()> {
        info!(pc = self.state.pc, "interpreter started");
        let result = self.run_until_cancelled();
        match &result {
            Ok(()) => info!(pc = self.state.pc, "interpreter stopped"),
            Err(err) => error!(pc = self.state.pc, %err, "interpreter halted"),
        }
        result
    }

    fn run_until_cancelled(&mut self) -> Result<()> {
        while !self.state.cancel.is_cancelled() {
            self.state.tick_timers();

            let due = self.due_cycles.swap(0, Ordering::AcqRel);
            for _ in 0..due {
                if self.state.cancel.is_cancelled() {
                    break;
                }
                self.step()?;
            }

            std::thread::sleep(IDLE_SLEEP);
        }
        Ok(())
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use crate::cancel::CancelToken;
use crate::display::Screen;
use crate::error::{Chip8Error, Result};
use crate::keyboard::Keyboard;
use crate::timer::{TimerId, TimerManager};

pub type Address = usize;

pub const MEM_SIZE: usize = 4096;
pub const FONT_ADDR: Address = 0x50;
pub const FONT_HEIGHT: usize = 5;
pub const PC_START_ADDR: Address = 0x200;
pub const ADDRESS_MASK: Address = 0x0FFF;
pub const NUM_REGISTERS: usize = 16;
pub const STACK_DEPTH: usize = 16;
pub const DEFAULT_CPU_HZ: u32 = 500;
pub const DEFAULT_TIMER_HZ: u32 = 60;
pub const DEFAULT_FRAME_RATE: u32 = 60;

pub type SoundCallback = Box<dyn FnMut(bool) + Send>;

const FONT: [u8; 16 * FONT_HEIGHT] = [
    0xF0, 0x90, 0x90, 0x90, 0xF0, // 0
    0x20, 0x60, 0x20, 0x20, 0x70, // 1
    0xF0, 0x10, 0xF0, 0x80, 0xF0, // 2
    0xF0, 0x10, 0xF0, 0x10, 0xF0, // 3
    0x90, 0x90, 0xF0, 0x10, 0x10, // 4
    0xF0, 0x80, 0xF0, 0x10, 0xF0, // 5
    0xF0, 0x80, 0xF0, 0x90, 0xF0, // 6
    0xF0, 0x10, 0x20, 0x40, 0x40, // 7
    0xF0, 0x90, 0xF0, 0x90, 0xF0, // 8
    0xF0, 0x90, 0xF0, 0x10, 0xF0, // 9
    0xF0, 0x90, 0xF0, 0x90, 0x90, // A
    0xE0, 0x90, 0xE0, 0x90, 0xE0, // B
    0xF0, 0x80, 0x80, 0x80, 0xF0, // C
    0xE0, 0x90, 0x90, 0x90, 0xE0, // D
    0xF0, 0x80, 0xF0, 0x80, 0xF0, // E
    0xF0, 0x80, 0xF0, 0x80, 0x80, // F
];

pub struct Memory {
    data: [u8; MEM_SIZE],
}
impl Memory {
    pub fn new() -> Self {
        let mut memory = Memory { data: [0; MEM_SIZE] };
        memory.reset();
        memory
    }

    /// Zeroes everything and puts the font back.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.data[FONT_ADDR..FONT_ADDR + FONT.len()].copy_from_slice(&FONT);
    }

    pub fn read(&self, addr: Address) -> Result<u8> {
        self.data
            .get(addr)
            .copied()
            .ok_or(Chip8Error::MemoryOutOfBounds(addr))
    }

    pub fn write(&mut self, addr: Address, value: u8) -> Result<()> {
        let cell = self
            .data
            .get_mut(addr)
            .ok_or(Chip8Error::MemoryOutOfBounds(addr))?;
        *cell = value;
        Ok(())
    }

    pub fn load_rom(&mut self, rom: &[u8]) -> Result<()> {
        let max = MEM_SIZE - PC_START_ADDR;
        if rom.len() > max {
            return Err(Chip8Error::ProgramTooLarge { len: rom.len(), max });
        }
        self.data[PC_START_ADDR..PC_START_ADDR + rom.len()].copy_from_slice(rom);
        Ok(())
    }

    pub fn read_sprite(&self, index: Address, rows: u8) -> Result<&[u8]> {
        let end = index + usize::from(rows);
        if end > MEM_SIZE {
            return Err(Chip8Error::MemoryOutOfBounds(end - 1));
        }
        Ok(&self.data[index..end])
    }

    pub fn font_glyph(digit: u8) -> Address {
        FONT_ADDR + usize::from(digit & 0x0F) * FONT_HEIGHT
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Register {
    V0,
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
    V7,
    V8,
    V9,
    VA,
    VB,
    VC,
    VD,
    VE,
    VF,
}
impl Register {
    /// Only the low four bits of `nibble` are used.
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0F {
            0x0 => Register::V0,
            0x1 => Register::V1,
            0x2 => Register::V2,
            0x3 => Register::V3,
            0x4 => Register::V4,
            0x5 => Register::V5,
            0x6 => Register::V6,
            0x7 => Register::V7,
            0x8 => Register::V8,
            0x9 => Register::V9,
            0xA => Register::VA,
            0xB => Register::VB,
            0xC => Register::VC,
            0xD => Register::VD,
            0xE => Register::VE,
            _ => Register::VF,
        }
    }
}

#[derive(Default)]
pub struct RegisterBank {
    registers: [u8; NUM_REGISTERS],
}
impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, reg: Register) -> u8 {
        self.registers[reg as usize]
    }

    pub fn write(&mut self, reg: Register, value: u8) {
        self.registers[reg as usize] = value;
    }

    pub fn clear(&mut self) {
        self.registers = [0; NUM_REGISTERS];
    }
}

/// Return addresses of the active subroutine calls.
#[derive(Default)]
pub struct CallStack {
    frames: Vec<Address>,
}
impl CallStack {
    pub fn new() -> Self {
        CallStack {
            frames: Vec::with_capacity(STACK_DEPTH),
        }
    }

    pub fn push(&mut self, addr: Address) -> Result<()> {
        if self.frames.len() >= STACK_DEPTH {
            return Err(Chip8Error::StackOverflow(STACK_DEPTH));
        }
        self.frames.push(addr);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Address> {
        self.frames.pop().ok_or(Chip8Error::StackUnderflow)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Run a CHIP-8 program in the terminal")]
pub struct Settings {
    /// Path to the program image.
    pub rom: PathBuf,
    /// Instructions executed per second.
    #[arg(long, default_value_t = DEFAULT_CPU_HZ, value_parser = clap::value_parser!(u32).range(1..))]
    pub cpu_hz: u32,
    /// Decrement rate of the delay and sound timers.
    #[arg(long, default_value_t = DEFAULT_TIMER_HZ, value_parser = clap::value_parser!(u32).range(1..))]
    pub timer_hz: u32,
    /// Screen refreshes per second.
    #[arg(long, default_value_t = DEFAULT_FRAME_RATE, value_parser = clap::value_parser!(u32).range(1..))]
    pub frame_rate: u32,
    /// Do not open an audio device.
    #[arg(long)]
    pub mute: bool,
}
impl Settings {
    pub fn timing(&self) -> Timing {
        Timing::from_hz(self.cpu_hz, self.timer_hz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub cpu_period: Duration,
    pub timer_period: Duration,
}
impl Timing {
    /// A zero rate gives a zero period, which the timers reject.
    pub fn from_hz(cpu_hz: u32, timer_hz: u32) -> Self {
        let period = |hz: u32| Duration::from_secs(1).checked_div(hz).unwrap_or(Duration::ZERO);
        Timing {
            cpu_period: period(cpu_hz),
            timer_period: period(timer_hz),
        }
    }
}
impl Default for Timing {
    fn default() -> Self {
        Timing::from_hz(DEFAULT_CPU_HZ, DEFAULT_TIMER_HZ)
    }
}

/// Everything an instruction can touch.
pub struct Chip8State {
    pub memory: Memory,
    pub registers: RegisterBank,
    pub pc: Address,
    index: Address,
    pub stack: CallStack,
    pub timers: TimerManager,
    delay_timer: TimerId,
    sound_timer: TimerId,
    pub screen: Screen,
    pub keyboard: Arc<Keyboard>,
    pub cancel: CancelToken,
    sound_callbacks: Vec<SoundCallback>,
    sound_active: bool,
}
impl Chip8State {
    pub fn new(keyboard: Arc<Keyboard>, screen: Screen, timer_period: Duration) -> Result<Self> {
        let mut timers = TimerManager::new();
        let delay_timer = timers.add_timer(timer_period, false, 0)?;
        let sound_timer = timers.add_timer(timer_period, false, 0)?;

        Ok(Chip8State {
            memory: Memory::new(),
            registers: RegisterBank::new(),
            pc: PC_START_ADDR,
            index: 0,
            stack: CallStack::new(),
            timers,
            delay_timer,
            sound_timer,
            screen,
            keyboard,
            cancel: CancelToken::new(),
            sound_callbacks: Vec::new(),
            sound_active: false,
        })
    }

    pub fn reset(&mut self) {
        self.memory.reset();
        self.registers.clear();
        self.pc = PC_START_ADDR;
        self.index = 0;
        self.stack.clear();
        self.set_delay_timer(0);
        self.set_sound_timer(0);
        self.sync_sound();
        self.screen.clear();
    }

    pub fn index(&self) -> Address {
        self.index
    }

    /// The index register only ever holds a 12-bit address.
    pub fn set_index(&mut self, value: Address) {
        self.index = value & ADDRESS_MASK;
    }

    pub fn delay_timer(&self) -> u8 {
        self.read_timer(self.delay_timer)
    }

    pub fn set_delay_timer(&mut self, value: u8) {
        self.write_timer(self.delay_timer, value);
    }

    pub fn sound_timer(&self) -> u8 {
        self.read_timer(self.sound_timer)
    }

    pub fn set_sound_timer(&mut self, value: u8) {
        self.write_timer(self.sound_timer, value);
    }

    /// Called with `true` when the tone should start and `false` when it should stop.
    pub fn register_sound_callback(&mut self, callback: SoundCallback) {
        self.sound_callbacks.push(callback);
    }

    /// Ticks every timer, the CPU clock included.
    pub fn tick_timers(&mut self) {
        self.timers.tick();
        self.sync_sound();
    }

    /// Ticks only the delay and sound timers. Used while the instruction
    /// stream is blocked, so no instructions become due.
    pub fn tick_countdowns_at(&mut self, now: Instant) {
        for id in [self.delay_timer, self.sound_timer] {
            if let Some(timer) = self.timers.get_mut(id) {
                timer.tick(now);
            }
        }
        self.sync_sound();
    }

    /// Reports a tone start or stop to the sound callbacks.
    pub(crate) fn sync_sound(&mut self) {
        let active = self.sound_timer() > 0;
        if active != self.sound_active {
            self.sound_active = active;
            for callback in &mut self.sound_callbacks {
                callback(active);
            }
        }
    }

    fn read_timer(&self, id: TimerId) -> u8 {
        self.timers
            .get(id)
            .map_or(0, |timer| u8::try_from(timer.remaining()).unwrap_or(u8::MAX))
    }

    fn write_timer(&mut self, id: TimerId, value: u8) {
        if let Some(timer) = self.timers.get_mut(id) {
            timer.set_remaining(u32::from(value));
        }
    }

    /// Reads the sprite at the index register and XORs it onto the screen.
    pub fn draw_sprite(&mut self, x: u8, y: u8, rows: u8) -> Result<bool> {
        let sprite = self.memory.read_sprite(self.index, rows)?;
        Ok(self.screen.draw(x, y, sprite))
    }
}

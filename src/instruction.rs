use std::sync::Arc;
use std::time::Duration;

use crate::error::{Chip8Error, Result};
use crate::keyboard::Key;
use crate::state::{Address, Chip8State, Memory, Register};

/// How often the delay and sound timers are polled while Fx0A blocks.
const KEY_WAIT_POLL: Duration = Duration::from_millis(1);

pub trait Instruction {
    /// Runs the instruction. The program counter already points past it.
    fn execute(&self, state: &mut Chip8State) -> Result<()>;
}

pub fn decode(raw: u16) -> Result<Box<dyn Instruction>> {
    let decoded = DecodedInstruction::new(raw);

    match decoded.opcode {
        0x0 => match raw {
            0x00E0 => Ok(Box::new(ClearScreen)),
            0x00EE => Ok(Box::new(SubroutineReturn)),
            _ => Err(Chip8Error::Decode(raw)),
        },
        0x1 => Ok(Box::new(Jump(decoded))),
        0x2 => Ok(Box::new(SubroutineCall(decoded))),
        0x3 => Ok(Box::new(SkipEqImmediate(decoded))),
        0x4 => Ok(Box::new(SkipNeqImmediate(decoded))),
        0x5 if decoded.n == 0 => Ok(Box::new(SkipEqRegister(decoded))),
        0x6 => Ok(Box::new(SetImmediate(decoded))),
        0x7 => Ok(Box::new(AddImmediate(decoded))),
        0x8 => match decoded.n {
            0x0 => Ok(Box::new(SetXToY(decoded))),
            0x1 => Ok(Box::new(BinaryOr(decoded))),
            0x2 => Ok(Box::new(BinaryAnd(decoded))),
            0x3 => Ok(Box::new(BinaryXor(decoded))),
            0x4 => Ok(Box::new(AddWithCarry(decoded))),
            0x5 => Ok(Box::new(SubtractYFromX(decoded))),
            0x6 => Ok(Box::new(RightShift(decoded))),
            0x7 => Ok(Box::new(SubtractXFromY(decoded))),
            0xE => Ok(Box::new(LeftShift(decoded))),
            _ => Err(Chip8Error::Decode(raw)),
        },
        0x9 if decoded.n == 0 => Ok(Box::new(SkipNeqRegister(decoded))),
        0xA => Ok(Box::new(SetIndex(decoded))),
        0xB => Ok(Box::new(JumpWithOffset(decoded))),
        0xC => Ok(Box::new(Random(decoded))),
        0xD => Ok(Box::new(Draw(decoded))),
        0xE => match decoded.nn {
            0x9E => Ok(Box::new(SkipIfKeyPressed(decoded))),
            0xA1 => Ok(Box::new(SkipIfKeyNotPressed(decoded))),
            _ => Err(Chip8Error::Decode(raw)),
        },
        0xF => match decoded.nn {
            0x07 => Ok(Box::new(ReadDelayTimer(decoded))),
            0x0A => Ok(Box::new(WaitForKey(decoded))),
            0x15 => Ok(Box::new(SetDelayTimer(decoded))),
            0x18 => Ok(Box::new(SetSoundTimer(decoded))),
            0x1E => Ok(Box::new(AddToIndex(decoded))),
            0x29 => Ok(Box::new(FontChar(decoded))),
            0x33 => Ok(Box::new(BinaryCodedDecimal(decoded))),
            0x55 => Ok(Box::new(Store(decoded))),
            0x65 => Ok(Box::new(Load(decoded))),
            _ => Err(Chip8Error::Decode(raw)),
        },
        _ => Err(Chip8Error::Decode(raw)),
    }
}

struct DecodedInstruction {
    /// First nibble. Selects the instruction family.
    opcode: u8,
    /// Second nibble. Register operand.
    x: Register,
    /// Third nibble. Register operand.
    y: Register,
    /// Fourth nibble. A 4-bit number.
    n: u8,
    /// The second byte. An 8-bit immediate.
    nn: u8,
    /// The low twelve bits. An address.
    nnn: Address,
}
impl DecodedInstruction {
    fn new(raw: u16) -> Self {
        DecodedInstruction {
            opcode: (raw >> 12) as u8,
            x: Register::from_nibble((raw >> 8) as u8),
            y: Register::from_nibble((raw >> 4) as u8),
            n: (raw & 0x0F) as u8,
            nn: (raw & 0x00FF) as u8,
            nnn: usize::from(raw & 0x0FFF),
        }
    }

    /// Number of registers covered by V0..=VX.
    fn register_span(&self) -> usize {
        self.x as usize + 1
    }
}

fn skip(state: &mut Chip8State) {
    state.pc += 2;
}

/// Writes the result first and the flag second, so VF keeps the flag when X is F.
fn write_with_flag(state: &mut Chip8State, reg: Register, value: u8, flag: bool) {
    state.registers.write(reg, value);
    state.registers.write(Register::VF, u8::from(flag));
}

struct ClearScreen;
impl Instruction for ClearScreen {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        state.screen.clear();
        Ok(())
    }
}

struct Jump(DecodedInstruction);
impl Instruction for Jump {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        state.pc = self.0.nnn;
        Ok(())
    }
}

struct JumpWithOffset(DecodedInstruction);
impl Instruction for JumpWithOffset {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        state.pc = self.0.nnn + usize::from(state.registers.read(Register::V0));
        Ok(())
    }
}

struct SubroutineCall(DecodedInstruction);
impl Instruction for SubroutineCall {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        state.stack.push(state.pc)?;
        state.pc = self.0.nnn;
        Ok(())
    }
}

struct SubroutineReturn;
impl Instruction for SubroutineReturn {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        state.pc = state.stack.pop()?;
        Ok(())
    }
}

struct SkipEqImmediate(DecodedInstruction);
impl Instruction for SkipEqImmediate {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        if state.registers.read(self.0.x) == self.0.nn {
            skip(state);
        }
        Ok(())
    }
}

struct SkipNeqImmediate(DecodedInstruction);
impl Instruction for SkipNeqImmediate {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        if state.registers.read(self.0.x) != self.0.nn {
            skip(state);
        }
        Ok(())
    }
}

struct SkipEqRegister(DecodedInstruction);
impl Instruction for SkipEqRegister {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        if state.registers.read(self.0.x) == state.registers.read(self.0.y) {
            skip(state);
        }
        Ok(())
    }
}

struct SkipNeqRegister(DecodedInstruction);
impl Instruction for SkipNeqRegister {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        if state.registers.read(self.0.x) != state.registers.read(self.0.y) {
            skip(state);
        }
        Ok(())
    }
}

struct SetImmediate(DecodedInstruction);
impl Instruction for SetImmediate {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        state.registers.write(self.0.x, self.0.nn);
        Ok(())
    }
}

struct AddImmediate(DecodedInstruction);
impl Instruction for AddImmediate {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        state.registers.write(self.0.x, value_x.wrapping_add(self.0.nn));
        Ok(())
    }
}

struct SetXToY(DecodedInstruction);
impl Instruction for SetXToY {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_y = state.registers.read(self.0.y);
        state.registers.write(self.0.x, value_y);
        Ok(())
    }
}

struct BinaryOr(DecodedInstruction);
impl Instruction for BinaryOr {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        let value_y = state.registers.read(self.0.y);
        state.registers.write(self.0.x, value_x | value_y);
        Ok(())
    }
}

struct BinaryAnd(DecodedInstruction);
impl Instruction for BinaryAnd {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        let value_y = state.registers.read(self.0.y);
        state.registers.write(self.0.x, value_x & value_y);
        Ok(())
    }
}

struct BinaryXor(DecodedInstruction);
impl Instruction for BinaryXor {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        let value_y = state.registers.read(self.0.y);
        state.registers.write(self.0.x, value_x ^ value_y);
        Ok(())
    }
}

struct AddWithCarry(DecodedInstruction);
impl Instruction for AddWithCarry {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        let value_y = state.registers.read(self.0.y);
        let (sum, carry) = value_x.overflowing_add(value_y);
        write_with_flag(state, self.0.x, sum, carry);
        Ok(())
    }
}

struct SubtractYFromX(DecodedInstruction);
impl Instruction for SubtractYFromX {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        let value_y = state.registers.read(self.0.y);
        // VF is set when no borrow occurs.
        write_with_flag(state, self.0.x, value_x.wrapping_sub(value_y), value_x >= value_y);
        Ok(())
    }
}

struct SubtractXFromY(DecodedInstruction);
impl Instruction for SubtractXFromY {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        let value_y = state.registers.read(self.0.y);
        write_with_flag(state, self.0.x, value_y.wrapping_sub(value_x), value_y >= value_x);
        Ok(())
    }
}

struct RightShift(DecodedInstruction);
impl Instruction for RightShift {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        write_with_flag(state, self.0.x, value_x >> 1, value_x & 0x01 != 0);
        Ok(())
    }
}

struct LeftShift(DecodedInstruction);
impl Instruction for LeftShift {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        write_with_flag(state, self.0.x, value_x << 1, value_x & 0x80 != 0);
        Ok(())
    }
}

struct SetIndex(DecodedInstruction);
impl Instruction for SetIndex {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        state.set_index(self.0.nnn);
        Ok(())
    }
}

struct Random(DecodedInstruction);
impl Instruction for Random {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let random_value = rand::random::<u8>() & self.0.nn;
        state.registers.write(self.0.x, random_value);
        Ok(())
    }
}

struct Draw(DecodedInstruction);
impl Instruction for Draw {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let x = state.registers.read(self.0.x);
        let y = state.registers.read(self.0.y);
        let collision = state.draw_sprite(x, y, self.0.n)?;
        state.registers.write(Register::VF, u8::from(collision));
        Ok(())
    }
}

struct SkipIfKeyPressed(DecodedInstruction);
impl Instruction for SkipIfKeyPressed {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let key = Key::from_index(state.registers.read(self.0.x))?;
        if state.keyboard.is_key_pressed(key) {
            skip(state);
        }
        Ok(())
    }
}

struct SkipIfKeyNotPressed(DecodedInstruction);
impl Instruction for SkipIfKeyNotPressed {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let key = Key::from_index(state.registers.read(self.0.x))?;
        if !state.keyboard.is_key_pressed(key) {
            skip(state);
        }
        Ok(())
    }
}

struct ReadDelayTimer(DecodedInstruction);
impl Instruction for ReadDelayTimer {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let delay = state.delay_timer();
        state.registers.write(self.0.x, delay);
        Ok(())
    }
}

struct WaitForKey(DecodedInstruction);
impl Instruction for WaitForKey {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let keyboard = Arc::clone(&state.keyboard);
        let cancel = state.cancel.clone();
        let request = keyboard.next_key_press();
        let pressed =
            request.wait_ticking(&cancel, KEY_WAIT_POLL, |now| state.tick_countdowns_at(now));
        match pressed {
            Some(key) => state.registers.write(self.0.x, key.index()),
            // Cancelled: the saved pc points back at this wait.
            None => state.pc -= 2,
        }
        Ok(())
    }
}

struct SetDelayTimer(DecodedInstruction);
impl Instruction for SetDelayTimer {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        state.set_delay_timer(value_x);
        Ok(())
    }
}

struct SetSoundTimer(DecodedInstruction);
impl Instruction for SetSoundTimer {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        state.set_sound_timer(value_x);
        Ok(())
    }
}

struct AddToIndex(DecodedInstruction);
impl Instruction for AddToIndex {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        let index = state.index() + usize::from(value_x);
        state.set_index(index);
        Ok(())
    }
}

struct FontChar(DecodedInstruction);
impl Instruction for FontChar {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        state.set_index(Memory::font_glyph(value_x));
        Ok(())
    }
}

struct BinaryCodedDecimal(DecodedInstruction);
impl Instruction for BinaryCodedDecimal {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let value_x = state.registers.read(self.0.x);
        let index = state.index();
        let bcd = [value_x / 100, (value_x / 10) % 10, value_x % 10];
        for (offset, digit) in bcd.into_iter().enumerate() {
            state.memory.write(index + offset, digit)?;
        }
        Ok(())
    }
}

struct Store(DecodedInstruction);
impl Instruction for Store {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let index = state.index();
        for offset in 0..self.0.register_span() {
            let value = state.registers.read(Register::from_nibble(offset as u8));
            state.memory.write(index + offset, value)?;
        }
        Ok(())
    }
}

struct Load(DecodedInstruction);
impl Instruction for Load {
    fn execute(&self, state: &mut Chip8State) -> Result<()> {
        let index = state.index();
        for offset in 0..self.0.register_span() {
            let value = state.memory.read(index + offset)?;
            state.registers.write(Register::from_nibble(offset as u8), value);
        }
        Ok(())
    }
}

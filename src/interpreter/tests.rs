use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use super::Interpreter;
use crate::display::Screen;
use crate::error::Chip8Error;
use crate::keyboard::{Key, Keyboard};
use crate::state::{Memory, PC_START_ADDR, Register, STACK_DEPTH, Timing};

fn interpreter_with(program: &[u16]) -> Interpreter {
    interpreter_with_keyboard(program, Arc::new(Keyboard::new()))
}

fn interpreter_with_keyboard(program: &[u16], keyboard: Arc<Keyboard>) -> Interpreter {
    let bytes: Vec<u8> = program.iter().flat_map(|word| word.to_be_bytes()).collect();
    let mut interpreter = Interpreter::new(keyboard, Screen::new(), &Timing::default()).unwrap();
    interpreter.load_program(&bytes).unwrap();
    interpreter
}

fn reg(interpreter: &Interpreter, index: u8) -> u8 {
    interpreter.state().registers.read(Register::from_nibble(index))
}

fn set_reg(interpreter: &mut Interpreter, index: u8, value: u8) {
    interpreter.state.registers.write(Register::from_nibble(index), value);
}

/// Sets VX and VY, runs `8XY<op>` and returns (VX, VF).
fn alu(op: u16, value_x: u8, value_y: u8) -> (u8, u8) {
    let mut interpreter = interpreter_with(&[0x8120 | op]);
    set_reg(&mut interpreter, 1, value_x);
    set_reg(&mut interpreter, 2, value_y);
    interpreter.step().unwrap();
    (reg(&interpreter, 1), reg(&interpreter, 0xF))
}

proptest! {
    #[test]
    fn load_immediate_reads_back(x in 0u8..15, kk in any::<u8>()) {
        let mut interpreter = interpreter_with(&[0x6000 | u16::from(x) << 8 | u16::from(kk)]);
        interpreter.step().unwrap();
        prop_assert_eq!(reg(&interpreter, x), kk);
        prop_assert_eq!(interpreter.state().pc, PC_START_ADDR + 2);
    }

    #[test]
    fn add_immediate_wraps_without_touching_flag(start in any::<u8>(), kk in any::<u8>()) {
        let mut interpreter = interpreter_with(&[0x7300 | u16::from(kk)]);
        set_reg(&mut interpreter, 3, start);
        set_reg(&mut interpreter, 0xF, 0x55);
        interpreter.step().unwrap();
        prop_assert_eq!(reg(&interpreter, 3), start.wrapping_add(kk));
        prop_assert_eq!(reg(&interpreter, 0xF), 0x55);
    }

    #[test]
    fn bcd_digits_recompose(value in any::<u8>()) {
        let mut interpreter = interpreter_with(&[0xA300, 0xF433]);
        set_reg(&mut interpreter, 4, value);
        interpreter.step().unwrap();
        interpreter.step().unwrap();

        let memory = &interpreter.state().memory;
        let digits: Vec<u8> = (0..3).map(|i| memory.read(0x300 + i).unwrap()).collect();
        prop_assert!(digits.iter().all(|&d| d < 10));
        prop_assert_eq!(
            u32::from(digits[0]) * 100 + u32::from(digits[1]) * 10 + u32::from(digits[2]),
            u32::from(value)
        );
    }
}

#[test]
fn logic_operations() {
    assert_eq!(alu(0x0, 0x12, 0x34).0, 0x34);
    assert_eq!(alu(0x1, 0b1100, 0b1010).0, 0b1110);
    assert_eq!(alu(0x2, 0b1100, 0b1010).0, 0b1000);
    assert_eq!(alu(0x3, 0b1100, 0b1010).0, 0b0110);
}

#[test]
fn add_sets_carry_on_overflow() {
    assert_eq!(alu(0x4, 0xFF, 0x01), (0x00, 1));
    assert_eq!(alu(0x4, 0x01, 0x01), (0x02, 0));
}

#[test]
fn subtract_flags_no_borrow() {
    assert_eq!(alu(0x5, 0x01, 0x02), (0xFF, 0));
    assert_eq!(alu(0x5, 0x02, 0x01), (0x01, 1));
    assert_eq!(alu(0x5, 0x07, 0x07), (0x00, 1));

    assert_eq!(alu(0x7, 0x02, 0x01), (0xFF, 0));
    assert_eq!(alu(0x7, 0x01, 0x02), (0x01, 1));
}

#[test]
fn shifts_capture_the_outgoing_bit() {
    assert_eq!(alu(0xE, 0b1000_0001, 0), (0b0000_0010, 1));
    assert_eq!(alu(0xE, 0b0100_0000, 0), (0b1000_0000, 0));
    assert_eq!(alu(0x6, 0b0000_0011, 0), (0b0000_0001, 1));
    assert_eq!(alu(0x6, 0b0000_0010, 0), (0b0000_0001, 0));
}

#[test]
fn shifts_use_vx_not_vy() {
    assert_eq!(alu(0x6, 0x04, 0xFF), (0x02, 0));
}

#[test]
fn flag_wins_when_vf_is_the_destination() {
    // 8FF4: VF + VF with VF = 0x80 overflows, so VF ends as the carry.
    let mut interpreter = interpreter_with(&[0x8FF4]);
    set_reg(&mut interpreter, 0xF, 0x80);
    interpreter.step().unwrap();
    assert_eq!(reg(&interpreter, 0xF), 1);

    // 8F15: VF(0x01) - V1(0x02) borrows.
    let mut interpreter = interpreter_with(&[0x8F15]);
    set_reg(&mut interpreter, 0xF, 0x01);
    set_reg(&mut interpreter, 1, 0x02);
    interpreter.step().unwrap();
    assert_eq!(reg(&interpreter, 0xF), 0);
}

#[test]
fn skips_advance_past_the_next_instruction() {
    let cases: [(u16, u8, u8, bool); 8] = [
        (0x3142, 0x42, 0, true),
        (0x3142, 0x41, 0, false),
        (0x4142, 0x41, 0, true),
        (0x4142, 0x42, 0, false),
        (0x5120, 0x09, 0x09, true),
        (0x5120, 0x09, 0x08, false),
        (0x9120, 0x09, 0x08, true),
        (0x9120, 0x09, 0x09, false),
    ];

    for (opcode, value_x, value_y, skipped) in cases {
        let mut interpreter = interpreter_with(&[opcode]);
        set_reg(&mut interpreter, 1, value_x);
        set_reg(&mut interpreter, 2, value_y);
        interpreter.step().unwrap();
        let expected = PC_START_ADDR + if skipped { 4 } else { 2 };
        assert_eq!(interpreter.state().pc, expected, "opcode {opcode:#06X}");
    }
}

#[test]
fn jumps_set_the_program_counter() {
    let mut interpreter = interpreter_with(&[0x1ABC]);
    interpreter.step().unwrap();
    assert_eq!(interpreter.state().pc, 0xABC);

    let mut interpreter = interpreter_with(&[0xB300]);
    set_reg(&mut interpreter, 0, 0x10);
    interpreter.step().unwrap();
    assert_eq!(interpreter.state().pc, 0x310);
}

#[test]
fn call_and_return() {
    // 0x200: call 0x206; 0x202: V1 := 1; 0x204: jump 0x204; 0x206: return
    let mut interpreter = interpreter_with(&[0x2206, 0x6101, 0x1204, 0x00EE]);

    interpreter.step().unwrap();
    assert_eq!(interpreter.state().pc, 0x206);
    assert_eq!(interpreter.state().stack.depth(), 1);

    interpreter.step().unwrap();
    assert_eq!(interpreter.state().pc, 0x202);
    assert_eq!(interpreter.state().stack.depth(), 0);

    interpreter.step().unwrap();
    assert_eq!(reg(&interpreter, 1), 1);
}

#[test]
fn call_depth_is_limited() {
    // Each call targets the next word, so the chain nests one level per step.
    let program: Vec<u16> = (0..=STACK_DEPTH as u16)
        .map(|i| 0x2000 | (PC_START_ADDR as u16 + 2 * (i + 1)))
        .collect();
    let mut interpreter = interpreter_with(&program);

    for _ in 0..STACK_DEPTH {
        interpreter.step().unwrap();
    }
    assert_eq!(interpreter.state().stack.depth(), STACK_DEPTH);
    assert!(matches!(
        interpreter.step(),
        Err(Chip8Error::StackOverflow(STACK_DEPTH))
    ));
}

#[test]
fn return_without_call_underflows() {
    let mut interpreter = interpreter_with(&[0x00EE]);
    assert!(matches!(interpreter.step(), Err(Chip8Error::StackUnderflow)));
}

#[test]
fn unknown_instructions_carry_their_encoding() {
    for raw in [0x0123, 0x5121, 0x8128, 0x9121, 0xE1FF, 0xF1FF] {
        let mut interpreter = interpreter_with(&[raw]);
        match interpreter.step() {
            Err(Chip8Error::Decode(value)) => assert_eq!(value, raw),
            other => panic!("expected decode error for {raw:#06X}, got {other:?}"),
        }
    }
}

#[test]
fn random_is_masked() {
    let mut interpreter = interpreter_with(&[0xC50F; 32]);
    for _ in 0..32 {
        interpreter.step().unwrap();
        assert_eq!(reg(&interpreter, 5) & 0xF0, 0);
    }

    let mut interpreter = interpreter_with(&[0xC500]);
    set_reg(&mut interpreter, 5, 0xFF);
    interpreter.step().unwrap();
    assert_eq!(reg(&interpreter, 5), 0);
}

#[test]
fn draw_reports_collision_in_vf() {
    // I := glyph 0; draw at (V1, V2); draw again.
    let mut interpreter = interpreter_with(&[0xF029, 0xD125, 0xD125]);
    set_reg(&mut interpreter, 1, 3);
    set_reg(&mut interpreter, 2, 4);

    interpreter.step().unwrap();
    assert_eq!(interpreter.state().index(), Memory::font_glyph(0));

    interpreter.step().unwrap();
    assert_eq!(reg(&interpreter, 0xF), 0);
    assert!(interpreter.screen().pixel(3, 4));
    assert!(interpreter.screen().pixel(6, 8));
    assert!(!interpreter.screen().pixel(4, 5));

    interpreter.step().unwrap();
    assert_eq!(reg(&interpreter, 0xF), 1);
    assert!(interpreter.screen().is_blank());
}

#[test]
fn draw_past_the_end_of_memory_is_an_error() {
    let mut interpreter = interpreter_with(&[0xAFFE, 0xD00F]);
    interpreter.step().unwrap();
    assert!(matches!(
        interpreter.step(),
        Err(Chip8Error::MemoryOutOfBounds(_))
    ));
}

#[test]
fn clear_screen_blanks_the_frame() {
    let mut interpreter = interpreter_with(&[0xA050, 0xD015, 0x00E0]);
    interpreter.step().unwrap();
    interpreter.step().unwrap();
    assert!(!interpreter.screen().is_blank());
    interpreter.step().unwrap();
    assert!(interpreter.screen().is_blank());
}

#[test]
fn index_arithmetic_is_masked() {
    let mut interpreter = interpreter_with(&[0xAFFF, 0xF31E]);
    set_reg(&mut interpreter, 3, 0x02);
    interpreter.step().unwrap();
    interpreter.step().unwrap();
    assert_eq!(interpreter.state().index(), 0x001);
}

#[test]
fn font_char_uses_low_nibble() {
    let mut interpreter = interpreter_with(&[0xF729]);
    set_reg(&mut interpreter, 7, 0x1A);
    interpreter.step().unwrap();
    assert_eq!(interpreter.state().index(), Memory::font_glyph(0xA));
}

#[test]
fn store_and_load_registers() {
    let mut interpreter = interpreter_with(&[0xA400, 0xF355, 0x6000, 0x6100, 0x6300, 0x6400, 0xF365]);
    for i in 0..=4 {
        set_reg(&mut interpreter, i, 0x10 + i);
    }

    interpreter.step().unwrap();
    interpreter.step().unwrap();
    let memory = &interpreter.state().memory;
    assert_eq!(memory.read(0x400).unwrap(), 0x10);
    assert_eq!(memory.read(0x403).unwrap(), 0x13);
    assert_eq!(memory.read(0x404).unwrap(), 0x00);
    assert_eq!(interpreter.state().index(), 0x400);

    for _ in 0..5 {
        interpreter.step().unwrap();
    }
    assert_eq!(reg(&interpreter, 0), 0x10);
    assert_eq!(reg(&interpreter, 1), 0x11);
    assert_eq!(reg(&interpreter, 3), 0x13);
    assert_eq!(reg(&interpreter, 4), 0x00);
}

#[test]
fn bcd_of_known_value() {
    let mut interpreter = interpreter_with(&[0xA500, 0xF233]);
    set_reg(&mut interpreter, 2, 254);
    interpreter.step().unwrap();
    interpreter.step().unwrap();
    let memory = &interpreter.state().memory;
    assert_eq!(memory.read(0x500).unwrap(), 2);
    assert_eq!(memory.read(0x501).unwrap(), 5);
    assert_eq!(memory.read(0x502).unwrap(), 4);
}

#[test]
fn delay_timer_round_trip() {
    let mut interpreter = interpreter_with(&[0xF615, 0xF707]);
    set_reg(&mut interpreter, 6, 42);
    interpreter.step().unwrap();
    assert_eq!(interpreter.state().delay_timer(), 42);
    interpreter.step().unwrap();
    assert_eq!(reg(&interpreter, 7), 42);
}

#[test]
fn sound_callbacks_follow_the_sound_timer() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut interpreter = interpreter_with(&[0xF118, 0xF218]);
    interpreter.register_sound_callback(Box::new(move |active| sink.lock().unwrap().push(active)));

    set_reg(&mut interpreter, 1, 5);
    interpreter.step().unwrap();
    assert_eq!(interpreter.state().sound_timer(), 5);
    interpreter.step().unwrap();

    assert_eq!(*events.lock().unwrap(), vec![true, false]);
}

/// Advances the timers to `now` the way the run loop does.
fn tick_at(interpreter: &mut Interpreter, now: Instant) {
    interpreter.state.timers.tick_at(now);
    interpreter.state.sync_sound();
}

#[test]
fn delay_timer_counts_down_once_per_period() {
    let mut interpreter = interpreter_with(&[0x6003, 0xF015, 0xF107, 0xF207, 0xF307, 0xF407, 0xF507]);
    let period = Timing::default().timer_period;
    interpreter.step().unwrap();
    interpreter.step().unwrap();
    let start = Instant::now();

    // A poll right after the load is still inside the first period.
    tick_at(&mut interpreter, start + Duration::from_millis(1));
    interpreter.step().unwrap();
    assert_eq!(reg(&interpreter, 1), 3);

    for (k, register) in (1u32..=3).zip(2u8..=4) {
        tick_at(&mut interpreter, start + period * k);
        interpreter.step().unwrap();
        assert_eq!(reg(&interpreter, register), 3 - k as u8);
    }

    tick_at(&mut interpreter, start + period * 4);
    interpreter.step().unwrap();
    assert_eq!(reg(&interpreter, 5), 0);
}

#[test]
fn sound_stops_when_the_timer_runs_out() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut interpreter = interpreter_with(&[0x6002, 0xF018]);
    interpreter.register_sound_callback(Box::new(move |active| sink.lock().unwrap().push(active)));
    let period = Timing::default().timer_period;

    interpreter.step().unwrap();
    interpreter.step().unwrap();
    let start = Instant::now();
    assert_eq!(*events.lock().unwrap(), vec![true]);

    tick_at(&mut interpreter, start + period);
    assert_eq!(interpreter.state().sound_timer(), 1);
    assert_eq!(*events.lock().unwrap(), vec![true]);

    tick_at(&mut interpreter, start + period * 2);
    assert_eq!(interpreter.state().sound_timer(), 0);
    assert_eq!(*events.lock().unwrap(), vec![true, false]);
}

#[test]
fn timers_keep_running_while_waiting_for_a_key() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut interpreter = interpreter_with(&[0x6005, 0xF018, 0xF015, 0xF10A]);
    interpreter.register_sound_callback(Box::new(move |active| sink.lock().unwrap().push(active)));
    let cancel = interpreter.cancel_token();

    let worker = thread::spawn(move || interpreter.run().map(|()| interpreter));
    // Five ticks at 60 Hz take about 83 ms.
    thread::sleep(Duration::from_millis(400));
    assert!(!worker.is_finished());
    assert_eq!(*events.lock().unwrap(), vec![true, false]);
    cancel.cancel();

    let interpreter = worker.join().unwrap().unwrap();
    assert_eq!(interpreter.state().pc, PC_START_ADDR + 6);
    assert_eq!(interpreter.state().sound_timer(), 0);
    assert_eq!(interpreter.state().delay_timer(), 0);
}

#[test]
fn key_skips_follow_keyboard_state() {
    let keyboard = Arc::new(Keyboard::new());
    let mut interpreter = interpreter_with_keyboard(&[0xE39E, 0xE3A1, 0xE3A1], Arc::clone(&keyboard));
    set_reg(&mut interpreter, 3, 0xB);

    interpreter.step().unwrap();
    assert_eq!(interpreter.state().pc, PC_START_ADDR + 2);

    keyboard.set_key_pressed(Key::KeyB, true);
    interpreter.step().unwrap();
    assert_eq!(interpreter.state().pc, PC_START_ADDR + 4);

    keyboard.set_key_pressed(Key::KeyB, false);
    interpreter.step().unwrap();
    assert_eq!(interpreter.state().pc, PC_START_ADDR + 8);
}

#[test]
fn key_skip_with_out_of_range_key_is_an_error() {
    let mut interpreter = interpreter_with(&[0xE39E]);
    set_reg(&mut interpreter, 3, 0x10);
    assert!(matches!(interpreter.step(), Err(Chip8Error::InvalidKey(0x10))));
}

#[test]
fn wait_for_key_blocks_until_pressed() {
    let keyboard = Arc::new(Keyboard::new());
    let mut interpreter = interpreter_with_keyboard(&[0xF50A], Arc::clone(&keyboard));

    let worker = thread::spawn(move || {
        interpreter.step().map(|()| interpreter)
    });
    while !worker.is_finished() {
        keyboard.set_key_pressed(Key::Key7, true);
        thread::sleep(Duration::from_millis(2));
        keyboard.set_key_pressed(Key::Key7, false);
        thread::sleep(Duration::from_millis(2));
    }

    let interpreter = worker.join().unwrap().unwrap();
    assert_eq!(reg(&interpreter, 5), 7);
    assert_eq!(interpreter.state().pc, PC_START_ADDR + 2);
}

#[test]
fn cancel_releases_a_pending_key_wait() {
    let mut interpreter = interpreter_with(&[0xF50A]);
    let cancel = interpreter.cancel_token();

    let worker = thread::spawn(move || interpreter.run().map(|()| interpreter));
    thread::sleep(Duration::from_millis(50));
    cancel.cancel();

    let interpreter = worker.join().unwrap().unwrap();
    assert_eq!(interpreter.state().pc, PC_START_ADDR);
}

#[test]
fn clear_and_jump_to_self_runs_until_cancelled() {
    let mut interpreter = interpreter_with(&[0x00E0, 0x1200]);
    let cancel = interpreter.cancel_token();

    let worker = thread::spawn(move || interpreter.run().map(|()| interpreter));
    thread::sleep(Duration::from_millis(100));
    assert!(!worker.is_finished());
    cancel.cancel();

    let interpreter = worker.join().unwrap().unwrap();
    assert!(interpreter.screen().is_blank());
    assert!(interpreter.state().pc == PC_START_ADDR || interpreter.state().pc == PC_START_ADDR + 2);
}

#[test]
fn run_stops_on_fatal_error() {
    let mut interpreter = interpreter_with(&[0x6001, 0xFFFF]);
    let result = interpreter.run();
    assert!(matches!(result, Err(Chip8Error::Decode(0xFFFF))));
    assert_eq!(reg(&interpreter, 0), 1);
}

#[test]
fn run_executes_at_the_configured_rate() {
    // V0 += 1 forever; at 500 Hz roughly 100 instructions run in 200 ms.
    let mut interpreter = interpreter_with(&[0x7001, 0x1200]);
    let cancel = interpreter.cancel_token();

    let worker = thread::spawn(move || interpreter.run().map(|()| interpreter));
    thread::sleep(Duration::from_millis(200));
    cancel.cancel();

    let interpreter = worker.join().unwrap().unwrap();
    let increments = reg(&interpreter, 0);
    assert!(increments > 10, "only {increments} increments");
}

#[test]
fn reset_restores_power_on_state() {
    let mut interpreter = interpreter_with(&[0x6A55, 0xA123, 0x2300]);
    interpreter.state.screen.draw(0, 0, &[0xFF]);
    interpreter.state.set_delay_timer(9);
    for _ in 0..3 {
        interpreter.step().unwrap();
    }

    interpreter.reset();
    interpreter.reset();

    let state = interpreter.state();
    assert_eq!(reg(&interpreter, 0xA), 0);
    assert_eq!(state.index(), 0);
    assert_eq!(state.pc, PC_START_ADDR);
    assert_eq!(state.stack.depth(), 0);
    assert_eq!(state.delay_timer(), 0);
    assert_eq!(state.memory.read(PC_START_ADDR).unwrap(), 0);
    assert_eq!(state.memory.read(Memory::font_glyph(0)).unwrap(), 0xF0);
    assert!(interpreter.screen().is_blank());
}

#[test]
fn reset_interpreter_can_run_again_after_cancel() {
    let mut interpreter = interpreter_with(&[0xF50A]);
    let cancel = interpreter.cancel_token();
    cancel.cancel();
    interpreter.run().unwrap();
    assert_eq!(interpreter.state().pc, PC_START_ADDR);

    interpreter.reset();
    assert!(cancel.is_cancelled());
    assert!(!interpreter.cancel_token().is_cancelled());

    interpreter.load_program(&[0x70, 0x01, 0x12, 0x00]).unwrap();
    let cancel = interpreter.cancel_token();
    let worker = thread::spawn(move || interpreter.run().map(|()| interpreter));
    thread::sleep(Duration::from_millis(50));
    assert!(!worker.is_finished());
    cancel.cancel();

    let interpreter = worker.join().unwrap().unwrap();
    assert!(reg(&interpreter, 0) > 0);
}

#[test]
fn load_program_file_reports_missing_files() {
    let mut interpreter = interpreter_with(&[]);
    let missing = std::env::temp_dir().join("chip8-vm-no-such-program.ch8");
    assert!(matches!(
        interpreter.load_program_file(&missing),
        Err(Chip8Error::Io(_))
    ));
}

#[test]
fn load_program_file_copies_bytes() {
    let path = std::env::temp_dir().join(format!("chip8-vm-test-{}.ch8", std::process::id()));
    std::fs::write(&path, [0x12, 0x34]).unwrap();

    let mut interpreter = interpreter_with(&[]);
    interpreter.load_program_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(interpreter.state().memory.read(PC_START_ADDR).unwrap(), 0x12);
    assert_eq!(interpreter.state().memory.read(PC_START_ADDR + 1).unwrap(), 0x34);
}

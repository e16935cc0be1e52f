use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use bitvec::array::BitArray;
use crossbeam_channel::Receiver;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Terminal,
    backend::CrosstermBackend,
    layout::Alignment,
    style::{Color, Style},
    widgets::{Block, Borders, Paragraph},
};
use rodio::{OutputStream, Sink, Source, source::SineWave};
use tracing::{info, warn};

use crate::display::{DISPLAY_HEIGHT, DISPLAY_WIDTH, Frame, Screen};
use crate::interpreter::Interpreter;
use crate::keyboard::{Key, Keyboard};
use crate::state::Settings;

const DEFAULT_FREQUENCY: f32 = 440.0;

type Backend = CrosstermBackend<std::io::Stdout>;

pub struct Beep {
    sink: Sink,
    #[allow(dead_code)]
    stream: OutputStream,
}

impl Beep {
    pub fn new(freq: f32) -> anyhow::Result<Self> {
        let (stream, stream_handle) = OutputStream::try_default()?;
        let sink = Sink::try_new(&stream_handle)?;
        let source = SineWave::new(freq).repeat_infinite();

        sink.append(source);
        sink.pause();

        Ok(Self { sink, stream })
    }

    pub fn on(&mut self) {
        self.sink.play();
    }

    pub fn off(&mut self) {
        self.sink.pause();
    }
}

/// Maps the host keys `1234/QWER/ASDF/ZXCV` onto the hex keypad.
fn keypad_key(c: char) -> Option<Key> {
    match c.to_ascii_lowercase() {
        '1' => Some(Key::Key1),
        '2' => Some(Key::Key2),
        '3' => Some(Key::Key3),
        '4' => Some(Key::KeyC),
        'q' => Some(Key::Key4),
        'w' => Some(Key::Key5),
        'e' => Some(Key::Key6),
        'r' => Some(Key::KeyD),
        'a' => Some(Key::Key7),
        's' => Some(Key::Key8),
        'd' => Some(Key::Key9),
        'f' => Some(Key::KeyE),
        'z' => Some(Key::KeyA),
        'x' => Some(Key::Key0),
        'c' => Some(Key::KeyB),
        'v' => Some(Key::KeyF),
        _ => None,
    }
}

fn host_key_char(key: rdev::Key) -> Option<char> {
    match key {
        rdev::Key::Num1 => Some('1'),
        rdev::Key::Num2 => Some('2'),
        rdev::Key::Num3 => Some('3'),
        rdev::Key::Num4 => Some('4'),
        rdev::Key::KeyQ => Some('q'),
        rdev::Key::KeyW => Some('w'),
        rdev::Key::KeyE => Some('e'),
        rdev::Key::KeyR => Some('r'),
        rdev::Key::KeyA => Some('a'),
        rdev::Key::KeyS => Some('s'),
        rdev::Key::KeyD => Some('d'),
        rdev::Key::KeyF => Some('f'),
        rdev::Key::KeyZ => Some('z'),
        rdev::Key::KeyX => Some('x'),
        rdev::Key::KeyC => Some('c'),
        rdev::Key::KeyV => Some('v'),
        _ => None,
    }
}

/// Input shared between the UI thread and the global key listener.
struct InputState {
    keyboard: Arc<Keyboard>,
    quit: AtomicBool,
    /// Set when the listener could not start and the terminal is the only input.
    terminal_only: AtomicBool,
}

impl InputState {
    fn handle_host_event(&self, event: rdev::EventType) {
        match event {
            rdev::EventType::KeyPress(rdev::Key::Escape) => self.quit.store(true, Ordering::Release),
            rdev::EventType::KeyPress(key) => {
                if let Some(key) = host_key_char(key).and_then(keypad_key) {
                    self.keyboard.set_key_pressed(key, true);
                }
            }
            rdev::EventType::KeyRelease(key) => {
                if let Some(key) = host_key_char(key).and_then(keypad_key) {
                    self.keyboard.set_key_pressed(key, false);
                }
            }
            _ => {}
        }
    }

    fn handle_terminal_event(&self, event: Event) {
        let Event::Key(key) = event else {
            return;
        };
        if key.kind != KeyEventKind::Press {
            return;
        }
        match key.code {
            KeyCode::Esc => self.quit.store(true, Ordering::Release),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.quit.store(true, Ordering::Release)
            }
            KeyCode::Char(c) if self.terminal_only.load(Ordering::Acquire) => {
                if let Some(key) = keypad_key(c) {
                    self.keyboard.set_key_pressed(key, true);
                }
            }
            _ => {}
        }
    }

    fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }
}

/// Listens for host key presses and releases on a detached thread.
fn spawn_key_listener(input: Arc<InputState>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("key-listener".to_string())
        .spawn(move || {
            let listener_input = Arc::clone(&input);
            let result = rdev::listen(move |event| listener_input.handle_host_event(event.event_type));
            if let Err(err) = result {
                warn!(?err, "global key listener unavailable, using terminal key events");
                input.terminal_only.store(true, Ordering::Release);
            }
        })
        .context("failed to start key listener")?;
    Ok(())
}

pub struct Emulator {
    settings: Settings,
    frame: Frame,
}

impl Emulator {
    pub fn new(settings: Settings) -> Self {
        Emulator {
            settings,
            frame: BitArray::ZERO,
        }
    }

    fn draw(&self, frame: &mut ratatui::Frame, area: ratatui::layout::Rect, rom_name: &str) {
        use ratatui::layout::{Constraint, Direction, Layout};

        // Calculate the exact size needed for 64x32 display plus borders
        let game_width = (DISPLAY_WIDTH as u16) + 2;
        let game_height = (DISPLAY_HEIGHT as u16) + 2;

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(game_height),
                Constraint::Length(7),
                Constraint::Min(0),
            ])
            .split(area);

        let game_area = if chunks[0].width > game_width {
            let horizontal_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([
                    Constraint::Min(0),
                    Constraint::Length(game_width),
                    Constraint::Min(0),
                ])
                .split(chunks[0]);
            horizontal_chunks[1]
        } else {
            chunks[0]
        };

        let mut rows = String::with_capacity(DISPLAY_WIDTH * DISPLAY_HEIGHT + DISPLAY_HEIGHT);
        for row_pixels in self.frame.chunks(DISPLAY_WIDTH) {
            rows.extend(row_pixels.iter().by_vals().map(|lit| if lit { '█' } else { ' ' }));
            rows.push('\n');
        }
        let game_paragraph = Paragraph::new(rows)
            .block(Block::default().borders(Borders::ALL).title(rom_name))
            .style(Style::default().fg(Color::White));
        frame.render_widget(game_paragraph, game_area);

        let key_mapping = "Key Mapping (Esc quits):\n\
    1 2 3 4    →    1 2 3 C\n\
    Q W E R    →    4 5 6 D\n\
    A S D F    →    7 8 9 E\n\
    Z X C V    →    A 0 B F";
        let key_paragraph = Paragraph::new(key_mapping)
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL).title("Keypad"))
            .style(Style::default().fg(Color::Yellow));
        frame.render_widget(key_paragraph, chunks[1]);
    }

    /// Loads the program, starts the interpreter thread and drives the
    /// terminal until Esc is pressed or the interpreter stops.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let rom = self.settings.rom.clone();
        let rom_stem: String = rom
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Unknown ROM".to_string());

        let keyboard = Arc::new(Keyboard::new());
        let (frame_sender, frames) = crossbeam_channel::unbounded();
        let mut screen = Screen::new();
        screen.register_update_callback(Box::new(move |frame: &Frame| {
            // The UI may already be gone during shutdown.
            let _ = frame_sender.send(frame.clone());
        }));

        let mut interpreter = Interpreter::new(Arc::clone(&keyboard), screen, &self.settings.timing())?;
        interpreter.reset();
        interpreter
            .load_program_file(&rom)
            .with_context(|| format!("cannot load program {}", rom.display()))?;

        let (sound_sender, sound) = crossbeam_channel::unbounded();
        interpreter.register_sound_callback(Box::new(move |active| {
            let _ = sound_sender.send(active);
        }));
        let mut beeper = if self.settings.mute {
            None
        } else {
            Some(Beep::new(DEFAULT_FREQUENCY).context("failed to open audio output")?)
        };

        let input = Arc::new(InputState {
            keyboard,
            quit: AtomicBool::new(false),
            terminal_only: AtomicBool::new(false),
        });
        spawn_key_listener(Arc::clone(&input))?;

        let cancel = interpreter.cancel_token();
        let worker = thread::Builder::new()
            .name("interpreter".to_string())
            .spawn(move || interpreter.run())
            .context("failed to start interpreter thread")?;
        info!(rom = %rom.display(), "emulator running");

        enable_raw_mode()?;
        let ui_result = self.ui_loop(&rom_stem, &input, &frames, &sound, &mut beeper, &worker);
        disable_raw_mode()?;

        cancel.cancel();
        let run_result = worker
            .join()
            .map_err(|_| anyhow!("interpreter thread panicked"))?;
        ui_result?;
        run_result.context("interpreter halted")?;

        info!("emulator stopped");
        Ok(())
    }

    fn ui_loop<T>(
        &mut self,
        rom_name: &str,
        input: &InputState,
        frames: &Receiver<Frame>,
        sound: &Receiver<bool>,
        beeper: &mut Option<Beep>,
        worker: &thread::JoinHandle<T>,
    ) -> anyhow::Result<()> {
        let frame_duration = Duration::from_secs(1) / self.settings.frame_rate.max(1);
        let backend = CrosstermBackend::new(std::io::stdout());
        let mut terminal: Terminal<Backend> = Terminal::new(backend)?;
        terminal.clear()?;

        while !input.quit_requested() && !worker.is_finished() {
            let frame_start = Instant::now();

            // Terminal input only reports presses, so each press lasts one frame.
            if input.terminal_only.load(Ordering::Acquire) {
                input.keyboard.release_all();
            }
            while event::poll(Duration::ZERO)? {
                input.handle_terminal_event(event::read()?);
            }

            if let Some(latest) = frames.try_iter().last() {
                self.frame = latest;
            }
            for active in sound.try_iter() {
                if let Some(beeper) = beeper.as_mut() {
                    if active {
                        beeper.on();
                    } else {
                        beeper.off();
                    }
                }
            }

            terminal.draw(|frame| {
                let area = frame.area();
                self.draw(frame, area, rom_name);
            })?;

            let elapsed = frame_start.elapsed();
            if elapsed < frame_duration {
                thread::sleep(frame_duration - elapsed);
            }
        }

        if let Some(beeper) = beeper.as_mut() {
            beeper.off();
        }
        terminal.clear()?;
        Ok(())
    }
}

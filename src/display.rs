use bitvec::{BitArr, array::BitArray};

pub const DISPLAY_WIDTH: usize = 64;
pub const DISPLAY_HEIGHT: usize = 32;

/// One full 64x32 picture, row-major, `true` for a lit pixel.
pub type Frame = BitArr!(for DISPLAY_WIDTH * DISPLAY_HEIGHT);

pub type UpdateCallback = Box<dyn FnMut(&Frame) + Send>;

pub struct Screen {
    pixels: Frame,
    dirty: bool,
    update_callbacks: Vec<UpdateCallback>,
}

impl Screen {
    pub fn new() -> Self {
        Screen {
            pixels: BitArray::ZERO,
            dirty: false,
            update_callbacks: Vec::new(),
        }
    }

    /// Callbacks run synchronously on the drawing thread, after the change.
    pub fn register_update_callback(&mut self, callback: UpdateCallback) {
        self.update_callbacks.push(callback);
    }

    pub fn clear(&mut self) {
        if self.pixels.any() {
            self.pixels.fill(false);
            self.notify_update();
        }
    }

    /// XORs `sprite` (one byte per row, MSB leftmost) onto the screen.
    ///
    /// The origin wraps around the screen, but the sprite itself is clipped at
    /// the right and bottom edges. Returns true if any lit pixel was turned off.
    pub fn draw(&mut self, x: u8, y: u8, sprite: &[u8]) -> bool {
        let x_base = usize::from(x) % DISPLAY_WIDTH;
        let y_base = usize::from(y) % DISPLAY_HEIGHT;
        let mut collision = false;
        let mut changed = false;

        for (row, &byte) in sprite.iter().enumerate() {
            let pixel_y = y_base + row;
            if pixel_y >= DISPLAY_HEIGHT {
                break;
            }
            for bit in 0..8 {
                let pixel_x = x_base + bit;
                if pixel_x >= DISPLAY_WIDTH {
                    break;
                }
                if (byte >> (7 - bit)) & 1 == 0 {
                    continue;
                }

                let index = pixel_y * DISPLAY_WIDTH + pixel_x;
                let was_lit = self.pixels[index];
                self.pixels.set(index, !was_lit);
                collision |= was_lit;
                changed = true;
            }
        }

        if changed {
            self.notify_update();
        }
        collision
    }

    pub fn pixel(&self, x: usize, y: usize) -> bool {
        x < DISPLAY_WIDTH && y < DISPLAY_HEIGHT && self.pixels[y * DISPLAY_WIDTH + x]
    }

    pub fn frame(&self) -> &Frame {
        &self.pixels
    }

    pub fn is_blank(&self) -> bool {
        self.pixels.not_any()
    }

    /// Reports whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn notify_update(&mut self) {
        self.dirty = true;
        for callback in &mut self.update_callbacks {
            callback(&self.pixels);
        }
    }
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}

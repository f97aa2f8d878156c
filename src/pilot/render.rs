//! Per-frame render driver.
//!
//! One render cycle per instance: `start_frame(tick)` followed by
//! `get_color(index)` for every LED, in order, feeding the LED sink.
//! Instances execute serially; within a frame, `start_frame` is always
//! observed before any `get_color` of that frame.
//!
//! A runtime error aborts the failing instance's frame (its remaining pixels
//! keep their previous colors) and the driver moves on; one bad frame never
//! disables an instance.

use crate::machine::vm::Program;
use crate::types::words::{ProgramWord, StackWord};
use crate::utils::log::Logger;

/// Sink for rendered pixels. Implemented by the LED driver collaborator.
pub trait LedSink {
    fn set_color(&mut self, machine: ProgramWord, led: u16, color: (u8, u8, u8));
}

/// Drives all instances of a program through one frame at a time.
pub struct RenderDriver {
    led_count: u16,
    log: Logger,
}

impl RenderDriver {
    pub fn new(led_count: u16) -> Self {
        Self {
            led_count,
            log: Logger::new("render"),
        }
    }

    pub fn led_count(&self) -> u16 {
        self.led_count
    }

    /// Renders one frame for every instance into the sink.
    pub fn render_frame<S: LedSink>(
        &self,
        program: &mut Program<'_, '_>,
        tick: StackWord,
        sink: &mut S,
    ) {
        for machine in 0..program.machine_count() {
            if let Err(error) = program.start_frame(machine, tick) {
                self.log
                    .warn(&format!("machine {machine} start_frame failed: {error}"));
                continue;
            }
            for led in 0..self.led_count {
                match program.get_color(machine, led) {
                    Ok(color) => sink.set_color(machine, led, color),
                    Err(error) => {
                        self.log
                            .warn(&format!("machine {machine} get_color({led}) failed: {error}"));
                        break;
                    }
                }
            }
        }
    }
}

//! Per-frame recording context.

use crate::command::CommandList;
use crate::device::{Device, SubmitMode};
use crate::settings::MAX_FRAMES_IN_FLIGHT;
use crate::util::Result;

/// Recording state for the frame being built.
///
/// `frame_index` cycles through `0..frames_in_flight` and selects the
/// per-frame sections of staging buffers. `serial` counts frames since
/// creation and never wraps in practice.
#[derive(Debug)]
pub struct FrameContext {
    frame_index: usize,
    frames_in_flight: usize,
    serial: u64,
    pub commands: CommandList,
}

impl FrameContext {
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            frame_index: 0,
            frames_in_flight: frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT) as usize,
            serial: 0,
            commands: CommandList::new(),
        }
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Move to the next in-flight slot. Recorded commands are kept.
    pub fn advance(&mut self) {
        self.frame_index = (self.frame_index + 1) % self.frames_in_flight;
        self.serial += 1;
    }

    /// Submit recorded commands and clear the list, even on failure.
    pub fn submit(&mut self, device: &dyn Device, mode: SubmitMode) -> Result<()> {
        let result = device.submit(&self.commands, mode);
        self.commands.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_wraps() {
        let mut frame = FrameContext::new(2);
        assert_eq!(frame.frame_index(), 0);
        frame.advance();
        assert_eq!(frame.frame_index(), 1);
        frame.advance();
        assert_eq!(frame.frame_index(), 0);
        assert_eq!(frame.serial(), 2);

        assert_eq!(FrameContext::new(0).frames_in_flight(), 1);
        assert_eq!(FrameContext::new(99).frames_in_flight(), MAX_FRAMES_IN_FLIGHT as usize);
    }
}

mod frame_pointer;

pub use self::frame_pointer::{FrameContext, StackBounds, walk_frames};

use crate::config::Unwind;

/// Hard upper bound on the depth of a captured stack.
pub const MAX_FRAMES: usize = 256;

/// Return addresses of a call chain, innermost first.
///
/// Captured eagerly at allocation time. A stack that could not be fully
/// unwound is simply shorter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CallStack {
    frames: Box<[usize]>,
}

impl CallStack {
    pub fn new(frames: Vec<usize>) -> Self {
        Self {
            frames: frames.into_boxed_slice(),
        }
    }

    /// Returns the captured addresses, innermost first.
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl From<Vec<usize>> for CallStack {
    fn from(frames: Vec<usize>) -> Self {
        Self::new(frames)
    }
}

/// Captures the calling thread's stack.
pub trait StackCapture: Send + Sync {
    /// Captures at most `max_depth` return addresses, innermost first.
    fn capture(&self, max_depth: usize) -> CallStack;
}

/// Returns the capturer implementing `unwind` on this target.
pub fn capturer_for(unwind: Unwind) -> Box<dyn StackCapture> {
    match unwind {
        Unwind::Backtrace => Box::new(BacktraceCapture),
        Unwind::FramePointer => Box::new(FramePointerCapture),
    }
}

/// Unwinds with the `backtrace` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktraceCapture;

impl StackCapture for BacktraceCapture {
    #[inline(never)]
    fn capture(&self, max_depth: usize) -> CallStack {
        let max_depth = max_depth.min(MAX_FRAMES);
        let mut frames = Vec::with_capacity(max_depth);
        if max_depth == 0 {
            return CallStack::new(frames);
        }

        backtrace::trace(|frame| {
            let ip = frame.ip() as usize;
            if ip != 0 {
                frames.push(ip);
            }
            frames.len() < max_depth
        });

        CallStack::new(frames)
    }
}

/// Walks the frame-pointer chain of the calling thread.
///
/// Only meaningful when the program is built with frame pointers. Targets
/// without support fall back to [`BacktraceCapture`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FramePointerCapture;

impl StackCapture for FramePointerCapture {
    #[inline(never)]
    fn capture(&self, max_depth: usize) -> CallStack {
        match current_context_and_bounds() {
            Some((context, bounds)) => unsafe {
                walk_frames(context, bounds, max_depth.min(MAX_FRAMES))
            },
            None => BacktraceCapture.capture(max_depth),
        }
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
#[inline(always)]
fn current_context_and_bounds() -> Option<(FrameContext, StackBounds)> {
    let (low, high) = crate::os::thread_stack_bounds()?;
    let fp: usize;
    let sp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
        std::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
        std::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }

    Some((
        FrameContext {
            fp,
            return_address: 0,
        },
        StackBounds::new(sp.max(low), high),
    ))
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
fn current_context_and_bounds() -> Option<(FrameContext, StackBounds)> {
    None
}

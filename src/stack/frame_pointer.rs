use super::CallStack;

const WORD: usize = std::mem::size_of::<usize>();

/// Registers needed to start a frame-pointer walk.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Frame pointer of the innermost frame to walk.
    pub fp: usize,
    /// Return address of the innermost frame, if already known (`0` otherwise).
    pub return_address: usize,
}

/// Address range a frame record must lie in to be followed.
#[derive(Debug, Clone, Copy)]
pub struct StackBounds {
    low: usize,
    high: usize,
}

impl StackBounds {
    pub fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// Whether a whole frame record (saved fp + return address) at `fp` is plausible.
    fn holds_frame(&self, fp: usize) -> bool {
        fp % WORD == 0
            && fp >= self.low
            && fp
                .checked_add(2 * WORD)
                .is_some_and(|end| end <= self.high)
    }
}

/// Follows the frame-pointer chain starting at `context`.
///
/// Each frame record is `[saved fp, return address]`. The walk stops at
/// `max_depth`, at a null return address, or as soon as a frame pointer
/// leaves `bounds`, is misaligned or does not move towards the stack base.
///
/// # Safety
///
/// Every word inside `bounds` must be readable.
pub unsafe fn walk_frames(context: FrameContext, bounds: StackBounds, max_depth: usize) -> CallStack {
    let mut frames = Vec::with_capacity(max_depth);
    if max_depth == 0 {
        return CallStack::new(frames);
    }
    if context.return_address != 0 {
        frames.push(context.return_address);
    }

    let mut fp = context.fp;
    while frames.len() < max_depth && bounds.holds_frame(fp) {
        let (next, return_address) = unsafe {
            let record = fp as *const usize;
            (record.read(), record.add(1).read())
        };
        // process entry frame
        if return_address == 0 {
            break;
        }
        frames.push(return_address);
        if next <= fp {
            break;
        }
        fp = next;
    }

    CallStack::new(frames)
}

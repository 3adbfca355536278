//! Captures a call stack the way the detector does and prints how each
//! frame resolves.

use leakwatch::{
    BacktraceCapture, BacktraceResolver, Frame, FramePointerCapture, LeakFingerprint,
    StackCapture, SymbolResolver,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    a();

    Ok(())
}

#[inline(never)]
fn a() -> usize {
    b()
}

#[inline(never)]
fn b() -> usize {
    c()
}

#[inline(never)]
fn c() -> usize {
    let resolver = BacktraceResolver;

    for (name, capturer) in [
        ("backtrace", &BacktraceCapture as &dyn StackCapture),
        ("frame pointer", &FramePointerCapture as &dyn StackCapture),
    ] {
        let stack = capturer.capture(16);
        println!(
            "{name}: {} frame(s), fingerprint {}",
            stack.len(),
            LeakFingerprint::of(&stack)
        );
        for address in stack.frames() {
            let frame = Frame {
                address: *address,
                symbol: resolver.resolve(*address),
            };
            let marker = if frame.is_internal() { "*" } else { " " };
            println!("  {marker} {frame}");
        }
    }

    42
}

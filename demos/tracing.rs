use leakwatch::{Config, LeakwatchAllocator};
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;

#[global_allocator]
static ALLOCATOR: LeakwatchAllocator = LeakwatchAllocator::init();

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_log()?;
    let detector = leakwatch::attach(Config::default())?;

    // everything allocated so far is runtime setup, not a leak
    detector.mark_all_reported();
    tracing::info!(
        "Starting the application... Allocated {} bytes",
        ALLOCATOR.allocated()
    );

    let kept = tokio::spawn(async { leak_session(3) }).await?;
    tracing::info!("leaked {} sessions", kept);

    let freed = vec![0u8; 4096];
    drop(freed);

    let leaks = detector.report_leaks();
    tracing::info!(
        "Application finished. {} leaked block(s), allocated {} bytes",
        leaks,
        ALLOCATOR.allocated()
    );

    leakwatch::detach()?;
    Ok(())
}

#[inline(never)]
fn leak_session(count: usize) -> usize {
    for id in 0..count {
        let session = Box::new(format!("session-{id}"));
        std::mem::forget(session);
    }
    count
}

fn init_log() -> Result<(), Box<dyn std::error::Error>> {
    let stdout_logger = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_line_number(true)
        .with_writer(std::io::stdout);

    let registry = tracing_subscriber::registry()
        .with(stdout_logger.with_filter(LevelFilter::from(Level::DEBUG)));

    tracing::subscriber::set_global_default(registry)?;

    Ok(())
}

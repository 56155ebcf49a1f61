//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted for the log filter. The kernel hands
/// unrecognized `key=value` arguments to init as environment, so this
/// can be set from the kernel command line.
pub const LOG_ENV: &str = "FIRSTBOOT_LOG";

/// Initialize tracing with the default configuration.
pub fn initialize_tracing() {
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus the console/kmsg will already include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    // There is no other diagnostic surface at early boot, so default to info.
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    // Log to stderr by default, which is /dev/console for pid 1
    let r = tracing_subscriber::fmt()
        .event_format(format)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(e) = r {
        eprintln!("Failed to initialize tracing: {e}");
    }
}

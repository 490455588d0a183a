//! Logging setup for the kernrun CLI
//!
//! The runtime logs through the `log` facade:
//!
//! - `error!` - misuse of the C entry points (null handles), kernel panics
//! - `warn!` - precondition violations that were clamped or zero-filled
//! - `info!` - run progress in the CLI
//! - `debug!` - dispatch preparation, context growth, pool start/stop
//! - `trace!` - coroutine queue growth
//!
//! Set `RUST_LOG` to override the level chosen on the command line:
//!
//! ```bash
//! RUST_LOG=debug kernrun run --kernel sum
//! RUST_LOG=kernrun_runtime::queue=trace kernrun run --kernel sum
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Map `-v` occurrences to a level: none is Warn, then Info, Debug, Trace.
pub fn level_for_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialize logging at `level`, unless `RUST_LOG` is set.
///
/// This only initializes once; subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        let mut builder = Builder::new();
        builder.filter_level(level).format(|buf, record| {
            writeln!(
                buf,
                "[{:5}] {} - {}",
                record.level(),
                record.target(),
                record.args()
            )
        });
        if let Ok(filters) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filters);
        }
        builder.init();
    });
}

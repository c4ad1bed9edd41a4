//! Logging setup shared by the test suites of the workspace.
use std::path::PathBuf;

use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::{fmt, prelude::*, registry::Registry};

/// Installs colored backtraces and a global tracing subscriber.
///
/// Log lines go to the test output. When the `DEBUG` environment variable is
/// set, a chrome trace is also written to `./log/trace-<time>.json`, which can
/// be opened with `chrome://tracing` or Perfetto.
pub fn setup_test_log() {
    color_backtrace::install();
    let fmt_layer = fmt::Layer::default()
        .with_test_writer()
        .with_line_number(true)
        .with_file(true);
    if std::env::var_os("DEBUG").is_none() {
        let _ = tracing::subscriber::set_global_default(Registry::default().with(fmt_layer));
        return;
    }

    let file = trace_file();
    let (chrome_layer, guard) = ChromeLayerBuilder::new()
        .include_args(true)
        .include_locations(true)
        .file(file)
        .build();
    // Kept for the whole test run.
    Box::leak(Box::new(guard));

    let _ = tracing::subscriber::set_global_default(
        Registry::default().with(fmt_layer).with(chrome_layer),
    );
}

fn trace_file() -> PathBuf {
    let dir = PathBuf::from("./log");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("cannot create {}: {}", dir.display(), e);
    }

    let suffix = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    dir.join(format!("trace-{}.json", suffix))
}

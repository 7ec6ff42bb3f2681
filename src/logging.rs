use std::path::{Path, PathBuf};

pub const LOG_FILE_BASENAME: &str = "daily-plan";
pub const LOG_FILE_SUFFIX: &str = "log";
pub const LOG_DIR_NAME: &str = ".daily_plan_logs";
pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
pub const LOG_ROTATE_KEEP_FILES: usize = 10;
pub const LOG_ENV: &str = "DAILY_PLAN_LOG";

/// Log files live next to the task data.
pub fn log_directory(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// `DAILY_PLAN_LOG`, then `RUST_LOG`, then a default that keeps dependencies at WARN.
pub fn log_spec(env: impl Fn(&str) -> Option<String>) -> String {
    let default_spec = if cfg!(debug_assertions) {
        "warn,daily_plan_lib=debug,daily_plan=debug"
    } else {
        "warn,daily_plan_lib=info,daily_plan=info"
    };
    [LOG_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(|key| env(key).filter(|value| !value.trim().is_empty()))
        .next()
        .unwrap_or_else(|| default_spec.to_string())
}

#[cfg(all(feature = "app", not(test)))]
pub fn init_logging(data_dir: &Path) -> Result<(), flexi_logger::FlexiLoggerError> {
    use flexi_logger::{
        detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, Naming, WriteMode,
    };

    let directory = log_directory(data_dir);
    std::fs::create_dir_all(&directory)?;

    let spec = log_spec(|key| std::env::var(key).ok());
    Logger::try_with_str(spec)?
        .log_to_file(
            FileSpec::default()
                .directory(&directory)
                .basename(LOG_FILE_BASENAME)
                .suffix(LOG_FILE_SUFFIX),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .format_for_files(detailed_format)
        .rotate(
            Criterion::Size(LOG_ROTATE_SIZE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(LOG_ROTATE_KEEP_FILES),
        )
        // Stdout belongs to the prompt; only problems reach the terminal.
        .duplicate_to_stderr(Duplicate::Warn)
        .start()?;

    install_panic_hook();

    log::info!(
        "logger initialized dir={} rotate_size_bytes={} keep_files={}",
        directory.display(),
        LOG_ROTATE_SIZE_BYTES,
        LOG_ROTATE_KEEP_FILES
    );
    Ok(())
}

#[cfg(all(feature = "app", not(test)))]
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info: &std::panic::PanicHookInfo<'_>| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("<non-string panic payload>");
        let location = info
            .location()
            .map(|loc| format!("{loc}"))
            .unwrap_or_else(|| "<unknown>".to_string());
        let backtrace = std::backtrace::Backtrace::force_capture();

        log::error!("panic: payload={payload} location={location}\nbacktrace:\n{backtrace}");
        default_hook(info);
    }));
}

use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

// Keeps the non-blocking console worker alive for the whole process.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// "off"/"none" disable a sink; unknown values fall back to INFO.
fn parse_level(s: &str) -> LevelFilter {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" | "" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" | "none" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// True if `target` is `prefix` itself or lives under `prefix::`.
fn target_matches(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ================= rotating file sinks =================

type SharedRotate = Arc<Mutex<FileRotate<AppendTimestamp>>>;

/// Write handle that drops output when no file is routed to it.
struct FileHandle(Option<SharedRotate>);

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(file) => file.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(file) => file.lock().flush(),
            None => Ok(()),
        }
    }
}

/// Routes records to per-target files, falling back to the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<SharedRotate>,
    by_target: Vec<(String, SharedRotate)>,
}

impl FileRouter {
    fn resolve(&self, target: &str) -> Option<SharedRotate> {
        self.by_target
            .iter()
            .find(|(prefix, _)| target_matches(target, prefix))
            .map(|(_, file)| file.clone())
            .or_else(|| self.default.clone())
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_target.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = FileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        FileHandle(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        FileHandle(self.resolve(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn open_rotating(section: &Section, base_dir: &Path) -> std::io::Result<SharedRotate> {
    let path = resolve_log_path(&section.file, base_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Prefer a file count when given, else an age limit.
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(
            i64::from(section.max_age_days.unwrap_or(1)),
        )),
    };
    let max_bytes = section.max_size_mb.unwrap_or(100) as usize * 1024 * 1024;

    let rotate = FileRotate::new(
        path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );
    Ok(Arc::new(Mutex::new(rotate)))
}

// ================= per-sink level rules =================

/// Console and file level rules from the logging map.
///
/// The "default" section sets the catch-all level; every other key is a
/// target prefix (usually a crate name).
struct SinkRules {
    console: Targets,
    file: Targets,
    router: FileRouter,
}

impl SinkRules {
    fn from_config(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let default = cfg.get("default");
        let mut router = FileRouter::default();

        if let Some(section) = default.filter(|s| !s.file.trim().is_empty()) {
            router.default = open_or_report("default", section, base_dir);
        }

        let console_default = default.map_or(LevelFilter::INFO, |s| parse_level(&s.console_level));
        let file_default = match default {
            Some(s) if router.default.is_some() => parse_level(&s.file_level),
            _ => LevelFilter::OFF,
        };
        let mut console = Targets::new().with_default(console_default);
        let mut file = Targets::new().with_default(file_default);

        let mut targets: Vec<(&String, &Section)> =
            cfg.iter().filter(|(k, _)| k.as_str() != "default").collect();
        // longest prefix first so nested targets win
        targets.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        for (target, section) in targets {
            console = console.with_target(target.clone(), parse_level(&section.console_level));
            if section.file.trim().is_empty() {
                continue;
            }
            if let Some(rotate) = open_or_report(target, section, base_dir) {
                router.by_target.push((target.clone(), rotate));
                file = file.with_target(target.clone(), parse_level(&section.file_level));
            }
        }

        Self {
            console,
            file,
            router,
        }
    }
}

fn open_or_report(name: &str, section: &Section, base_dir: &Path) -> Option<SharedRotate> {
    match open_rotating(section, base_dir) {
        Ok(rotate) => Some(rotate),
        Err(e) => {
            // the subscriber is not installed yet
            eprintln!("Failed to open log file '{}' for '{name}': {e}", section.file);
            None
        }
    }
}

// ================= public init =================

/// Install the global subscriber.
///
/// Console output is human-readable on stderr (non-blocking); sections with a
/// `file` also get JSON lines in a size-rotated file. `RUST_LOG`, when set,
/// caps both sinks. Calling this twice is harmless: the second subscriber is
/// not installed.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` before installing the subscriber.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    if cfg.is_empty() {
        init_minimal();
        return;
    }

    let rules = SinkRules::from_config(cfg, base_dir);
    let env = EnvFilter::try_from_default_env().ok();

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(nb_stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(rules.console);

    let file_layer = (!rules.router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(rules.router)
            .with_filter(rules.file)
    });

    let _ = Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// INFO to the console; honors `RUST_LOG`.
fn init_minimal() {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = Registry::default().with(env).with(fmt_layer).try_init();
}

use std::io::Write;

use anstyle::{AnsiColor, Color, RgbColor, Style};

const LOCATION_COLOR: Color = Color::Rgb(RgbColor(110, 110, 110));
const MESSAGE_COLOR: Color = Color::Rgb(RgbColor(75, 75, 75));

/// 彩色日志：`[时间] LEVEL [file:line] message`
///
/// 默认等级为 Info，可以通过 `RUST_LOG` 覆盖（例如 `RUST_LOG=strata_render_interface=debug`）
#[inline]
pub fn init_log() {
    init_log_with(log::LevelFilter::Info);
}

/// 重复初始化时保留第一次的 logger
pub fn init_log_with(default_level: log::LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            let level = record.level();
            let level_style = level_style(level);
            let location_style = Style::new().fg_color(Some(LOCATION_COLOR));
            let message_style = Style::new().fg_color(Some(MESSAGE_COLOR));

            let file = short_file_name(record.file().unwrap_or(""));
            let line = record.line().unwrap_or(0);
            let time = chrono::Local::now().format("%H:%M:%S%.3f");

            writeln!(
                buf,
                "{level_style}[{time}] {level:<5}{level_style:#} {location_style}[{file}:{line}]{location_style:#} \
                 {message_style}{}{message_style:#}",
                record.args()
            )
        })
        .filter(None, default_level);

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    if builder.try_init().is_err() {
        log::debug!("logger has already been initialized");
    }
}

fn level_style(level: log::Level) -> Style {
    let color = match level {
        log::Level::Error => AnsiColor::Red,
        log::Level::Warn => AnsiColor::Yellow,
        log::Level::Info => AnsiColor::Green,
        log::Level::Debug => AnsiColor::Blue,
        log::Level::Trace => AnsiColor::BrightBlack,
    };
    let style = Style::new().fg_color(Some(Color::Ansi(color)));
    if level == log::Level::Error { style.bold() } else { style }
}

/// 只保留文件名，同时兼容 `/` 和 `\`
fn short_file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

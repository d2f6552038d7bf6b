//! Status colors, icons, and formatting helpers

use ratatui::style::{Color, Style};
use std::time::Duration;

use crate::process::Status;

pub const ACCENT: Color = Color::Rgb(0x10, 0xB9, 0x81);
pub const SUBTLE: Color = Color::Rgb(0x66, 0x66, 0x66);
pub const DIM: Color = Color::Rgb(0x55, 0x55, 0x55);

const RUNNING: Color = Color::Rgb(0x2E, 0xCC, 0x71);
const FAILED: Color = Color::Rgb(0xE7, 0x4C, 0x3C);
const RETRYING: Color = Color::Rgb(0xF3, 0x9C, 0x12);
const STOPPED: Color = Color::Rgb(0x7F, 0x8C, 0x8D);
const STARTING: Color = Color::Rgb(0x34, 0x98, 0xDB);

pub fn status_style(status: Status) -> Style {
    let color = match status {
        Status::Running => RUNNING,
        Status::Failed => FAILED,
        Status::Retrying => RETRYING,
        Status::Starting => STARTING,
        Status::Stopped | Status::Stopping => STOPPED,
    };
    Style::default().fg(color)
}

pub fn status_icon(status: Status) -> &'static str {
    match status {
        Status::Running => "●",
        Status::Stopped => "○",
        Status::Failed => "✗",
        Status::Retrying => "↻",
        Status::Starting => "◐",
        Status::Stopping => "◑",
    }
}

pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats() {
        assert_eq!(format_uptime(Duration::from_secs(12)), "12s");
        assert_eq!(format_uptime(Duration::from_secs(185)), "3m05s");
        assert_eq!(format_uptime(Duration::from_secs(3720)), "1h02m");
    }
}

//! Rendering with ratatui: process list, log panel, status bar, overlays

use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Clear, Paragraph},
    Frame,
};

use crate::app::{App, Confirm, Panel};
use crate::process::Status;

use super::theme;

/// Main draw function
pub fn draw(f: &mut Frame, app: &App) {
    if app.show_help {
        draw_help(f, f.area());
        return;
    }

    if app.fullscreen_logs {
        draw_fullscreen_logs(f, app, f.area());
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(1)])
        .split(f.area());

    let panels = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(chunks[0]);

    draw_process_list(f, app, panels[0]);
    draw_log_panel(f, app, panels[1]);
    draw_status_bar(f, app, chunks[1]);
}

fn panel_block(title: &str, focused: bool) -> Block<'_> {
    let border = if focused {
        Style::default().fg(theme::ACCENT)
    } else {
        Style::default().fg(theme::SUBTLE)
    };
    Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(border)
}

fn draw_process_list(f: &mut Frame, app: &App, area: Rect) {
    let focused = app.focused == Panel::ProcessList;
    let inner_width = area.width.saturating_sub(2) as usize;

    let mut lines: Vec<Line> = Vec::with_capacity(app.entries.len());
    for (idx, entry) in app.entries.iter().enumerate() {
        let line = if entry.is_group {
            render_group_row(app, entry.group_idx)
        } else {
            render_process_row(app, &entry.name, inner_width)
        };

        let line = if idx == app.selected && focused {
            line.style(
                Style::default()
                    .bg(theme::ACCENT)
                    .fg(Color::White)
                    .add_modifier(Modifier::BOLD),
            )
        } else {
            line
        };
        lines.push(line);
    }

    let list = Paragraph::new(lines).block(panel_block("Processes", focused));
    f.render_widget(list, area);
}

fn render_group_row(app: &App, group_idx: usize) -> Line<'static> {
    let group = &app.groups[group_idx];
    let arrow = if group.expanded { "▼" } else { "▶" };

    let running = group
        .processes
        .iter()
        .filter(|p| {
            app.states
                .get(*p)
                .map(|s| s.status == Status::Running)
                .unwrap_or(false)
        })
        .count();

    Line::from(format!(
        " {} {} ({}/{})",
        arrow,
        group.name,
        running,
        group.processes.len()
    ))
}

fn render_process_row(app: &App, name: &str, width: usize) -> Line<'static> {
    let Some(state) = app.states.get(name) else {
        return Line::from(format!("   ○ {}", name));
    };

    let info = match state.status {
        Status::Running => theme::format_uptime(state.uptime()),
        Status::Retrying => format!("retry #{}", state.retry_count),
        status => status.to_string(),
    };

    let mut display_name = name.to_string();
    let max_name = width.saturating_sub(8 + info.len()).max(5);
    if display_name.len() > max_name {
        display_name.truncate(max_name.saturating_sub(1));
        display_name.push('…');
    }

    let padding = width
        .saturating_sub(6 + display_name.len() + info.len())
        .max(1);

    Line::from(vec![
        Span::raw("   "),
        Span::styled(
            theme::status_icon(state.status).to_string(),
            theme::status_style(state.status),
        ),
        Span::raw(format!(" {}{}", display_name, " ".repeat(padding))),
        Span::styled(info, theme::status_style(state.status)),
    ])
}

fn draw_log_panel(f: &mut Frame, app: &App, area: Rect) {
    let focused = app.focused == Panel::Logs;

    let title = match &app.selected_proc {
        Some(name) => {
            let status = app
                .states
                .get(name)
                .map(|s| s.status.as_str())
                .unwrap_or("unknown");
            format!("Logs: {} [{}]", name, status)
        }
        None => "Logs".to_string(),
    };

    let block = panel_block(&title, focused);
    let inner = block.inner(area);
    f.render_widget(block, area);

    if app.selected_proc.is_none() {
        let hint = Paragraph::new("Select a process to view logs")
            .style(Style::default().fg(theme::DIM));
        f.render_widget(hint, inner);
        return;
    }

    draw_log_lines(f, app, inner);
}

/// Render the window of log lines ending `log_offset` lines above the newest.
fn draw_log_lines(f: &mut Frame, app: &App, area: Rect) {
    let lines = app.selected_log_lines();
    if lines.is_empty() {
        let hint = Paragraph::new("No output yet").style(Style::default().fg(theme::DIM));
        f.render_widget(hint, area);
        return;
    }

    let height = area.height as usize;
    // The offset is stored unclamped; cap it so a full window stays visible
    // even after Home or a shrinking buffer.
    let offset = app.log_offset.min(lines.len().saturating_sub(height));
    let end = lines.len() - offset;
    let start = end.saturating_sub(height);

    let mut visible: Vec<Line> = lines[start..end]
        .iter()
        .map(|l| Line::from(l.clone()))
        .collect();

    if offset > 0 {
        if let Some(last) = visible.last_mut() {
            *last = Line::from(Span::styled(
                "  ↓ new output below",
                Style::default().fg(theme::ACCENT),
            ));
        }
    }

    f.render_widget(Paragraph::new(visible), area);
}

fn draw_fullscreen_logs(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(1),
            Constraint::Length(1),
        ])
        .split(area);

    let header = match &app.selected_proc {
        Some(name) => {
            let status = app
                .states
                .get(name)
                .map(|s| s.status.as_str())
                .unwrap_or("unknown");
            format!("Logs: {} [{}]", name, status)
        }
        None => "Logs".to_string(),
    };
    f.render_widget(
        Paragraph::new(header).style(
            Style::default()
                .fg(theme::ACCENT)
                .add_modifier(Modifier::BOLD),
        ),
        chunks[0],
    );

    draw_log_lines(f, app, chunks[1]);

    f.render_widget(
        Paragraph::new("f close  ↑/↓ scroll  q quit").style(Style::default().fg(theme::DIM)),
        chunks[2],
    );
}

fn draw_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let base = Style::default().bg(Color::Rgb(0x33, 0x33, 0x33)).fg(Color::White);

    let (text, style) = if let Some(confirm) = app.confirm {
        let running = app.count_by_status(Status::Running);
        let text = match confirm {
            Confirm::Quit => format!(" {} process(es) running. Quit? (y/n)", running),
            Confirm::StopAll => format!(" Stop all {} process(es)? (y/n)", running),
        };
        (text, base)
    } else if let Some(error) = &app.error {
        (
            format!(" Error: {}", error),
            Style::default().bg(Color::Rgb(0xE7, 0x4C, 0x3C)).fg(Color::White),
        )
    } else if let Some(notification) = &app.notification {
        (
            format!(" {}", notification),
            Style::default().bg(Color::Rgb(0x2E, 0xCC, 0x71)).fg(Color::Black),
        )
    } else {
        let running = app.count_by_status(Status::Running);
        let total = app.states.len();
        let left = format!(" {}/{} running", running, total);

        let hints = match app.focused {
            Panel::ProcessList => "↑/↓ navigate  s start  x stop  r restart  ? help ",
            Panel::Logs => "↑/↓ scroll  tab back  ? help ",
        };

        let padding = (area.width as usize)
            .saturating_sub(left.len() + hints.len())
            .max(1);
        (format!("{}{}{}", left, " ".repeat(padding), hints), base)
    };

    f.render_widget(Paragraph::new(text).style(style), area);
}

fn draw_help(f: &mut Frame, area: Rect) {
    let sections: &[(&str, &[&str])] = &[
        (
            "Navigation",
            &[
                "↑/k     Move up",
                "↓/j     Move down",
                "Enter   Expand/collapse group",
                "Tab     Switch panel focus",
                "l       Focus log panel",
                "f       Fullscreen logs",
            ],
        ),
        (
            "Process Control",
            &[
                "s       Start selected process",
                "x       Stop selected process",
                "r       Restart selected process",
            ],
        ),
        (
            "Group/All Control",
            &[
                "g       Start all in group",
                "G       Stop all in group",
                "a       Start all processes",
                "X       Stop all processes",
            ],
        ),
        ("Other", &["?       Toggle this help", "q       Quit"]),
    ];

    let mut lines = vec![
        Line::from(Span::styled(
            "Shepherd - Keybindings",
            Style::default()
                .fg(theme::ACCENT)
                .add_modifier(Modifier::BOLD),
        )),
        Line::default(),
    ];
    for (header, bindings) in sections {
        lines.push(Line::from(Span::styled(
            *header,
            Style::default().add_modifier(Modifier::BOLD),
        )));
        for binding in *bindings {
            lines.push(Line::from(format!("  {}", binding)));
        }
        lines.push(Line::default());
    }
    lines.push(Line::from(Span::styled(
        "Press ? or Esc to close",
        Style::default().fg(theme::DIM),
    )));

    let height = (lines.len() + 2) as u16;
    let width = 44u16;
    let popup = centered_rect(width, height, area);

    f.render_widget(Clear, popup);
    f.render_widget(
        Paragraph::new(lines)
            .alignment(Alignment::Left)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded)
                    .border_style(Style::default().fg(theme::ACCENT)),
            ),
        popup,
    );
}

fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let x = area.x + area.width.saturating_sub(width) / 2;
    let y = area.y + area.height.saturating_sub(height) / 2;
    Rect {
        x,
        y,
        width: width.min(area.width),
        height: height.min(area.height),
    }
}

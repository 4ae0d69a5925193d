//! Terminal dashboard for the room server
//!
//! Runs the server on a background task and renders counters, the live
//! room table and the activity log until the operator quits.

use crate::config::ServerConfig;
use crate::metrics::{LogLevel, Metrics, ServerStatus};
use crate::network;
use crate::BoxError;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Margin, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Scrollbar, ScrollbarOrientation, ScrollbarState, Table},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use surround_core::sync::RoomSummary;
use tokio::sync::oneshot;

const FRAME_INTERVAL: Duration = Duration::from_millis(100);
const PAGE: usize = 10;

/// Log view position. `offset` counts entries hidden below the view, so 0
/// means the newest entry is on screen.
#[derive(Debug, Clone, PartialEq)]
struct LogView {
    offset: usize,
    follow: bool,
    seen: usize,
}

impl LogView {
    fn new() -> Self {
        Self {
            offset: 0,
            follow: true,
            seen: 0,
        }
    }

    /// Snap back to the newest entry when following and something new arrived
    fn observe(&mut self, total: usize) {
        if total != self.seen {
            self.seen = total;
            if self.follow {
                self.offset = 0;
            }
        }
    }

    fn older(&mut self, by: usize, total: usize) {
        if total == 0 {
            return;
        }
        self.offset = (self.offset + by).min(total - 1);
        self.follow = false;
    }

    fn newer(&mut self, by: usize) {
        self.offset = self.offset.saturating_sub(by);
        if self.offset == 0 {
            self.follow = true;
        }
    }

    fn oldest(&mut self, total: usize) {
        self.older(total, total);
    }

    fn newest(&mut self) {
        self.offset = 0;
        self.follow = true;
    }

    fn toggle_follow(&mut self) {
        self.follow = !self.follow;
        if self.follow {
            self.offset = 0;
        }
    }

    /// Apply a key press. Returns false when the dashboard should close.
    fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers, total: usize) -> bool {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return false,
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => return false,
            KeyCode::Up | KeyCode::Char('k') => self.older(1, total),
            KeyCode::Down | KeyCode::Char('j') => self.newer(1),
            KeyCode::PageUp => self.older(PAGE, total),
            KeyCode::PageDown => self.newer(PAGE),
            KeyCode::Home => self.oldest(total),
            KeyCode::End => self.newest(),
            KeyCode::Char('a') => self.toggle_follow(),
            _ => {}
        }
        true
    }
}

/// Run the dashboard
pub async fn run(config: ServerConfig, metrics: Arc<RwLock<Metrics>>) -> Result<(), BoxError> {
    enable_raw_mode()?;
    let mut out = stdout();
    execute!(out, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(ratatui::backend::CrosstermBackend::new(out))?;

    // The server lives until the dashboard quits
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let stopped = async move {
                let _ = stop_rx.await;
            };
            if let Err(e) = network::run(config, Arc::clone(&metrics), stopped).await {
                metrics.write().log(LogLevel::Error, format!("Server error: {}", e));
            }
        })
    };

    let mut view = LogView::new();
    loop {
        view.observe(metrics.read().logs.len());
        terminal.draw(|f| draw(f, &metrics.read(), &view))?;

        if !event::poll(FRAME_INTERVAL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let total = metrics.read().logs.len();
        if !view.handle_key(key.code, key.modifiers, total) {
            break;
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    let _ = stop_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;

    Ok(())
}

fn draw(f: &mut Frame, m: &Metrics, view: &LogView) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(5),
            Constraint::Min(8),
            Constraint::Length(1),
        ])
        .split(f.area());

    draw_header(f, rows[0], m);
    draw_counters(f, rows[1], m);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(rows[2]);
    draw_rooms(f, body[0], &m.rooms);
    draw_log(f, body[1], m, view);

    draw_keys(f, rows[3], view);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status, color) = match m.status {
        ServerStatus::Starting => ("STARTING", Color::Yellow),
        ServerStatus::Running => ("RUNNING", Color::Green),
        ServerStatus::Error => ("ERROR", Color::Red),
    };

    let line = Line::from(vec![
        Span::styled("Surround Room Server", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(format!("  │  :{}  │  ", m.port)),
        Span::styled(status, Style::default().fg(color)),
        Span::raw("  │  up "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ]);

    f.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::ALL).title(" Dashboard ")),
        area,
    );
}

/// `label value` with the value highlighted
fn stat(label: &str, value: String, color: Color) -> Line<'static> {
    Line::from(vec![
        Span::raw(format!("{}: ", label)),
        Span::styled(value, Style::default().fg(color)),
    ])
}

fn draw_counters(f: &mut Frame, area: Rect, m: &Metrics) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Ratio(1, 3); 3])
        .split(area);

    let panels = [
        (
            " Members ",
            vec![
                stat("Online", m.connected_clients.to_string(), Color::Green),
                stat(
                    "Total / peak",
                    format!("{} / {}", m.total_connections, m.peak_connections),
                    Color::White,
                ),
                stat("Clock probes", m.ntp_requests.to_string(), Color::Cyan),
            ],
        ),
        (
            " Rooms ",
            vec![
                stat("Open", m.active_rooms.to_string(), Color::Yellow),
                stat("Closed", m.rooms_closed.to_string(), Color::DarkGray),
                stat(
                    "Uploads",
                    format!("{} ({})", m.uploads, format_bytes(m.bytes_uploaded)),
                    Color::Green,
                ),
            ],
        ),
        (
            " Scheduling ",
            vec![
                stat("Lead", format!("{} ms", m.schedule_lead_ms), Color::Yellow),
                stat("Actions", m.scheduled_actions.to_string(), Color::Cyan),
            ],
        ),
    ];

    for ((title, lines), column) in panels.into_iter().zip(columns.iter()) {
        f.render_widget(
            Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)),
            *column,
        );
    }
}

fn room_row(room: &RoomSummary) -> Row<'static> {
    let (state, color) = if room.is_playing {
        ("playing", Color::Green)
    } else {
        ("paused", Color::DarkGray)
    };
    Row::new(vec![
        Cell::from(room.room_id.clone()).style(Style::default().fg(Color::Cyan)),
        Cell::from(room.client_count.to_string()),
        Cell::from(state).style(Style::default().fg(color)),
        Cell::from(room.current_track.clone().unwrap_or_else(|| "-".into())),
    ])
}

fn draw_rooms(f: &mut Frame, area: Rect, rooms: &[RoomSummary]) {
    let table = Table::new(
        rooms.iter().map(room_row),
        [
            Constraint::Length(8),
            Constraint::Length(4),
            Constraint::Length(8),
            Constraint::Min(6),
        ],
    )
    .header(Row::new(vec!["Room", "#", "State", "Track"]).style(Style::default().add_modifier(Modifier::BOLD)))
    .block(Block::default().borders(Borders::ALL).title(format!(" Live rooms ({}) ", rooms.len())));

    f.render_widget(table, area);
}

fn level_color(level: LogLevel) -> Color {
    match level {
        LogLevel::Info => Color::Blue,
        LogLevel::Warning => Color::Yellow,
        LogLevel::Error => Color::Red,
        LogLevel::Connection => Color::Green,
        LogLevel::Room => Color::Magenta,
        LogLevel::Schedule => Color::Cyan,
    }
}

fn draw_log(f: &mut Frame, area: Rect, m: &Metrics, view: &LogView) {
    let height = area.height.saturating_sub(2) as usize;
    let total = m.logs.len();

    // Newest at the bottom, so pick the window from the back and flip it
    let mut items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(view.offset)
        .take(height)
        .map(|entry| {
            ListItem::new(Line::from(vec![
                Span::styled(
                    entry.timestamp.format("%H:%M:%S ").to_string(),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(
                    format!("{:<5} ", entry.level.as_str()),
                    Style::default().fg(level_color(entry.level)),
                ),
                Span::raw(entry.message.clone()),
            ]))
        })
        .collect();
    items.reverse();

    let title = if view.follow {
        " Activity (live) ".to_string()
    } else {
        format!(" Activity ({}/{}) ", total - view.offset, total)
    };
    f.render_widget(
        List::new(items).block(Block::default().borders(Borders::ALL).title(title)),
        area,
    );

    if total > height {
        let mut position = ScrollbarState::new(total).position(total.saturating_sub(view.offset + height));
        f.render_stateful_widget(
            Scrollbar::new(ScrollbarOrientation::VerticalRight),
            area.inner(Margin { vertical: 1, horizontal: 0 }),
            &mut position,
        );
    }
}

fn draw_keys(f: &mut Frame, area: Rect, view: &LogView) {
    let key = Style::default().fg(Color::Black).bg(Color::White);
    let mut spans = Vec::new();
    for (k, what) in [("q", "quit"), ("↑↓ jk", "scroll"), ("PgUp/PgDn", "page"), ("Home/End", "ends")] {
        spans.push(Span::styled(format!(" {} ", k), key));
        spans.push(Span::raw(format!(" {}  ", what)));
    }
    spans.push(Span::styled(" a ", key));
    spans.push(Span::raw(" follow "));
    spans.push(if view.follow {
        Span::styled("on", Style::default().fg(Color::Green))
    } else {
        Span::styled("off", Style::default().fg(Color::Yellow))
    });

    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

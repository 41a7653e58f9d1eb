//! Terminal dashboard fed by 500 ms ledger snapshots.

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Cell, Paragraph, Row, Table, TableState};
use ratatui::{Frame, Terminal};

use crate::ledger::{Ledger, ModelStats, RequestRecord};
use crate::util::{fmt_cost, fmt_duration, fmt_latency, fmt_tokens};

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_LINGER: Duration = Duration::from_secs(3);
const REQUEST_LOG_DEPTH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Models,
    Requests,
}

pub struct App {
    ledger: Arc<Ledger>,
    proxy_addr: String,
    target: String,
    started: Instant,
    focus: Focus,
    model_state: TableState,
    request_state: TableState,
    status: Option<(String, Instant)>,
    should_quit: bool,
}

/// Run the dashboard on the current terminal until the user quits.
pub fn run(ledger: Arc<Ledger>, proxy_addr: String, target: String) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut app = App::new(ledger, proxy_addr, target);
    let result = app.event_loop(&mut terminal);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

impl App {
    fn new(ledger: Arc<Ledger>, proxy_addr: String, target: String) -> Self {
        Self {
            ledger,
            proxy_addr,
            target,
            started: Instant::now(),
            focus: Focus::Requests,
            model_state: TableState::default(),
            request_state: TableState::default(),
            status: None,
            should_quit: false,
        }
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            terminal.draw(|frame| self.draw(frame))?;

            let timeout = REFRESH_INTERVAL.saturating_sub(last_tick.elapsed());
            if event::poll(timeout)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.on_key(key);
                    }
                }
            }
            if last_tick.elapsed() >= REFRESH_INTERVAL {
                last_tick = Instant::now();
            }
            if self.should_quit {
                return Ok(());
            }
        }
    }

    fn on_key(&mut self, key: KeyEvent) {
        // Raw mode swallows the signal, so ctrl-c arrives as a key event.
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            self.should_quit = true;
            return;
        }
        match key.code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Char('c') => {
                self.ledger.clear();
                self.set_status("Session cleared");
            }
            KeyCode::Char('e') => self.export(),
            KeyCode::Tab => {
                self.focus = match self.focus {
                    Focus::Models => Focus::Requests,
                    Focus::Requests => Focus::Models,
                };
            }
            KeyCode::Up => self.scroll(-1),
            KeyCode::Down => self.scroll(1),
            _ => {}
        }
    }

    fn scroll(&mut self, delta: i64) {
        let state = match self.focus {
            Focus::Models => &mut self.model_state,
            Focus::Requests => &mut self.request_state,
        };
        let current = state.selected().unwrap_or(0) as i64;
        state.select(Some(current.saturating_add(delta).max(0) as usize));
    }

    fn set_status(&mut self, msg: &str) {
        self.status = Some((msg.to_string(), Instant::now()));
    }

    fn draw(&mut self, frame: &mut Frame) {
        let [header, stats, models, requests, footer] = Layout::vertical([
            Constraint::Length(4),
            Constraint::Length(1),
            Constraint::Fill(1),
            Constraint::Fill(3),
            Constraint::Length(1),
        ])
        .areas(frame.area());

        self.draw_header(frame, header);
        self.draw_stats(frame, stats);
        self.draw_models(frame, models);
        self.draw_requests(frame, requests);
        self.draw_footer(frame, footer);
    }

    fn draw_header(&self, frame: &mut Frame, area: Rect) {
        let line = Line::from(vec![
            Span::styled(" ● ", Style::default().fg(Color::Green)),
            Span::raw("Proxy: "),
            Span::styled(&self.proxy_addr, Style::default().add_modifier(Modifier::BOLD)),
            Span::raw("    ↗ Target: "),
            Span::styled(&self.target, Style::default().add_modifier(Modifier::BOLD)),
            Span::raw("    ⏱ Uptime: "),
            Span::styled(
                fmt_duration(self.started.elapsed()),
                Style::default().add_modifier(Modifier::BOLD),
            ),
        ]);
        let block = Block::bordered()
            .title(" TOLLGATE ")
            .border_style(Style::default().fg(Color::Cyan))
            .title_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD));
        frame.render_widget(Paragraph::new(line).block(block), area);
    }

    fn draw_stats(&self, frame: &mut Frame, area: Rect) {
        let s = self.ledger.summary();
        let line = Line::from(vec![
            Span::styled(
                format!(" {} cost", fmt_cost(s.total_cost)),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
            Span::raw(format!("    {} requests", s.total_requests)),
            Span::styled(
                format!("    {} input", fmt_tokens(s.total_input)),
                Style::default().fg(Color::Cyan),
            ),
            Span::styled(
                format!("    {} output", fmt_tokens(s.total_output)),
                Style::default().fg(Color::Cyan),
            ),
            Span::styled(
                format!("    {} cache read", fmt_tokens(s.total_cache_read)),
                Style::default().fg(Color::Blue),
            ),
            Span::styled(
                format!("    {} cache write", fmt_tokens(s.total_cache_write)),
                Style::default().fg(Color::Blue),
            ),
        ]);
        let bar = Paragraph::new(line)
            .alignment(Alignment::Center)
            .style(Style::default().bg(Color::DarkGray));
        frame.render_widget(bar, area);
    }

    fn draw_models(&mut self, frame: &mut Frame, area: Rect) {
        let stats = self.ledger.per_model();
        let total_cost = self.ledger.summary().total_cost;

        let header = Row::new(
            ["MODEL", "REQS", "INPUT", "OUTPUT", "CACHE R", "CACHE W", "COST", "%"]
                .into_iter()
                .map(Cell::from),
        )
        .style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD));

        let rows = stats.iter().map(|ms| model_row(ms, total_cost));

        let table = Table::new(
            rows,
            [
                Constraint::Min(26),
                Constraint::Length(6),
                Constraint::Length(8),
                Constraint::Length(8),
                Constraint::Length(8),
                Constraint::Length(8),
                Constraint::Length(10),
                Constraint::Length(7),
            ],
        )
        .header(header)
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .block(titled_block(" Models ", self.focus == Focus::Models));

        frame.render_stateful_widget(table, area, &mut self.model_state);
    }

    fn draw_requests(&mut self, frame: &mut Frame, area: Rect) {
        let recent = self.ledger.recent(REQUEST_LOG_DEPTH);

        let header = Row::new(
            ["TIME", "MODEL", "INPUT", "OUTPUT", "COST", "LATENCY", "STATUS"]
                .into_iter()
                .map(Cell::from),
        )
        .style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD));

        let rows = recent.iter().map(request_row);

        let table = Table::new(
            rows,
            [
                Constraint::Length(9),
                Constraint::Min(26),
                Constraint::Length(8),
                Constraint::Length(8),
                Constraint::Length(10),
                Constraint::Length(8),
                Constraint::Length(7),
            ],
        )
        .header(header)
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .block(titled_block(" Request Log ", self.focus == Focus::Requests));

        frame.render_stateful_widget(table, area, &mut self.request_state);
    }

    fn draw_footer(&mut self, frame: &mut Frame, area: Rect) {
        let mut spans = vec![
            Span::styled(" <q>", Style::default().fg(Color::Yellow)),
            Span::raw(" Quit  "),
            Span::styled("<c>", Style::default().fg(Color::Yellow)),
            Span::raw(" Clear  "),
            Span::styled("<e>", Style::default().fg(Color::Yellow)),
            Span::raw(" Export  "),
            Span::styled("<Tab>", Style::default().fg(Color::Yellow)),
            Span::raw(" Switch Focus"),
        ];
        match &self.status {
            Some((msg, at)) if at.elapsed() < STATUS_LINGER => {
                spans.push(Span::styled(
                    format!("  │ {msg}"),
                    Style::default().fg(Color::Green),
                ));
            }
            Some(_) => self.status = None,
            None => {}
        }
        let footer = Paragraph::new(Line::from(spans))
            .alignment(Alignment::Center)
            .style(Style::default().bg(Color::DarkGray));
        frame.render_widget(footer, area);
    }

    fn export(&mut self) {
        let records = self.ledger.all();
        if records.is_empty() {
            self.set_status("Nothing to export");
            return;
        }

        let filename = format!(
            "tollgate-export-{}.csv",
            Local::now().format("%Y-%m-%d-%H%M%S")
        );
        match fs::write(&filename, export_csv(&records)) {
            Ok(()) => self.set_status(&format!("Exported {} rows → {}", records.len(), filename)),
            Err(err) => self.set_status(&format!("Export failed: {err}")),
        }
    }
}

fn titled_block(title: &str, focused: bool) -> Block<'_> {
    let border = if focused { Color::Cyan } else { Color::DarkGray };
    Block::bordered()
        .title(title)
        .border_style(Style::default().fg(border))
        .title_style(Style::default().fg(Color::Yellow))
}

fn model_row(ms: &ModelStats, total_cost: f64) -> Row<'static> {
    let pct = if total_cost > 0.0 {
        ms.total_cost / total_cost * 100.0
    } else {
        0.0
    };
    Row::new(vec![
        Cell::from(short_model(&ms.model)),
        Cell::from(ms.requests.to_string()),
        Cell::from(fmt_tokens(ms.input_tokens)),
        Cell::from(fmt_tokens(ms.output_tokens)),
        Cell::from(fmt_tokens(ms.cache_read)).style(Style::default().fg(Color::Blue)),
        Cell::from(fmt_tokens(ms.cache_write)).style(Style::default().fg(Color::Blue)),
        Cell::from(fmt_cost(ms.total_cost)).style(Style::default().fg(cost_color(ms.total_cost))),
        Cell::from(format!("{pct:.1}%")),
    ])
}

fn request_row(r: &RequestRecord) -> Row<'static> {
    let (status_text, status_color) = match (&r.error, r.status) {
        (Some(_), _) => ("ERR".to_string(), Color::Red),
        (None, s) if s >= 400 => (s.to_string(), Color::Red),
        (None, s) => (s.to_string(), Color::Green),
    };
    Row::new(vec![
        Cell::from(r.timestamp.format("%H:%M:%S").to_string())
            .style(Style::default().fg(Color::Gray)),
        Cell::from(short_model(&r.model)),
        Cell::from(fmt_tokens(r.input_tokens)),
        Cell::from(fmt_tokens(r.output_tokens)),
        Cell::from(fmt_cost(r.cost)).style(Style::default().fg(cost_color(r.cost))),
        Cell::from(fmt_latency(r.latency)),
        Cell::from(status_text).style(Style::default().fg(status_color)),
    ])
}

fn cost_color(cost: f64) -> Color {
    if cost >= 1.0 {
        Color::Red
    } else if cost >= 0.10 {
        Color::Yellow
    } else {
        Color::Green
    }
}

/// Short display names for the known canonicals; anything else is clipped
/// to 24 chars so the tables keep their shape.
fn short_model(model: &str) -> String {
    match model {
        "claude-sonnet-4-20250514" => "claude-sonnet-4".to_string(),
        "claude-opus-4-20250514" => "claude-opus-4".to_string(),
        "claude-3-7-sonnet-20250219" => "claude-3.7-sonnet".to_string(),
        "claude-3-5-sonnet-20241022" => "claude-3.5-sonnet".to_string(),
        "claude-3-5-haiku-20241022" => "claude-3.5-haiku".to_string(),
        "claude-3-opus-20240229" => "claude-3-opus".to_string(),
        other => other.chars().take(24).collect(),
    }
}

fn export_csv(records: &[RequestRecord]) -> String {
    let mut out = String::from(
        "Time,Model,Input Tokens,Output Tokens,Cache Read,Cache Write,Cost,Latency (s),Status\n",
    );
    for r in records {
        out.push_str(&format!(
            "{},{},{},{},{},{},{:.6},{:.3},{}\n",
            r.timestamp.to_rfc3339(),
            csv_field(&r.model),
            r.input_tokens,
            r.output_tokens,
            r.cache_read,
            r.cache_write,
            r.cost,
            r.latency.as_secs_f64(),
            r.status,
        ));
    }
    out
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

use crate::{Counter, PipelineEvent, RunHandle, StatusSnapshot};
use anyhow::Result;
use crossbeam_channel::{tick, Receiver};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const REFRESH: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct Status {
    pub counter: Counter,
    pub status: StatusSnapshot,
    pub output_dir: PathBuf,
    pub parameters: Vec<(String, String)>,
    pub settings: Vec<(String, String)>,
    pub last_error: Option<String>,
    pub show_settings: bool,
    pub exit: Option<StatusExit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusExit {
    /// The operator asked to stop.
    Quit,
    /// Both workers returned on their own.
    Finished,
}

impl Status {
    pub fn new(
        output_dir: PathBuf,
        parameters: Vec<(String, String)>,
        settings: Vec<(String, String)>,
    ) -> Self {
        Self {
            counter: Counter::new(),
            status: StatusSnapshot::default(),
            output_dir,
            parameters,
            settings,
            last_error: None,
            show_settings: false,
            exit: None,
        }
    }

    /// Redraw until the operator quits or the run ends by itself.
    pub fn run(
        &mut self,
        terminal: &mut DefaultTerminal,
        handle: &RunHandle,
        events: &Receiver<PipelineEvent>,
    ) -> Result<StatusExit> {
        let ticker = tick(REFRESH);
        self.exit = None;
        self.counter.reset();

        while self.exit.is_none() {
            let _ = ticker.recv();

            while let Ok(event) = events.try_recv() {
                self.apply(&event);
            }
            self.counter.evict(Instant::now());
            self.status = handle.status();

            self.handle_events()?;
            if self.exit.is_none() && handle.is_finished() {
                self.exit = Some(StatusExit::Finished);
            }

            terminal.draw(|f| self.draw(f))?;
        }
        Ok(self.exit.unwrap_or(StatusExit::Quit))
    }

    /// Fold one pipeline event into the screen state.
    pub fn apply(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::FrameWritten { bytes, .. } => self.counter.increment(*bytes),
            PipelineEvent::Failed { worker, cause } => {
                self.last_error = Some(format!("{worker}: {cause}"));
            }
            _ => {}
        }
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event);
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        match key_event.code {
            KeyCode::Char('q') | KeyCode::Esc => self.exit = Some(StatusExit::Quit),
            KeyCode::Char('s') => self.show_settings = !self.show_settings,
            _ => {}
        }
    }

    fn settings_lines(&self) -> Vec<Line<'_>> {
        let mut lines = vec![Line::from(""), Line::from(" Source ".bold())];
        for (key, value) in &self.parameters {
            lines.push(Line::from(vec![format!("{key}: ").into(), value.clone().cyan()]));
        }
        lines.push(Line::from(""));
        lines.push(Line::from(" Settings ".bold()));
        for (key, value) in &self.settings {
            lines.push(Line::from(vec![format!("{key}: ").into(), value.clone().cyan()]));
        }
        lines
    }
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let state = if !self.status.running {
            "finished"
        } else if self.status.stop_requested {
            "stopping"
        } else {
            "running"
        };
        let title = Line::from(format!(" {} ({state}) ", self.output_dir.display()).bold());
        let instructions = Line::from(vec![
            " Stop ".into(),
            "<Q> ".blue().bold(),
            " Settings ".into(),
            "<S> ".blue().bold(),
        ]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let s = &self.status;
        let mut lines = vec![
            Line::from(vec![
                "Elapsed time: ".into(),
                self.counter
                    .t_begin
                    .elapsed()
                    .as_secs()
                    .to_string()
                    .yellow(),
                " s".into(),
                " Triggers: ".into(),
                s.triggers.to_string().yellow(),
                " Written: ".into(),
                s.frames_written.to_string().yellow(),
            ]),
            Line::from(vec![
                "Data rate: ".into(),
                format!("{:.2}", self.counter.rate()).yellow(),
                " MB/s ".into(),
                " Average: ".into(),
                format!("{:.2}", self.counter.average_rate()).yellow(),
                " MB/s ".into(),
                " Queue length: ".into(),
                s.queue_len.to_string().yellow(),
            ]),
            Line::from(vec![
                "Dropped: ".into(),
                s.dropped.to_string().yellow(),
                " Trigger gaps: ".into(),
                s.gaps.to_string().yellow(),
                " Repeats: ".into(),
                s.duplicates.to_string().yellow(),
            ]),
        ];
        if let Some(err) = &self.last_error {
            lines.push(Line::from(err.clone().red().bold()));
        }
        if self.show_settings {
            lines.extend(self.settings_lines());
        }

        Paragraph::new(Text::from(lines))
            .centered()
            .block(block)
            .render(area, buf);
    }
}

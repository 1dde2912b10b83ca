//! Per-container log line formatting

use crate::engine::ContainerRef;
use crossterm::style::{Color, Stylize};

/// Colour cycle handed out to containers, in order
pub const RAINBOW: [Color; 10] = [
    Color::DarkCyan,
    Color::DarkYellow,
    Color::DarkGreen,
    Color::DarkMagenta,
    Color::DarkBlue,
    Color::Cyan,
    Color::Yellow,
    Color::Green,
    Color::Magenta,
    Color::Blue,
];

/// Room left after the longest service name for `-N` replica suffixes
const MAX_INDEX_WIDTH: usize = 3;

/// Width of the prefix column for a set of services
pub fn max_name_width<S: AsRef<str>>(service_names: &[S]) -> usize {
    service_names
        .iter()
        .map(|name| name.as_ref().chars().count())
        .max()
        .unwrap_or(0)
        + MAX_INDEX_WIDTH
}

/// Formats lines of one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPresenter {
    prefix_width: usize,
    color: Option<Color>,
    prefix: bool,
}

impl LogPresenter {
    pub fn new(prefix_width: usize, color: Option<Color>, prefix: bool) -> Self {
        Self {
            prefix_width,
            color,
            prefix,
        }
    }

    pub fn color(&self) -> Option<Color> {
        self.color
    }

    /// `line` with the container's prefix, always newline terminated
    pub fn present(&self, container: &ContainerRef, line: &str) -> String {
        let line = line.strip_suffix('\n').unwrap_or(line);
        if !self.prefix {
            return format!("{}\n", line);
        }
        let prefix = format!(
            "{:<width$} |",
            container.name_without_project(),
            width = self.prefix_width
        );
        format!("{} {}\n", self.color_text(&prefix), line)
    }

    pub fn color_text(&self, text: &str) -> String {
        match self.color {
            Some(color) => text.with(color).to_string(),
            None => text.to_string(),
        }
    }
}

/// Endless supply of presenters sharing one prefix width
#[derive(Debug, Clone)]
pub struct PresenterCycle {
    prefix_width: usize,
    colors: Vec<Option<Color>>,
    prefix: bool,
    next: usize,
}

impl Iterator for PresenterCycle {
    type Item = LogPresenter;

    fn next(&mut self) -> Option<LogPresenter> {
        let color = self.colors[self.next % self.colors.len()];
        self.next += 1;
        Some(LogPresenter::new(self.prefix_width, color, self.prefix))
    }
}

/// Presenters for the given services, coloured unless `monochrome`
pub fn build_log_presenters<S: AsRef<str>>(
    service_names: &[S],
    monochrome: bool,
    prefix: bool,
) -> PresenterCycle {
    let colors = if monochrome {
        vec![None]
    } else {
        RAINBOW.iter().copied().map(Some).collect()
    };
    PresenterCycle {
        prefix_width: max_name_width(service_names),
        colors,
        prefix,
        next: 0,
    }
}

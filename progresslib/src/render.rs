use std::io::Write;

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    QueueableCommand,
    Result,
    style::{Print, Stylize},
    terminal::{self, Clear, ClearType},
    tty::IsTty,
};

use crate::{
    format::{BinarySize, ClockDuration, Eta},
    ProgressEvent,
};

/// How progress events should be drawn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RenderMode {
    /// Overwrite the same line on every event, with a bar. Useful when the
    /// terminal is interactive.
    Interactive,
    /// Append a new line on every event. Useful when output is redirected.
    Append,
    /// Do not draw anything.
    None,
}

/// Draws [`ProgressEvent`]s to a terminal.
pub struct ProgressRenderer<T: Write + IsTty> {
    term: T,
    mode: RenderMode,
    /// Whether the last thing written is an unterminated progress line
    dirty: bool,
}

impl<T: Write + IsTty> ProgressRenderer<T> {
    pub fn new(term: T) -> Self {
        let mode = if term.is_tty() {
            RenderMode::Interactive
        } else {
            RenderMode::Append
        };

        Self {
            term,
            mode,
            dirty: false,
        }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RenderMode) {
        self.mode = mode;
    }

    /// Render one event. Finished events are kept on screen.
    pub fn draw(&mut self, event: &ProgressEvent) -> Result<()> {
        if self.mode == RenderMode::None {
            return Ok(());
        }

        let mut result = format!(
            "{label} [{elapsed}] {bar_placeholder}{percent}{pos}/{len} ({speed}/s{eta})",
            label = event.label,
            elapsed = ClockDuration(event.elapsed),
            bar_placeholder = if self.mode == RenderMode::Interactive && event.length.is_some() {
                "\x00"
            } else {
                ""
            },
            percent = match ratio(event) {
                Some(r) => format!("{:.0}% ", r * 100.0),
                None => String::new(),
            },
            pos = BinarySize(event.position),
            len = match event.length {
                Some(l) => BinarySize(l).to_string(),
                None => "?".to_owned(),
            },
            speed = BinarySize(event.bytes_per_sec),
            eta = match event.eta() {
                Some(d) if !event.finished => format!(", {}", Eta(d)),
                _ => String::new(),
            },
        );

        if self.mode == RenderMode::Interactive {
            let term_width = terminal::size().unwrap_or((80, 24)).0 as usize;
            // result.len() includes the placeholder, which accounts for the
            // space after the bar
            let bar_width = term_width.saturating_sub(result.len());
            let r = ratio(event).unwrap_or(0.0);
            let bar_consumed = (r * bar_width as f64).round() as usize;
            let bar_remaining = bar_width.saturating_sub(bar_consumed);

            result = if bar_width != 0 {
                result.replace('\x00', &format!(
                    "{}{} ",
                    "#".repeat(bar_consumed).cyan(),
                    "-".repeat(bar_remaining).blue(),
                ))
            } else {
                result.replace('\x00', "")
            };

            self.term
                .queue(Hide)?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?
                .queue(Print(result))?;

            if event.finished {
                self.term.queue(Print('\n'))?.queue(Show)?;
                self.dirty = false;
            } else {
                self.dirty = true;
            }
        } else {
            result.push('\n');
            self.term.queue(Print(result))?;
        }

        self.term.flush()?;

        Ok(())
    }

    /// Print a line without clobbering an in-progress line. The progress line
    /// reappears on the next event.
    pub fn println<I: Into<String>>(&mut self, msg: I) -> Result<()> {
        if self.mode == RenderMode::None {
            return Ok(());
        }

        if self.dirty {
            self.term
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?;
            self.dirty = false;
        }

        self.term
            .queue(Print(msg.into()))?
            .queue(Print('\n'))?
            .flush()?;

        Ok(())
    }

    /// Clear any in-progress line and restore the cursor.
    pub fn finish(&mut self) -> Result<()> {
        if self.mode == RenderMode::Interactive && self.dirty {
            self.term
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?
                .queue(Show)?
                .flush()?;
            self.dirty = false;
        }

        Ok(())
    }
}

impl<T: Write + IsTty> Drop for ProgressRenderer<T> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

fn ratio(event: &ProgressEvent) -> Option<f64> {
    event.length.map(|l| if l == 0 {
        1.0
    } else {
        (event.position as f64 / l as f64).clamp(0.0, 1.0)
    })
}

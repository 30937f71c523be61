//! Two-line character display abstraction.

use thiserror::Error;

/// Visible characters per line.
pub const LINE_WIDTH: usize = 16;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("failed to open I2C bus {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to select I2C address {address:#04x}: {source}")]
    Address {
        address: u16,
        source: std::io::Error,
    },
    #[error("I2C write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// A display with two independently addressable lines.
pub trait CharDisplay {
    fn render(&mut self, line1: &str, line2: &str) -> Result<(), DisplayError>;
    fn clear(&mut self) -> Result<(), DisplayError>;
}

impl<T: CharDisplay + ?Sized> CharDisplay for Box<T> {
    fn render(&mut self, line1: &str, line2: &str) -> Result<(), DisplayError> {
        (**self).render(line1, line2)
    }

    fn clear(&mut self) -> Result<(), DisplayError> {
        (**self).clear()
    }
}

/// Truncate or space-pad `text` to exactly [`LINE_WIDTH`] characters.
pub fn fit_line(text: &str) -> String {
    format!("{:<width$.width$}", text, width = LINE_WIDTH)
}

/// Headless stand-in that logs what would have been shown.
#[derive(Debug, Default)]
pub struct TracingDisplay;

impl CharDisplay for TracingDisplay {
    fn render(&mut self, line1: &str, line2: &str) -> Result<(), DisplayError> {
        tracing::info!(line1 = line1.trim_end(), line2 = line2.trim_end(), "display");
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DisplayError> {
        tracing::info!("display cleared");
        Ok(())
    }
}

//! Terminal rendering of run output.

use std::io::{self, Stdout, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;
use matl_client::media::DataUri;
use matl_client::output::OutputBuffers;

/// Prints text output as it streams in.
///
/// Every status push carries the whole output so far, so only the part not
/// yet printed is written.
pub struct StreamPrinter<W: Write = Stdout> {
    out: W,
    enabled: bool,
    printed: String,
}

impl StreamPrinter {
    pub fn new(enabled: bool) -> Self {
        Self::with_writer(io::stdout(), enabled)
    }
}

impl<W: Write> StreamPrinter<W> {
    pub fn with_writer(out: W, enabled: bool) -> Self {
        Self {
            out,
            enabled,
            printed: String::new(),
        }
    }

    pub fn update(&mut self, output: &OutputBuffers) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let text = output.text();
        if text == self.printed {
            return Ok(());
        }
        match text.strip_prefix(self.printed.as_str()) {
            Some(rest) => write!(self.out, "{}", rest)?,
            // Output was replaced rather than extended; start over on a new line.
            None => {
                if !self.printed.is_empty() && !self.printed.ends_with('\n') {
                    writeln!(self.out)?;
                }
                write!(self.out, "{}", text)?;
            }
        }
        self.out.flush()?;
        self.printed = text;
        Ok(())
    }

    /// Print whatever is left and end the last line.
    pub fn finish(&mut self, output: &OutputBuffers) -> io::Result<()> {
        self.update(output)?;
        if self.enabled && !self.printed.is_empty() && !self.printed.ends_with('\n') {
            writeln!(self.out)?;
        }
        self.out.flush()
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

/// Wall time of a run, in seconds with two decimals.
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}

/// Write the image and audio clips of a run into `dir`. Sources that are
/// plain URLs rather than `data:` URIs are skipped.
pub fn save_media(output: &OutputBuffers, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut saved = Vec::new();

    let mut sources: Vec<(String, &str)> = Vec::new();
    if let Some(image) = &output.image {
        sources.push(("image".to_string(), image.src.as_str()));
    }
    for (index, src) in output.audio().enumerate() {
        sources.push((format!("audio-{}", index + 1), src));
    }
    if sources.is_empty() {
        return Ok(saved);
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    for (stem, src) in sources {
        let media = match DataUri::parse(src) {
            Ok(media) => media,
            Err(e) => {
                warn!("Not saving {}: {}", stem, e);
                continue;
            }
        };
        let path = dir.join(format!("{}.{}", stem, media.extension()));
        std::fs::write(&path, &media.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        saved.push(path);
    }

    Ok(saved)
}

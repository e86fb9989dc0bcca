//! SVG flamegraph generation using the inferno library.
//!
//! Collapsed stacks from the call tree are handed to inferno as folded
//! lines; widths are exclusive microseconds.

use crate::aggregator::stack_builder::CollapsedStack;
use crate::utils::error::FlamegraphError;
use inferno::flamegraph::color::{BasicPalette, Palette};
use inferno::flamegraph::{self, Options};
use log::info;

/// Flamegraph configuration
#[derive(Debug, Clone)]
pub struct FlamegraphConfig {
    pub title: String,
    pub width: usize,
    pub palette: FlamegraphPalette,
}

/// Color scheme, mapped onto inferno's palettes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlamegraphPalette {
    #[default]
    Hot,
    Mem,
    Io,
}

impl FlamegraphPalette {
    fn to_inferno(self) -> Palette {
        match self {
            FlamegraphPalette::Hot => Palette::Basic(BasicPalette::Hot),
            FlamegraphPalette::Mem => Palette::Basic(BasicPalette::Mem),
            FlamegraphPalette::Io => Palette::Basic(BasicPalette::Io),
        }
    }
}

impl Default for FlamegraphConfig {
    fn default() -> Self {
        Self {
            title: "Request Profile".to_string(),
            width: 1200,
            palette: FlamegraphPalette::default(),
        }
    }
}

impl FlamegraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_palette(mut self, palette: FlamegraphPalette) -> Self {
        self.palette = palette;
        self
    }
}

/// Generate an SVG flamegraph from collapsed stacks
///
/// **Public** - main entry point for SVG rendering
///
/// # Arguments
/// * `stacks` - Collapsed stacks, weights in µs
/// * `config` - Optional configuration (defaults when absent)
///
/// # Errors
/// * `FlamegraphError::EmptyProfile` - Nothing to draw
/// * `FlamegraphError::Render` - inferno failed to write the SVG
pub fn generate_flamegraph(
    stacks: &[CollapsedStack],
    config: Option<&FlamegraphConfig>,
) -> Result<String, FlamegraphError> {
    if stacks.is_empty() {
        return Err(FlamegraphError::EmptyProfile);
    }

    let config = config.cloned().unwrap_or_default();
    info!("[profiler] Generating flamegraph with {} stacks", stacks.len());

    let mut options = Options::default();
    options.title = config.title.clone();
    options.count_name = "µs".to_string();
    options.image_width = Some(config.width);
    options.colors = config.palette.to_inferno();

    let lines: Vec<String> = stacks.iter().map(CollapsedStack::to_line).collect();
    let mut svg = Vec::new();
    flamegraph::from_lines(&mut options, lines.iter().map(String::as_str), &mut svg)
        .map_err(|e| FlamegraphError::Render(e.to_string()))?;

    let svg = String::from_utf8_lossy(&svg).into_owned();
    info!("[profiler] Flamegraph generated ({} bytes)", svg.len());
    Ok(svg)
}

/// Plain-text table of the heaviest stacks, for terminals
///
/// # Arguments
/// * `stacks` - Collapsed stacks, heaviest first
/// * `max_lines` - Number of stacks to show
pub fn generate_text_summary(stacks: &[CollapsedStack], max_lines: usize) -> String {
    let total: u64 = stacks.iter().map(|s| s.weight).sum::<u64>().max(1);
    let mut lines = Vec::new();

    lines.push(format!("  {:<60} {:>12} {:>7}", "Stack (hottest first)", "self ms", "%"));
    lines.push(format!("  {}", "-".repeat(81)));

    for stack in stacks.iter().take(max_lines) {
        let display = if stack.stack.chars().count() > 60 {
            let tail: String = stack
                .stack
                .chars()
                .rev()
                .take(57)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("...{}", tail)
        } else {
            stack.stack.clone()
        };
        let percentage = (stack.weight as f64 / total as f64) * 100.0;
        lines.push(format!(
            "  {:<60} {:>12.2} {:>6.1}%",
            display,
            stack.weight as f64 / 1000.0,
            percentage
        ));
    }

    lines.join("\n")
}

//! Tesseract command-line engine
//!
//! Runs `tesseract <image> stdout -l <lang> tsv` and parses the TSV into a
//! block/line/word layout. Tokens are whole lines with the mean word
//! confidence.

use image::RgbImage;
use std::process::Command;
use tracing::debug;

use super::{EngineKind, LayoutBlock, LayoutLine, LayoutWord, OcrOutput, OcrToken, TempPng, TextEngine, TextLayout};
use crate::error::EngineError;

/// TSV level of word rows
const WORD_LEVEL: u32 = 5;

pub struct TesseractEngine {
    program: String,
    language: String,
}

impl TesseractEngine {
    pub fn new(program: &str, language: &str) -> Self {
        Self {
            program: program.to_string(),
            language: language.to_string(),
        }
    }
}

impl TextEngine for TesseractEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Tesseract
    }

    fn run(&self, image: &RgbImage) -> Result<OcrOutput, EngineError> {
        let temp = TempPng::write(image)?;

        let output = Command::new(&self.program)
            .arg(temp.path())
            .arg("stdout")
            .args(["-l", &self.language])
            .arg("tsv")
            .output()
            .map_err(|e| EngineError::Unavailable(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Failed(format!("tesseract exited with {}: {}", output.status, stderr.trim())));
        }

        let layout = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        let tokens = layout_tokens(&layout);
        debug!("Tesseract: {} lines", tokens.len());

        Ok(OcrOutput {
            tokens,
            layout: Some(layout),
        })
    }
}

/// One line per token, confidence = mean word confidence (0-1)
pub fn layout_tokens(layout: &TextLayout) -> Vec<OcrToken> {
    layout
        .blocks
        .iter()
        .flat_map(|b| b.lines.iter())
        .filter(|l| !l.words.is_empty())
        .map(|line| {
            let mean = line.words.iter().map(|w| w.confidence).sum::<f32>() / line.words.len() as f32;
            OcrToken::new(line.text(), mean)
        })
        .collect()
}

/// Parse Tesseract TSV output
///
/// Columns: level page_num block_num par_num line_num word_num left top
/// width height conf text. Only word rows with text are kept; rows are
/// grouped by block, then by (paragraph, line).
pub fn parse_tsv(tsv: &str) -> TextLayout {
    let mut blocks: Vec<(u32, LayoutBlock)> = Vec::new();
    let mut current_line: Option<(u32, u32, u32)> = None;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let num = |i: usize| cols[i].trim().parse::<u32>().ok();
        let (Some(level), Some(block), Some(par), Some(line)) = (num(0), num(2), num(3), num(4)) else {
            continue;
        };
        let text = cols[11..].join("\t");
        let text = text.trim();
        if level != WORD_LEVEL || text.is_empty() {
            continue;
        }

        let confidence = cols[10].trim().parse::<f32>().unwrap_or(0.0).max(0.0) / 100.0;
        let bbox = (
            num(6).unwrap_or(0),
            num(7).unwrap_or(0),
            num(8).unwrap_or(0),
            num(9).unwrap_or(0),
        );
        let word = LayoutWord {
            text: text.to_string(),
            confidence,
            bbox,
        };

        if blocks.last().map(|(id, _)| *id) != Some(block) {
            blocks.push((block, LayoutBlock::default()));
            current_line = None;
        }
        let Some((_, layout_block)) = blocks.last_mut() else {
            continue;
        };
        if current_line != Some((block, par, line)) {
            layout_block.lines.push(LayoutLine::default());
            current_line = Some((block, par, line));
        }
        if let Some(l) = layout_block.lines.last_mut() {
            l.words.push(word);
        }
    }

    TextLayout {
        blocks: blocks.into_iter().map(|(_, b)| b).collect(),
    }
}

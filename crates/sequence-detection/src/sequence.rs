//! Image sequence grouping for AssetLoupe
//!
//! Frames of a rendered sequence share a directory, a file-name prefix and a
//! suffix, and differ only in the trailing run of digits in the file stem:
//! `beauty_0001.exr`, `beauty_0002.exr`, ... are grouped into one sequence with
//! the pattern `beauty_####.exr`.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Upper bound on the frame numbers [`ImageSequence::missing_frames`] lists
pub const MAX_LISTED_MISSING: usize = 10_000;

/// A single frame of an image sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame number parsed from the file name
    pub number: u64,
    /// Full path to the frame file
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSequence {
    /// Directory containing every frame
    pub directory: PathBuf,
    /// File name text before the frame number
    pub prefix: String,
    /// File name text after the frame number, extension included
    pub suffix: String,
    /// Digit count used by the pattern
    pub padding: usize,
    /// Frames sorted by frame number
    pub frames: Vec<Frame>,
}

impl ImageSequence {
    /// Create a sequence, sorting frames by number
    pub fn new(
        directory: PathBuf,
        prefix: String,
        suffix: String,
        padding: usize,
        mut frames: Vec<Frame>,
    ) -> Self {
        frames.sort_by_key(|f| f.number);
        Self {
            directory,
            prefix,
            suffix,
            padding,
            frames,
        }
    }

    /// Display pattern such as `beauty_####.exr`
    pub fn pattern(&self) -> String {
        format!("{}{}{}", self.prefix, "#".repeat(self.padding), self.suffix)
    }

    /// Pattern joined onto the sequence directory
    pub fn pattern_path(&self) -> PathBuf {
        self.directory.join(self.pattern())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// First and last frame numbers
    pub fn frame_range(&self) -> Option<(u64, u64)> {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => Some((first.number, last.number)),
            _ => None,
        }
    }

    /// The frame used as the representative thumbnail source
    pub fn middle_frame(&self) -> Option<&Frame> {
        self.frames.get(self.frames.len() / 2)
    }

    /// Frame numbers absent from the first..=last range, at most [`MAX_LISTED_MISSING`] of them
    pub fn missing_frames(&self) -> Vec<u64> {
        self.frames
            .windows(2)
            .flat_map(|pair| pair[0].number + 1..pair[1].number)
            .take(MAX_LISTED_MISSING)
            .collect()
    }

    /// Number of frame numbers absent from the first..=last range
    pub fn missing_frame_count(&self) -> u64 {
        self.frames
            .windows(2)
            .map(|pair| pair[1].number.saturating_sub(pair[0].number + 1))
            .sum()
    }

    /// Latest modification time across all frames, in seconds since the epoch
    pub fn latest_mtime(&self) -> f64 {
        self.frames
            .iter()
            .filter_map(|f| fs::metadata(&f.path).ok())
            .filter_map(|m| m.modified().ok())
            .filter_map(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .fold(0.0, f64::max)
    }
}

/// Configuration for sequence detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Minimum number of frames to constitute a sequence
    pub min_frames: usize,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self { min_frames: 2 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceResult {
    /// Detected sequences, sorted by pattern path
    pub sequences: Vec<ImageSequence>,
    /// Files that are not part of any sequence
    pub singles: Vec<PathBuf>,
}

impl SequenceResult {
    /// Get total number of files processed
    pub fn total_files(&self) -> usize {
        self.sequences.iter().map(|s| s.frame_count()).sum::<usize>() + self.singles.len()
    }
}

/// A file name split around its frame number
#[derive(Debug, Clone, PartialEq, Eq)]
struct FrameName {
    prefix: String,
    digits: String,
    suffix: String,
}

impl FrameName {
    /// Split `name_0042.exr` into `("name_", "0042", ".exr")`
    fn parse(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let (stem, ext) = match file_name.rfind('.') {
            Some(dot) if dot > 0 => (&file_name[..dot], &file_name[dot..]),
            _ => (file_name, ""),
        };

        let digit_start = stem
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i)?;

        let digits = &stem[digit_start..];
        // Frame numbers beyond u64 are not frame numbers
        if digits.len() > 18 {
            return None;
        }

        Some(Self {
            prefix: stem[..digit_start].to_string(),
            digits: digits.to_string(),
            suffix: ext.to_string(),
        })
    }

    fn number(&self) -> Option<u64> {
        self.digits.parse().ok()
    }
}

pub struct SequenceDetector {
    config: SequenceConfig,
}

impl SequenceDetector {
    pub fn new(config: SequenceConfig) -> Self {
        Self { config }
    }

    /// Group a list of files into sequences and singles
    pub fn detect(&self, paths: Vec<PathBuf>) -> SequenceResult {
        if paths.is_empty() {
            return SequenceResult::default();
        }

        // Step 1: Parse names in parallel, large render directories hold many thousands of frames
        let parsed: Vec<(PathBuf, Option<FrameName>)> = paths
            .into_par_iter()
            .map(|path| {
                let name = FrameName::parse(&path);
                (path, name)
            })
            .collect();

        // Step 2: Partition by (directory, prefix, suffix)
        let mut groups: HashMap<(PathBuf, String, String), Vec<(FrameName, PathBuf)>> =
            HashMap::new();
        let mut singles = Vec::new();

        for (path, name) in parsed {
            match name {
                Some(name) => {
                    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
                    groups
                        .entry((dir, name.prefix.clone(), name.suffix.clone()))
                        .or_default()
                        .push((name, path));
                }
                None => singles.push(path),
            }
        }

        // Step 3: Keep groups that are long enough
        let mut sequences = Vec::new();
        for ((directory, prefix, suffix), members) in groups {
            if members.len() < self.config.min_frames.max(2) {
                singles.extend(members.into_iter().map(|(_, path)| path));
                continue;
            }

            let padding = members
                .iter()
                .map(|(name, _)| name.digits.len())
                .min()
                .unwrap_or(1);

            let mut frames = Vec::with_capacity(members.len());
            for (name, path) in members {
                match name.number() {
                    Some(number) => frames.push(Frame { number, path }),
                    None => singles.push(path),
                }
            }

            if frames.len() >= self.config.min_frames.max(2) {
                sequences.push(ImageSequence::new(directory, prefix, suffix, padding, frames));
            } else {
                singles.extend(frames.into_iter().map(|f| f.path));
            }
        }

        sequences.sort_by(|a, b| a.pattern_path().cmp(&b.pattern_path()));
        singles.sort();

        SequenceResult { sequences, singles }
    }

    /// Detect sequences among the files directly inside `dir`
    pub fn scan_directory(&self, dir: &Path) -> Result<SequenceResult> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                paths.push(entry.path());
            }
        }
        Ok(self.detect(paths))
    }
}

impl Default for SequenceDetector {
    fn default() -> Self {
        Self::new(SequenceConfig::default())
    }
}

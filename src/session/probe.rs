//! Frame size discovery from transcoder diagnostics
//!
//! The transcoder prints a description of its input before it starts
//! encoding:
//!
//! ```text
//! Input #0, rtsp, from 'rtsp://camera/stream1':
//!     Stream #0:0: Video: h264 (Main), yuvj420p(pc), 640x480, 25 fps
//! Output #0, mpegts, to 'pipe:':
//! ```
//!
//! Only `WIDTHxHEIGHT` tokens between an `Input #` marker and the following
//! `Output #` marker are considered. The window may span several chunks.
//! Text is scanned a line at a time, so a marker or size split between two
//! chunks is still found once its line is complete.

use std::sync::LazyLock;

use regex::Regex;

use super::state::Dimensions;

const INPUT_MARKER: &str = "Input #";
const OUTPUT_MARKER: &str = "Output #";

/// An unterminated line longer than this is scanned as is
const MAX_PARTIAL_LINE: usize = 4096;

static SIZE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+)x([0-9]+)").expect("frame size pattern is a valid constant regex")
});

/// Incremental scanner over diagnostic chunks
#[derive(Debug, Default)]
pub struct DimensionProbe {
    in_input: bool,
    partial: String,
}

impl DimensionProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an input description is currently open
    pub fn in_input(&self) -> bool {
        self.in_input
    }

    /// Forget the window state (new transcoder)
    pub fn reset(&mut self) {
        self.in_input = false;
        self.partial.clear();
    }

    /// Scan one chunk of diagnostic text
    ///
    /// Returns the first frame size found inside the input window. A trailing
    /// unterminated line is held back until the next chunk completes it.
    pub fn feed(&mut self, text: &str) -> Option<Dimensions> {
        self.partial.push_str(text);

        let complete = match self.partial.rfind(|c: char| c == '\n' || c == '\r') {
            Some(i) => i + 1,
            None if self.partial.len() > MAX_PARTIAL_LINE => self.partial.len(),
            None => return None,
        };

        let lines: String = self.partial.drain(..complete).collect();
        self.scan(&lines)
    }

    fn scan(&mut self, text: &str) -> Option<Dimensions> {
        let mut rest = text;
        let mut found = None;

        loop {
            if self.in_input {
                let (window, after) = match rest.find(OUTPUT_MARKER) {
                    Some(i) => (&rest[..i], Some(&rest[i + OUTPUT_MARKER.len()..])),
                    None => (rest, None),
                };

                if found.is_none() {
                    found = scan_window(window);
                }

                match after {
                    Some(after) => {
                        self.in_input = false;
                        rest = after;
                    }
                    None => break,
                }
            } else {
                match rest.find(INPUT_MARKER) {
                    Some(i) => {
                        self.in_input = true;
                        rest = &rest[i + INPUT_MARKER.len()..];
                    }
                    None => break,
                }
            }
        }

        found
    }
}

fn scan_window(window: &str) -> Option<Dimensions> {
    SIZE_TOKEN.captures_iter(window).find_map(|caps| {
        let token = caps.get(0)?;
        if !is_boundary(window[..token.start()].chars().next_back())
            || !is_boundary(window[token.end()..].chars().next())
        {
            return None;
        }

        let width = parse_side(caps.get(1)?.as_str())?;
        let height = parse_side(caps.get(2)?.as_str())?;
        Some(Dimensions::new(width, height))
    })
}

/// Tokens glued to letters or digits (e.g. `0x31637661` codec tags) are ignored
fn is_boundary(c: Option<char>) -> bool {
    c.map_or(true, |c| !c.is_ascii_alphanumeric())
}

fn parse_side(digits: &str) -> Option<u16> {
    digits.parse::<u16>().ok().filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_inside_window() {
        let mut probe = DimensionProbe::new();

        let found = probe.feed("Input #0 ... 640x480 ... Output #0\n");
        assert_eq!(found, Some(Dimensions::new(640, 480)));
        assert!(!probe.in_input());
    }

    #[test]
    fn test_size_outside_window_ignored() {
        let mut probe = DimensionProbe::new();

        assert_eq!(probe.feed("ffmpeg version 6.0 built 1920x1080\n"), None);
        assert_eq!(
            probe.feed("Input #0 rtsp\nOutput #0 mpegts\n  Stream #0:0: mpeg1video, 320x240\n"),
            None
        );
    }

    #[test]
    fn test_window_spans_chunks() {
        let mut probe = DimensionProbe::new();

        assert_eq!(probe.feed("Input #0, rtsp, from 'rtsp://cam/1':\n"), None);
        assert!(probe.in_input());

        let found = probe.feed("    Stream #0:0: Video: h264 (Main), yuvj420p(pc), 1280x720, 25 fps\n");
        assert_eq!(found, Some(Dimensions::new(1280, 720)));

        assert_eq!(probe.feed("Output #0, mpegts, to 'pipe:':\n"), None);
        assert!(!probe.in_input());
    }

    #[test]
    fn test_first_match_in_chunk_wins() {
        let mut probe = DimensionProbe::new();

        let found = probe.feed("Input #0 stream 640x480 sar 1920x1080 Output #0\n");
        assert_eq!(found, Some(Dimensions::new(640, 480)));
    }

    #[test]
    fn test_codec_tag_is_not_a_size() {
        let mut probe = DimensionProbe::new();

        let found = probe.feed("Input #0\n Stream #0:0: Video: h264 (avc1 / 0x31637661), 800x600\n");
        assert_eq!(found, Some(Dimensions::new(800, 600)));
    }

    #[test]
    fn test_out_of_range_size_ignored() {
        let mut probe = DimensionProbe::new();

        assert_eq!(probe.feed("Input #0 70000x480 Output #0\n"), None);
        assert_eq!(probe.feed("Input #0 0x480 Output #0\n"), None);
    }

    #[test]
    fn test_reset() {
        let mut probe = DimensionProbe::new();
        probe.feed("Input #0, rtsp\n");
        assert!(probe.in_input());
        probe.feed("  Stream #0:0: Video: h264, 64");

        probe.reset();
        assert!(!probe.in_input());
        assert_eq!(probe.feed("0x480\n"), None);
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut probe = DimensionProbe::new();

        assert_eq!(probe.feed("Inp"), None);
        assert_eq!(probe.feed("ut #0, rtsp, from 'rtsp://cam/1':\n  Stream #0:0: 1280x7"), None);
        assert_eq!(probe.feed("20, 25 fps\nOut"), Some(Dimensions::new(1280, 720)));
        assert!(probe.in_input());

        assert_eq!(probe.feed("put #0, mpegts\n"), None);
        assert!(!probe.in_input());
    }

    #[test]
    fn test_carriage_return_ends_line() {
        let mut probe = DimensionProbe::new();

        let found = probe.feed("Input #0 352x288 Output #0\r");
        assert_eq!(found, Some(Dimensions::new(352, 288)));
    }

    #[test]
    fn test_long_unterminated_line_is_scanned() {
        let mut probe = DimensionProbe::new();
        let line = format!("Input #0 {} 800x600 Output #0", "x".repeat(MAX_PARTIAL_LINE));

        assert_eq!(probe.feed(&line), Some(Dimensions::new(800, 600)));
    }
}

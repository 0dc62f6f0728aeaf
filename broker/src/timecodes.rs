use std::{path::PathBuf, time::Duration};

use serde::Serialize;

/// Where one batch item lands on a timeline built from its segments
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timecode {
    pub index: usize,
    pub text: String,
    pub voice: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub duration_ms: u64,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TimedSegment {
    pub index: usize,
    pub text: String,
    pub voice: String,
    pub file_path: PathBuf,
    pub duration: Duration,
}

/// Lay segments end to end, with `silence` between consecutive segments
/// that have audio. Returns the timecodes and the total length in ms.
pub fn layout(segments: Vec<TimedSegment>, silence: Duration) -> (Vec<Timecode>, u64) {
    let silence_ms = silence.as_millis() as u64;
    let mut cursor = 0u64;
    let mut seen_audio = false;
    let mut timecodes = Vec::with_capacity(segments.len());

    for segment in segments {
        let duration_ms = segment.duration.as_millis() as u64;
        if duration_ms > 0 {
            if seen_audio {
                cursor += silence_ms;
            }
            seen_audio = true;
        }
        timecodes.push(Timecode {
            index: segment.index,
            text: segment.text,
            voice: segment.voice,
            start_ms: cursor,
            end_ms: cursor + duration_ms,
            duration_ms,
            file_path: segment.file_path,
        });
        cursor += duration_ms;
    }

    (timecodes, cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(index: usize, ms: u64) -> TimedSegment {
        TimedSegment {
            index,
            text: format!("item {index}"),
            voice: "zh-CN-XiaoxiaoNeural".to_string(),
            file_path: PathBuf::from(format!("{index}.mp3")),
            duration: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_silence_between_items() {
        let (codes, total) = layout(vec![seg(0, 1000), seg(1, 500), seg(3, 250)], Duration::from_millis(200));
        let spans: Vec<_> = codes.iter().map(|c| (c.index, c.start_ms, c.end_ms)).collect();
        assert_eq!(spans, vec![(0, 0, 1000), (1, 1200, 1700), (3, 1900, 2150)]);
        assert_eq!(total, 2150);
    }

    #[test]
    fn test_zero_length_items_add_no_silence() {
        let (codes, total) = layout(vec![seg(0, 0), seg(1, 400), seg(2, 0), seg(3, 400)], Duration::from_millis(100));
        assert_eq!((codes[0].start_ms, codes[0].end_ms), (0, 0));
        assert_eq!((codes[1].start_ms, codes[1].end_ms), (0, 400));
        assert_eq!((codes[2].start_ms, codes[2].end_ms), (400, 400));
        assert_eq!((codes[3].start_ms, codes[3].end_ms), (500, 900));
        assert_eq!(total, 900);
    }

    #[test]
    fn test_empty_layout() {
        let (codes, total) = layout(Vec::new(), Duration::from_millis(200));
        assert!(codes.is_empty());
        assert_eq!(total, 0);
    }
}

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{decode, mp3, pcm::PcmBuffer, wav, AudioFormat};

/// Sample rate the external tool normalizes every input to.
const TOOL_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no usable audio segments to merge ({dropped} dropped)")]
    NoSegments { dropped: usize },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("merge task failed: {0}")]
    Task(String),
}

/// Which path produced the merged file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    ExternalTool,
    InProcess,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub output: PathBuf,
    pub format: AudioFormat,
    pub segments_merged: usize,
    /// Positions (into the input slice) of segments that could not be used
    pub dropped: Vec<usize>,
    pub strategy: MergeStrategy,
    pub duration: Option<Duration>,
}

/// Concatenates ordered audio segments into one file, with optional silence
/// between consecutive segments.
#[derive(Debug, Clone, Default)]
pub struct AudioMerger {
    tool: Option<PathBuf>,
}

impl AudioMerger {
    /// Use the given external tool binary (ffmpeg-compatible command line)
    pub fn with_tool(tool: impl Into<PathBuf>) -> Self {
        Self { tool: Some(tool.into()) }
    }

    /// Never shell out; always decode and re-encode in process
    pub fn in_process() -> Self {
        Self { tool: None }
    }

    /// Look for `ffmpeg` on PATH
    pub fn detect() -> Self {
        match which::which("ffmpeg") {
            Ok(path) => {
                info!("ffmpeg found at {}, using external merge", path.display());
                Self { tool: Some(path) }
            }
            Err(_) => {
                warn!("ffmpeg not found on PATH, merges will run in process");
                Self { tool: None }
            }
        }
    }

    pub fn tool(&self) -> Option<&Path> {
        self.tool.as_deref()
    }

    pub async fn merge(
        &self,
        segments: &[PathBuf],
        output: &Path,
        format: AudioFormat,
        silence: Duration,
    ) -> Result<MergeReport, MergeError> {
        let start = Instant::now();

        // Existence was checked upstream, but a concurrent cache clear can still
        // pull a file out from under us.
        let mut usable: Vec<(usize, PathBuf)> = Vec::with_capacity(segments.len());
        let mut dropped: Vec<usize> = Vec::new();
        for (pos, path) in segments.iter().enumerate() {
            if is_readable(path).await {
                usable.push((pos, path.clone()));
            } else {
                warn!(segment = %path.display(), "segment unreadable at merge time, dropping");
                dropped.push(pos);
            }
        }
        if usable.is_empty() {
            return Err(MergeError::NoSegments { dropped: dropped.len() });
        }

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Some(tool) = &self.tool {
            let paths: Vec<&Path> = usable.iter().map(|(_, p)| p.as_path()).collect();
            match run_tool(tool, &paths, output, format, silence).await {
                Ok(()) => {
                    let duration = probe_blocking(output.to_path_buf()).await;
                    info!(
                        "merged {} segments with external tool in {:.2}s",
                        usable.len(),
                        start.elapsed().as_secs_f64()
                    );
                    return Ok(MergeReport {
                        output: output.to_path_buf(),
                        format,
                        segments_merged: usable.len(),
                        dropped,
                        strategy: MergeStrategy::ExternalTool,
                        duration,
                    });
                }
                Err(e) => warn!("external merge failed: {e}, falling back to in-process merge"),
            }
        }

        let output_buf = output.to_path_buf();
        let (merged, decode_failures, duration) = tokio::task::spawn_blocking(move || {
            merge_in_process(&usable, &output_buf, format, silence)
        })
        .await
        .map_err(|e| MergeError::Task(e.to_string()))??;

        dropped.extend(decode_failures);
        dropped.sort_unstable();

        info!(
            "merged {} segments in process in {:.2}s",
            merged,
            start.elapsed().as_secs_f64()
        );

        Ok(MergeReport {
            output: output.to_path_buf(),
            format,
            segments_merged: merged,
            dropped,
            strategy: MergeStrategy::InProcess,
            duration: Some(duration),
        })
    }
}

async fn is_readable(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => tokio::fs::File::open(path).await.is_ok(),
        _ => false,
    }
}

async fn probe_blocking(path: PathBuf) -> Option<Duration> {
    tokio::task::spawn_blocking(move || decode::probe_duration(&path).ok())
        .await
        .ok()
        .flatten()
}

/// Temp file next to the final output so the rename stays on one filesystem.
fn staging_path(output: &Path, format: AudioFormat) -> PathBuf {
    let name = format!(".merge-{}.{}", uuid::Uuid::new_v4(), format.extension());
    match output.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn tool_args(inputs: &[&Path], output: &Path, format: AudioFormat, silence: Duration) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into(), "-loglevel".into(), "error".into()];
    for input in inputs {
        args.push("-i".into());
        args.push(input.to_string_lossy().into_owned());
    }

    let gaps = if silence.is_zero() { 0 } else { inputs.len() - 1 };
    for _ in 0..gaps {
        args.push("-f".into());
        args.push("lavfi".into());
        args.push("-i".into());
        args.push(format!(
            "aevalsrc=0:d={:.3}:s={TOOL_SAMPLE_RATE}",
            silence.as_secs_f64()
        ));
    }

    let norm = format!("aresample={TOOL_SAMPLE_RATE},aformat=sample_fmts=s16:channel_layouts=mono");
    let mut graph = String::new();
    let mut labels = String::new();
    for i in 0..inputs.len() {
        graph.push_str(&format!("[{i}:a]{norm}[s{i}];"));
        labels.push_str(&format!("[s{i}]"));
        if i < gaps {
            let g = inputs.len() + i;
            graph.push_str(&format!("[{g}:a]{norm}[g{i}];"));
            labels.push_str(&format!("[g{i}]"));
        }
    }
    let n = inputs.len() + gaps;
    graph.push_str(&format!("{labels}concat=n={n}:v=0:a=1[out]"));

    args.extend(["-filter_complex".into(), graph, "-map".into(), "[out]".into()]);
    args.extend(["-ar".into(), TOOL_SAMPLE_RATE.to_string(), "-ac".into(), "1".into()]);
    match format {
        AudioFormat::Wav => args.extend(["-c:a".into(), "pcm_s16le".into(), "-f".into(), "wav".into()]),
        AudioFormat::Mp3 => args.extend([
            "-c:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            "128k".into(),
            "-f".into(),
            "mp3".into(),
        ]),
    }
    args.push(output.to_string_lossy().into_owned());
    args
}

async fn run_tool(
    tool: &Path,
    inputs: &[&Path],
    output: &Path,
    format: AudioFormat,
    silence: Duration,
) -> anyhow::Result<()> {
    let staging = staging_path(output, format);
    let args = tool_args(inputs, &staging, format, silence);
    debug!(tool = %tool.display(), "running merge tool with {} inputs", inputs.len());

    let result = Command::new(tool)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await;

    let outcome = match result {
        Ok(out) if out.status.success() => match tokio::fs::metadata(&staging).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(anyhow::anyhow!("tool exited 0 but produced no output")),
        },
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            Err(anyhow::anyhow!("tool exited with {}: {tail}", out.status))
        }
        Err(e) => Err(anyhow::anyhow!("failed to spawn {}: {e}", tool.display())),
    };

    match outcome {
        Ok(()) => {
            if let Err(e) = tokio::fs::rename(&staging, output).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e.into());
            }
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&staging).await;
            Err(e)
        }
    }
}

/// Returns (segments merged, positions that failed to decode, output duration)
fn merge_in_process(
    segments: &[(usize, PathBuf)],
    output: &Path,
    format: AudioFormat,
    silence: Duration,
) -> Result<(usize, Vec<usize>, Duration), MergeError> {
    let mut failed = Vec::new();
    let mut combined: Option<PcmBuffer> = None;
    let mut merged = 0usize;

    for (pos, path) in segments {
        let pcm = match decode::decode_file(path) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!("dropping segment {}: {e:#}", path.display());
                failed.push(*pos);
                continue;
            }
        };

        match combined.as_mut() {
            None => combined = Some(pcm),
            Some(acc) => {
                let pcm = pcm.resample(acc.sample_rate);
                if !silence.is_zero() {
                    acc.append(&PcmBuffer::silence(silence, acc.sample_rate));
                }
                acc.append(&pcm);
            }
        }
        merged += 1;
    }

    let combined = combined.ok_or(MergeError::NoSegments { dropped: failed.len() })?;

    let bytes = match format {
        AudioFormat::Wav => wav::encode_wav(&combined),
        AudioFormat::Mp3 => mp3::encode_mp3(&combined),
    }
    .map_err(|e| MergeError::Encode(format!("{e:#}")))?;

    publish_staged(&bytes, output, format)?;

    Ok((merged, failed, combined.duration()))
}

/// Write `bytes` to a staging file and rename it onto `output`. The staging
/// file never outlives a failed write or rename.
fn publish_staged(bytes: &[u8], output: &Path, format: AudioFormat) -> std::io::Result<()> {
    let staging = staging_path(output, format);
    let published = std::fs::write(&staging, bytes).and_then(|()| std::fs::rename(&staging, output));
    if published.is_err() {
        let _ = std::fs::remove_file(&staging);
    }
    published
}

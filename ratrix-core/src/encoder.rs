use std::{
    ffi::OsString,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{capture::Frame, settings::{RuntimeParams, VideoSettings}};

/// Bytes of encoder stderr kept for error reports.
const STDERR_TAIL: usize = 4096;

/// An open output segment accepting frames in capture order.
pub trait SegmentEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError>;

    /// Flushes and closes the file. Returns the number of frames written.
    fn finish(self: Box<Self>) -> Result<u64, EncoderError>;
}

pub trait EncoderFactory {
    fn open(
        &self,
        output: &Path,
        params: &RuntimeParams,
    ) -> Result<Box<dyn SegmentEncoder>, EncoderError>;
}

/// Pipes raw RGB frames into an ffmpeg child that encodes one segment.
#[derive(Debug, Clone)]
pub struct FfmpegEncoderFactory {
    program:    PathBuf,
    codec:      String,
    extra_args: Vec<String>,
}

impl FfmpegEncoderFactory {
    #[inline]
    pub fn new(settings: &VideoSettings) -> Self {
        Self {
            program:    settings.ffmpeg.clone(),
            codec:      settings.codec.clone(),
            extra_args: settings.extra_args.clone(),
        }
    }

    #[inline]
    pub fn compose_pipe(&self, output: &Path, params: &RuntimeParams) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostats",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-video_size",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(format!("{}x{}", params.width, params.height).into());
        args.push("-framerate".into());
        args.push(params.fps.to_string().into());
        args.extend(["-i", "pipe:0", "-an", "-c:v"].map(OsString::from));
        args.push(self.codec.clone().into());
        args.extend(["-pix_fmt", "yuv420p"].map(OsString::from));
        args.extend(self.extra_args.iter().map(OsString::from));
        args.push("-y".into());
        args.push(output.as_os_str().to_owned());
        args
    }
}

/// Resolves the configured ffmpeg program against `PATH`.
#[inline]
pub fn locate_ffmpeg(settings: &VideoSettings) -> Result<PathBuf, EncoderError> {
    which::which(&settings.ffmpeg).map_err(|source| EncoderError::NotFound {
        program: settings.ffmpeg.clone(),
        source,
    })
}

impl EncoderFactory for FfmpegEncoderFactory {
    #[inline]
    fn open(
        &self,
        output: &Path,
        params: &RuntimeParams,
    ) -> Result<Box<dyn SegmentEncoder>, EncoderError> {
        let args = self.compose_pipe(output, params);
        debug!("spawning {} {:?}", self.program.display(), args);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stderr = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut tail = String::new();
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    tail.push_str(&line);
                    tail.push('\n');
                    if tail.len() > STDERR_TAIL {
                        let cut = tail.len() - STDERR_TAIL;
                        let cut = (cut..tail.len()).find(|&i| tail.is_char_boundary(i)).unwrap_or(0);
                        tail.drain(..cut);
                    }
                }
                tail
            })
        });

        Ok(Box::new(FfmpegSegment {
            child: Some(child),
            stdin,
            stderr,
            output: output.to_path_buf(),
            size: (params.width, params.height),
            frames: 0,
        }))
    }
}

struct FfmpegSegment {
    child:  Option<Child>,
    stdin:  Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    output: PathBuf,
    size:   (u32, u32),
    frames: u64,
}

impl SegmentEncoder for FfmpegSegment {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        if (frame.width, frame.height) != self.size {
            return Err(EncoderError::FrameSize {
                expected: self.size,
                actual:   (frame.width, frame.height),
            });
        }
        let stdin = self.stdin.as_mut().ok_or(EncoderError::Closed)?;
        stdin.write_all(&frame.data).map_err(EncoderError::Write)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<u64, EncoderError> {
        // closing stdin is the end-of-stream signal for ffmpeg
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Err(EncoderError::Closed);
        };
        let status = child.wait().map_err(EncoderError::Write)?;
        let stderr = self.stderr.take().and_then(|handle| handle.join().ok()).unwrap_or_default();
        if !status.success() {
            return Err(EncoderError::Exit {
                output: self.output.clone(),
                status,
                stderr,
            });
        }
        debug!("closed {} after {} frames", self.output.display(), self.frames);
        Ok(self.frames)
    }
}

impl Drop for FfmpegSegment {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("abandoning unfinished segment {}", self.output.display());
            drop(self.stdin.take());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("Failed to spawn encoder {program}: {source}")]
    Spawn {
        program: PathBuf,
        source:  std::io::Error,
    },
    #[error("Encoder {program} is not installed: {source}")]
    NotFound {
        program: PathBuf,
        source:  which::Error,
    },
    #[error("Failed to pass frame to encoder: {0}")]
    Write(#[source] std::io::Error),
    #[error("Frame is {actual:?} but the segment was opened for {expected:?}")]
    FrameSize {
        expected: (u32, u32),
        actual:   (u32, u32),
    },
    #[error("Encoder is already closed")]
    Closed,
    #[error("Encoder for {output} exited with {status}:\n{stderr}")]
    Exit {
        output: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
}

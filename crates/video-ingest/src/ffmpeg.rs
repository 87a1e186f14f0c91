//! FFmpeg-backed camera source.
//!
//! Each `open` spawns an `ffmpeg` child that decodes the stream, scales it to
//! the processing size, and writes packed `bgr24` frames to stdout. `read`
//! pulls exactly one frame worth of bytes; EOF or a short read means the
//! stream is gone and the caller should reconnect.

use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
};

use anyhow::anyhow;
use tracing::debug;

use crate::{
    source::FrameSource,
    types::{CaptureError, Frame},
};

pub struct FfmpegSource {
    uri: String,
    target_size: (i32, i32),
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    buffer: Vec<u8>,
}

impl FfmpegSource {
    pub fn new(uri: impl Into<String>, target_size: (i32, i32)) -> Self {
        let frame_bytes = (target_size.0.max(0) as usize) * (target_size.1.max(0) as usize) * 3;
        Self {
            uri: uri.into(),
            target_size,
            child: None,
            stdout: None,
            buffer: vec![0u8; frame_bytes],
        }
    }

    fn command(&self) -> Command {
        let scale_arg = format!("scale={}:{}", self.target_size.0, self.target_size.1);
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        let input = if let Some(index) = parse_device_index(&self.uri) {
            cmd.arg("-f").arg("video4linux2");
            format!("/dev/video{index}")
        } else {
            if self.uri.starts_with("rtsp://") || self.uri.starts_with("rtsps://") {
                cmd.arg("-rtsp_transport")
                    .arg("tcp")
                    .arg("-fflags")
                    .arg("nobuffer")
                    .arg("-flags")
                    .arg("low_delay");
            }
            self.uri.clone()
        };

        cmd.arg("-i")
            .arg(input)
            .arg("-vf")
            .arg(scale_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }
}

impl FrameSource for FfmpegSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        self.release();
        let mut child = self.command().spawn().map_err(|err| {
            debug!("ffmpeg spawn failed for {}: {err}", self.uri);
            CaptureError::Open {
                uri: self.uri.clone(),
            }
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;
        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stdout.is_some()
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        let stdout = self.stdout.as_mut().ok_or_else(|| CaptureError::NotOpen {
            uri: self.uri.clone(),
        })?;
        stdout.read_exact(&mut self.buffer).map_err(|err| {
            debug!("ffmpeg read failed for {}: {err}", self.uri);
            CaptureError::Read {
                uri: self.uri.clone(),
            }
        })?;
        Frame::from_bgr(self.buffer.clone(), self.target_size.0, self.target_size.1)
    }

    fn release(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

//! CPU annotation of tracked boxes onto the original colour frame.

use std::time::Instant;

use anyhow::{Result, anyhow};
use image::{Rgb, RgbImage};
use serde::Serialize;
use video_ingest::Frame;

use crate::tracking::{ObjectTracker, TrackState};

const MOVING_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const STOPPED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 2;

/// Serializable view of one tracker for sinks and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSummary {
    pub id: u64,
    /// `[x, y, width, height]` in whole pixels.
    pub bbox: [i32; 4],
    pub state: TrackState,
    pub stopped_secs: f32,
}

impl TrackSummary {
    pub fn from_tracker(tracker: &ObjectTracker, now: Instant) -> Self {
        Self {
            id: tracker.id(),
            bbox: tracker.bbox().to_pixels(),
            state: tracker.state(),
            stopped_secs: tracker.stopped_secs_at(now),
        }
    }

    pub fn label(&self) -> String {
        match self.state {
            TrackState::Moving => format!("ID {}", self.id),
            TrackState::Stopped => format!("ID {} STOP {:.0}S", self.id, self.stopped_secs),
        }
    }
}

/// A frame ready for display: the drawn image plus what was drawn.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub source_id: String,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub image: RgbImage,
    pub tracks: Vec<TrackSummary>,
}

/// Draw every track onto an RGB copy of `frame`.
pub fn annotate_frame(
    source_id: &str,
    frame: &Frame,
    frame_number: u64,
    tracks: Vec<TrackSummary>,
) -> Result<AnnotatedFrame> {
    let mut image = frame
        .to_rgb_image()
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    for track in &tracks {
        let [x, y, w, h] = track.bbox;
        let color = color_for(track.state);
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(
                &mut image,
                x + inset,
                y + inset,
                x + w - 1 - inset,
                y + h - 1 - inset,
                color,
            );
        }
    }

    for track in &tracks {
        let [x, y, _, _] = track.bbox;
        let label = track.label();
        let label_x = x.max(0);
        let label_y = (y - 12).max(0);
        let text_width = label.chars().count() as i32 * 6;
        fill_rect(
            &mut image,
            label_x,
            label_y,
            label_x + text_width,
            label_y + 8,
            LABEL_BACKGROUND,
        );
        draw_label(&mut image, label_x + 1, label_y + 1, &label, color_for(track.state));
    }

    Ok(AnnotatedFrame {
        source_id: source_id.to_string(),
        frame_number,
        timestamp_ms: frame.timestamp_ms,
        image,
        tracks,
    })
}

fn color_for(state: TrackState) -> Rgb<u8> {
    match state {
        TrackState::Moving => MOVING_COLOR,
        TrackState::Stopped => STOPPED_COLOR,
    }
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if right < left || bottom < top || right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }
    let x0 = left.clamp(0, width - 1);
    let x1 = right.clamp(0, width - 1);
    let y0 = top.clamp(0, height - 1);
    let y1 = bottom.clamp(0, height - 1);

    for x in x0..=x1 {
        if top >= 0 {
            image.put_pixel(x as u32, top as u32, color);
        }
        if bottom < height {
            image.put_pixel(x as u32, bottom as u32, color);
        }
    }
    for y in y0..=y1 {
        if left >= 0 {
            image.put_pixel(left as u32, y as u32, color);
        }
        if right < width {
            image.put_pixel(right as u32, y as u32, color);
        }
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);
    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    let px = x + col;
                    if (pattern >> (4 - col)) & 1 == 1 && px >= 0 && px < width {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        x += 6;
    }
}

/// 5x7 bitmaps for the characters labels use.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'D' => Some([0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110]),
        'I' => Some([0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        'O' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'P' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000]),
        'S' => Some([0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110]),
        'T' => Some([0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        ' ' => Some([0; 7]),
        _ => None,
    }
}

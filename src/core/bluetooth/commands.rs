//! Badge commands
//! This module defines the messages the badge firmware understands and their
//! wire encoding: one JSON header line, optionally followed by a raw bitmap.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::bitmap::ImageFrame;
use crate::core::bluetooth::error::LinkError;

static COLOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("color pattern is valid"));

/// A logical unit sent to the badge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Show a line of text in the given colour
    TextUpdate { text: String, color: String },
    /// Draw a packed 1-bit bitmap, optionally captioned
    ImageUpdate {
        width: u32,
        height: u32,
        caption: Option<String>,
        bitmap: Vec<u8>,
    },
}

#[derive(Serialize)]
struct TextCommand<'a> {
    text: &'a str,
    color: &'a str,
}

#[derive(Serialize)]
struct ImageStartCommand<'a> {
    cmd: &'static str,
    w: u32,
    h: u32,
    len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

impl OutboundMessage {
    /// Builds a text update, checking that `color` is `#RRGGBB`.
    pub fn text(text: impl Into<String>, color: impl Into<String>) -> Result<Self, LinkError> {
        let color = color.into();
        if !COLOR_RE.is_match(&color) {
            return Err(LinkError::InvalidColor(color));
        }
        Ok(Self::TextUpdate {
            text: text.into(),
            color,
        })
    }

    /// Builds an image update. The caption is trimmed and dropped when empty.
    pub fn image(frame: ImageFrame, caption: &str) -> Self {
        let caption = caption.trim();
        Self::ImageUpdate {
            width: frame.width(),
            height: frame.height(),
            caption: (!caption.is_empty()).then(|| caption.to_string()),
            bitmap: frame.bytes().to_vec(),
        }
    }

    /// The JSON header line, newline terminated.
    pub fn header(&self) -> Result<Vec<u8>, LinkError> {
        let mut line = match self {
            Self::TextUpdate { text, color } => serde_json::to_vec(&TextCommand { text, color })?,
            Self::ImageUpdate {
                width,
                height,
                caption,
                bitmap,
            } => serde_json::to_vec(&ImageStartCommand {
                cmd: "image_start",
                w: *width,
                h: *height,
                len: bitmap.len(),
                prompt: caption.as_deref(),
            })?,
        };
        line.push(b'\n');
        Ok(line)
    }

    /// Raw bytes following the header, if any.
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            Self::TextUpdate { .. } => None,
            Self::ImageUpdate { bitmap, .. } => Some(bitmap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bitmap;
    use image::{Rgba, RgbaImage};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_text_header() {
        let message = OutboundMessage::text("Hi", "#00FF00").unwrap();
        assert_eq!(
            String::from_utf8(message.header().unwrap()).unwrap(),
            "{\"text\":\"Hi\",\"color\":\"#00FF00\"}\n"
        );
        assert_eq!(message.body(), None);
    }

    #[test]
    fn test_text_is_json_escaped() {
        let message = OutboundMessage::text("say \"hi\"\nnow", "#abcdef").unwrap();
        let header = message.header().unwrap();
        // Only the terminator may be a raw newline
        assert_eq!(header.iter().filter(|&&b| b == b'\n').count(), 1);
        let parsed: serde_json::Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(parsed["text"], "say \"hi\"\nnow");
    }

    #[test]
    fn test_invalid_colors_rejected() {
        for color in ["00FF00", "#00FF0", "#00FF00FF", "#GGGGGG", "red", ""] {
            assert!(
                matches!(OutboundMessage::text("x", color), Err(LinkError::InvalidColor(_))),
                "{:?} accepted",
                color
            );
        }
    }

    #[test]
    fn test_image_header() {
        let frame = bitmap::render(&RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255])), 4, 4)
            .unwrap();
        let message = OutboundMessage::image(frame, "  the stars align  ");
        assert_eq!(
            String::from_utf8(message.header().unwrap()).unwrap(),
            "{\"cmd\":\"image_start\",\"w\":4,\"h\":4,\"len\":2,\"prompt\":\"the stars align\"}\n"
        );
        assert_eq!(message.body(), Some(&[0xFF, 0xFF][..]));
    }

    #[test]
    fn test_image_header_without_caption() {
        let frame = bitmap::render(&RgbaImage::from_pixel(3, 3, Rgba([255; 4])), 3, 3).unwrap();
        let message = OutboundMessage::image(frame, "   ");
        assert_eq!(
            String::from_utf8(message.header().unwrap()).unwrap(),
            "{\"cmd\":\"image_start\",\"w\":3,\"h\":3,\"len\":2}\n"
        );
    }
}

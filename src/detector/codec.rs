//! Wire formats of the detector link: JPEG frames out, JSON batches in.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::result::DetectionBatch;
use super::DetectorError;
use crate::frame::{Frame, PixelFormat};

/// Quality of outbound frames (the `image` encoder default).
pub const JPEG_QUALITY: u8 = 75;

/// Encode a frame as a baseline JPEG. Alpha is discarded.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, DetectorError> {
    let rgb: Vec<u8> = match frame.format() {
        PixelFormat::Rgba8 => frame
            .pixels()
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
    };
    let mut out = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode(
        &rgb,
        frame.width(),
        frame.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

/// Decode one inbound message into a detection batch.
pub fn decode_batch(payload: &[u8]) -> Result<DetectionBatch, DetectorError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_jpeg_with_frame_dimensions() {
        let frame = Frame::filled(16, 8, [200, 10, 10, 255]);
        let jpeg = encode_jpeg(&frame).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn decodes_batch_with_legacy_names() {
        let batch = decode_batch(
            br#"[{"class":"dog","score":0.5,"box":[0,0,1,1]},
                 {"label":"cat","confidence":0.25,"box":[0.1,0.2,0.3,0.4]}]"#,
        )
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].label, "dog");
        assert_eq!(batch[1].confidence, 0.25);
        assert_eq!(batch[1].bbox, [0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn empty_batch_is_valid() {
        assert!(decode_batch(b"[]").unwrap().is_empty());
    }

    #[test]
    fn short_box_rejects_whole_payload() {
        let err = decode_batch(
            br#"[{"label":"ok","confidence":1,"box":[0,0,1,1]},
                 {"label":"bad","confidence":1,"box":[0,0,1]}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, DetectorError::Decode(_)));
    }

    #[test]
    fn non_array_payload_is_rejected() {
        assert!(decode_batch(br#"{"label":"x"}"#).is_err());
        assert!(decode_batch(b"\xff\xfe").is_err());
    }
}

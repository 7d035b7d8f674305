//! Timed-metadata handling: sanitization, the in-band ID3 decoder, and the
//! cue fields live sessions match against their ad pool.

use std::collections::HashMap;

use tracing::debug;

/// Flat string-keyed timed-metadata map (e.g. `YMID`/`YTYP`/`YSEQ`).
pub type TimedMetadata = HashMap<String, String>;

/// Strip control characters from keys and values before cue matching.
pub fn sanitize(raw: &TimedMetadata) -> TimedMetadata {
    raw.iter()
        .map(|(k, v)| (strip_controls(k), strip_controls(v)))
        .collect()
}

fn strip_controls(s: &str) -> String {
    s.chars().filter(|c| *c as u32 >= 0x20).collect()
}

/// Decode an ID3v2 tag into a flat metadata map.
///
/// Rejects tags with the unsynchronisation or extended-header flags set, and
/// any major version above what the frame walk understands. Frame payloads
/// are kept only when fully printable ASCII.
pub fn parse_id3(data: &[u8]) -> Option<TimedMetadata> {
    if data.len() < 10 || &data[0..3] != b"ID3" {
        return None;
    }
    let version = u16::from_be_bytes([data[3], data[4]]);
    if version > 1024 {
        debug!(version, "unsupported ID3 version");
        return None;
    }
    let flags = data[5];
    // Unsynchronised (0x80) and extended-header (0x40) tags are not handled.
    if flags & 0xC0 != 0 {
        debug!(flags, "unsupported ID3 flags");
        return None;
    }
    let tag_size = syncsafe(&data[6..10])? as usize;
    let end = (10 + tag_size).min(data.len());

    let mut metadata = TimedMetadata::new();
    let mut at = 10;
    while at + 10 <= end {
        let id = &data[at..at + 4];
        if id.iter().all(|b| *b == 0) {
            break; // padding
        }
        let frame_size = syncsafe(&data[at + 4..at + 8])? as usize;
        let frame_end = at + 10 + frame_size;
        if frame_size == 0 || frame_end > end {
            break;
        }
        if let (Ok(key), Some(value)) = (
            std::str::from_utf8(id),
            printable_text(&data[at + 10..frame_end]),
        ) {
            metadata.insert(key.to_string(), value);
        }
        at = frame_end;
    }

    if metadata.is_empty() {
        None
    } else {
        Some(metadata)
    }
}

/// 28-bit syncsafe integer: four bytes, high bit of each must be clear.
fn syncsafe(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 4 || bytes.iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    Some(((bytes[0] as u32) << 21)
        | ((bytes[1] as u32) << 14)
        | ((bytes[2] as u32) << 7)
        | bytes[3] as u32)
}

/// Frame payload as text, tolerating a leading encoding byte and trailing
/// NULs; anything non-printable rejects the frame.
fn printable_text(payload: &[u8]) -> Option<String> {
    let body = match payload.first() {
        Some(0) => &payload[1..],
        _ => payload,
    };
    let body: &[u8] = match body.iter().position(|b| *b == 0) {
        Some(nul) => &body[..nul],
        None => body,
    };
    if body.is_empty() || !body.iter().all(|b| (0x20..0x7F).contains(b)) {
        return None;
    }
    // All bytes verified printable ASCII above.
    String::from_utf8(body.to_vec()).ok()
}

/// Position of a cue within its advert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueType {
    Start,
    Middle,
    End,
}

impl CueType {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "S" => Some(Self::Start),
            "M" => Some(Self::Middle),
            "E" => Some(Self::End),
            _ => None,
        }
    }
}

/// A fully-parsed live cue: which advert, where in it, and how far through
/// the break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CueFields {
    pub media_id: String,
    pub cue_type: CueType,
    /// 1-based segment index within the advert.
    pub sequence: u32,
    pub total: u32,
}

/// Extract the cue fields from sanitized timed metadata. Returns `None`
/// unless all three of `YMID`, `YTYP` and `YSEQ` (`n:total`) are present and
/// well-formed.
pub fn cue_fields(metadata: &TimedMetadata) -> Option<CueFields> {
    let media_id = metadata.get("YMID")?.clone();
    let cue_type = CueType::from_tag(metadata.get("YTYP")?)?;
    let seq = metadata.get("YSEQ")?;
    let (n, total) = seq.split_once(':')?;
    Some(CueFields {
        media_id,
        cue_type,
        sequence: n.trim().parse().ok()?,
        total: total.trim().parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal ID3v2.4 tag containing the given text frames.
    fn id3_tag(frames: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (id, text) in frames {
            body.extend_from_slice(id.as_bytes());
            let payload_len = text.len() + 1; // encoding byte
            body.extend_from_slice(&to_syncsafe(payload_len as u32));
            body.extend_from_slice(&[0, 0]); // frame flags
            body.push(0); // ISO-8859-1 encoding
            body.extend_from_slice(text.as_bytes());
        }
        let mut tag = Vec::new();
        tag.extend_from_slice(b"ID3");
        tag.extend_from_slice(&[4, 0, 0]); // version 2.4, no flags
        tag.extend_from_slice(&to_syncsafe(body.len() as u32));
        tag.extend_from_slice(&body);
        tag
    }

    fn to_syncsafe(v: u32) -> [u8; 4] {
        [
            ((v >> 21) & 0x7F) as u8,
            ((v >> 14) & 0x7F) as u8,
            ((v >> 7) & 0x7F) as u8,
            (v & 0x7F) as u8,
        ]
    }

    #[test]
    fn decodes_cue_frames() {
        let tag = id3_tag(&[("YMID", "media-1"), ("YTYP", "S"), ("YSEQ", "1:3")]);
        let metadata = parse_id3(&tag).unwrap();
        assert_eq!(metadata.get("YMID").map(String::as_str), Some("media-1"));
        assert_eq!(metadata.get("YTYP").map(String::as_str), Some("S"));
        assert_eq!(metadata.get("YSEQ").map(String::as_str), Some("1:3"));
    }

    #[test]
    fn rejects_wrong_sync_word() {
        assert!(parse_id3(b"TAG3xxxxxxxxxx").is_none());
    }

    #[test]
    fn rejects_unsynchronised_flag() {
        let mut tag = id3_tag(&[("YMID", "media-1")]);
        tag[5] = 0x80;
        assert!(parse_id3(&tag).is_none());
    }

    #[test]
    fn rejects_extended_header_flag() {
        let mut tag = id3_tag(&[("YMID", "media-1")]);
        tag[5] = 0x40;
        assert!(parse_id3(&tag).is_none());
    }

    #[test]
    fn truncated_frame_stops_walk() {
        let mut tag = id3_tag(&[("YMID", "media-1")]);
        // Append a frame header claiming more payload than exists.
        tag.extend_from_slice(b"YSEQ");
        tag.extend_from_slice(&to_syncsafe(100));
        tag.extend_from_slice(&[0, 0]);
        // Tag size header not updated, so the walk stays bounded anyway.
        let metadata = parse_id3(&tag).unwrap();
        assert!(metadata.contains_key("YMID"));
        assert!(!metadata.contains_key("YSEQ"));
    }

    #[test]
    fn cue_fields_parsed() {
        let mut metadata = TimedMetadata::new();
        metadata.insert("YMID".to_string(), "media-1".to_string());
        metadata.insert("YTYP".to_string(), "M".to_string());
        metadata.insert("YSEQ".to_string(), "2:3".to_string());
        let cue = cue_fields(&metadata).unwrap();
        assert_eq!(cue.cue_type, CueType::Middle);
        assert_eq!(cue.sequence, 2);
        assert_eq!(cue.total, 3);
    }

    #[test]
    fn cue_fields_require_all_three_keys() {
        let mut metadata = TimedMetadata::new();
        metadata.insert("YMID".to_string(), "media-1".to_string());
        metadata.insert("YTYP".to_string(), "S".to_string());
        assert!(cue_fields(&metadata).is_none());
    }

    #[test]
    fn sanitize_strips_control_characters() {
        let mut raw = TimedMetadata::new();
        raw.insert("YMID\u{0}".to_string(), "media\u{1}-1".to_string());
        let clean = sanitize(&raw);
        assert_eq!(clean.get("YMID").map(String::as_str), Some("media-1"));
    }
}

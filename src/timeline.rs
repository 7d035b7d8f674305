//! The mutable playback timeline: an ordered run of content and advert
//! ranges, plus the live-window trimming and content-gap adjustment the
//! sessions drive.

use tracing::debug;

use crate::adbreak::{BreakKey, BreakPool};

const EPSILON: f64 = 0.001;
/// A trailing content run shorter than this is considered rounding noise and
/// not materialised.
const TRAILING_TOLERANCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Content,
    Advert(BreakKey),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineElement {
    /// Absolute offset in stream seconds.
    pub offset: f64,
    pub duration: f64,
    pub kind: ElementKind,
}

impl TimelineElement {
    pub fn end(&self) -> f64 {
        self.offset + self.duration
    }

    pub fn is_advert(&self) -> bool {
        matches!(self.kind, ElementKind::Advert(_))
    }

    pub fn break_key(&self) -> Option<BreakKey> {
        match self.kind {
            ElementKind::Advert(key) => Some(key),
            ElementKind::Content => None,
        }
    }
}

#[derive(Default)]
pub struct Timeline {
    elements: Vec<TimelineElement>,
    /// Stream offset of the first element; non-zero once a live window has
    /// slid past the original origin.
    start_offset: f64,
    modified: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_offset(&self) -> f64 {
        self.start_offset
    }

    /// Append an element at the current end of the timeline.
    pub fn append_element(&mut self, duration: f64, kind: ElementKind) {
        let offset = self
            .elements
            .last()
            .map(TimelineElement::end)
            .unwrap_or(self.start_offset);
        self.elements.push(TimelineElement {
            offset,
            duration,
            kind,
        });
        self.modified = true;
    }

    pub fn clear(&mut self) {
        if !self.elements.is_empty() {
            self.modified = true;
        }
        self.elements.clear();
        self.start_offset = 0.0;
    }

    /// Element covering `position`, if any.
    pub fn element_at(&self, position: f64) -> Option<&TimelineElement> {
        self.elements
            .iter()
            .find(|e| position >= e.offset && position < e.end())
    }

    /// First element starting strictly after `position`.
    pub fn next_element_after(&self, position: f64) -> Option<&TimelineElement> {
        self.elements.iter().find(|e| e.offset > position)
    }

    pub fn all_elements(&self) -> &[TimelineElement] {
        &self.elements
    }

    pub fn total_duration(&self) -> f64 {
        self.elements
            .last()
            .map(TimelineElement::end)
            .unwrap_or(self.start_offset)
            - self.start_offset
    }

    /// Absolute stream position at which the timeline ends.
    pub fn end_position(&self) -> f64 {
        self.elements
            .last()
            .map(TimelineElement::end)
            .unwrap_or(self.start_offset)
    }

    /// Check-and-clear the modification flag.
    pub fn take_modified(&mut self) -> bool {
        std::mem::take(&mut self.modified)
    }

    /// Rebuild content runs around the advert elements so the timeline spans
    /// `total` seconds from the current start offset.
    ///
    /// Advert elements keep their offsets; gaps between them become content
    /// elements; a trailing content run is added only when more than the
    /// rounding tolerance remains. Sets the modification flag only when the
    /// resulting geometry differs, so repeated calls with the same inputs are
    /// idempotent.
    pub fn adjust_content(&mut self, total: f64) {
        let before = self.elements.clone();
        let adverts: Vec<TimelineElement> =
            self.elements.iter().filter(|e| e.is_advert()).copied().collect();

        let mut rebuilt = Vec::with_capacity(adverts.len() * 2 + 1);
        let mut cursor = self.start_offset;
        for advert in adverts {
            let gap = advert.offset - cursor;
            if gap > EPSILON {
                rebuilt.push(TimelineElement {
                    offset: cursor,
                    duration: gap,
                    kind: ElementKind::Content,
                });
            }
            cursor = advert.end();
            rebuilt.push(advert);
        }
        let target_end = self.start_offset + total;
        if target_end - cursor > TRAILING_TOLERANCE {
            rebuilt.push(TimelineElement {
                offset: cursor,
                duration: target_end - cursor,
                kind: ElementKind::Content,
            });
        }

        if rebuilt != before {
            self.modified = true;
        }
        self.elements = rebuilt;
    }

    /// Slide the timeline origin forward to `offset` (live DVR window
    /// trimming).
    ///
    /// Elements entirely before the new origin are dropped, releasing their
    /// breaks from the pool. An element straddling the origin is trimmed in
    /// place; a straddling advert element additionally has its break pruned
    /// tail-first so the adverts still on the timeline keep their identity.
    pub fn update_offset(&mut self, offset: f64, pool: &mut BreakPool) {
        if offset <= self.start_offset + EPSILON {
            self.start_offset = self.start_offset.max(offset);
            return;
        }

        let mut changed = false;
        while let Some(first) = self.elements.first() {
            if first.end() <= offset + EPSILON {
                let dropped = self.elements.remove(0);
                if let Some(key) = dropped.break_key() {
                    pool.release(key);
                    debug!(offset, "released break trimmed out of live window");
                }
                changed = true;
            } else {
                break;
            }
        }

        if let Some(first) = self.elements.first_mut() {
            if first.offset < offset - EPSILON {
                let trim = offset - first.offset;
                first.duration -= trim;
                first.offset = offset;
                changed = true;
                if let Some(key) = first.break_key() {
                    let remaining = first.duration;
                    if let Some(ad_break) = pool.get_mut(key) {
                        prune_break_head(ad_break, remaining, offset);
                    }
                }
            }
        }

        self.start_offset = offset;
        if changed {
            self.modified = true;
        }
    }
}

/// Drop adverts from the head of a break until the tail fits in `remaining`
/// seconds, truncating the advert that straddles the boundary. The break is
/// re-anchored at the new window origin.
fn prune_break_head(ad_break: &mut crate::adbreak::AdBreak, remaining: f64, origin: f64) {
    let mut keep = 0.0;
    let mut first_kept = ad_break.adverts.len();
    for (index, advert) in ad_break.adverts.iter().enumerate().rev() {
        if keep + advert.duration <= remaining + EPSILON {
            keep += advert.duration;
            first_kept = index;
        } else {
            break;
        }
    }

    if first_kept > 0 {
        let truncate_to = remaining - keep;
        if first_kept < ad_break.adverts.len() && truncate_to > EPSILON {
            // The advert just before the kept tail survives, shortened.
            first_kept -= 1;
            ad_break.adverts[first_kept].truncate(truncate_to);
        } else if first_kept == ad_break.adverts.len() && !ad_break.adverts.is_empty() {
            // Nothing fits whole; keep only a truncated last advert.
            first_kept = ad_break.adverts.len() - 1;
            ad_break.adverts[first_kept].truncate(remaining);
        }
        ad_break.adverts.drain(..first_kept);
    }
    ad_break.start_position = origin;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adbreak::AdBreak;
    use crate::schedule::{AdBreakDescriptor, AdvertDescriptor};
    use std::collections::HashMap;

    fn advert(duration: f64) -> AdvertDescriptor {
        AdvertDescriptor {
            media_id: "media-1".to_string(),
            advert_id: "ad-1".to_string(),
            creative_id: "creative-1".to_string(),
            duration,
            skip_offset: None,
            interactive: false,
            asset_uri: "https://cdn.example.com/ad.ts".to_string(),
            clickthrough: None,
            impressions: Vec::new(),
            tracking: HashMap::new(),
        }
    }

    fn pooled_break(pool: &mut BreakPool, position: f64, durations: &[f64]) -> BreakKey {
        pool.insert(AdBreak::from_descriptor(&AdBreakDescriptor {
            id: format!("break-at-{position}"),
            break_type: "linear".to_string(),
            position,
            adverts: durations.iter().map(|d| advert(*d)).collect(),
            tracking: HashMap::new(),
        }))
    }

    #[test]
    fn element_lookup_half_open_ranges() {
        let mut pool = BreakPool::default();
        let key = pooled_break(&mut pool, 30.0, &[15.0]);
        let mut timeline = Timeline::new();
        timeline.append_element(30.0, ElementKind::Content);
        timeline.append_element(15.0, ElementKind::Advert(key));
        timeline.append_element(55.0, ElementKind::Content);

        assert!(!timeline.element_at(29.9).unwrap().is_advert());
        assert!(timeline.element_at(30.0).unwrap().is_advert());
        assert!(timeline.element_at(44.9).unwrap().is_advert());
        assert!(!timeline.element_at(45.0).unwrap().is_advert());
        assert!(timeline.element_at(100.0).is_none());
        assert_eq!(timeline.next_element_after(10.0).unwrap().offset, 30.0);
        assert_eq!(timeline.total_duration(), 100.0);
    }

    #[test]
    fn take_modified_clears() {
        let mut timeline = Timeline::new();
        timeline.append_element(10.0, ElementKind::Content);
        assert!(timeline.take_modified());
        assert!(!timeline.take_modified());
    }

    #[test]
    fn adjust_content_fills_gaps_and_trailer() {
        let mut pool = BreakPool::default();
        let key = pooled_break(&mut pool, 30.0, &[15.0]);
        let mut timeline = Timeline::new();
        timeline.append_element(30.0, ElementKind::Content);
        timeline.append_element(15.0, ElementKind::Advert(key));
        timeline.adjust_content(100.0);

        let elements = timeline.all_elements();
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[2].offset, 45.0);
        assert_eq!(elements[2].duration, 55.0);
        assert!(!elements[2].is_advert());
    }

    #[test]
    fn adjust_content_skips_sub_tolerance_trailer() {
        let mut pool = BreakPool::default();
        let key = pooled_break(&mut pool, 0.0, &[15.0]);
        let mut timeline = Timeline::new();
        timeline.append_element(15.0, ElementKind::Advert(key));
        timeline.adjust_content(15.5);
        assert_eq!(timeline.all_elements().len(), 1);
    }

    #[test]
    fn adjust_content_is_idempotent() {
        let mut pool = BreakPool::default();
        let key = pooled_break(&mut pool, 30.0, &[15.0]);
        let mut timeline = Timeline::new();
        timeline.append_element(30.0, ElementKind::Content);
        timeline.append_element(15.0, ElementKind::Advert(key));
        timeline.adjust_content(100.0);
        timeline.take_modified();

        timeline.adjust_content(100.0);
        assert!(!timeline.take_modified());
    }

    #[test]
    fn update_offset_drops_elapsed_elements_and_releases_breaks() {
        let mut pool = BreakPool::default();
        let key = pooled_break(&mut pool, 10.0, &[5.0]);
        let mut timeline = Timeline::new();
        timeline.append_element(10.0, ElementKind::Content);
        timeline.append_element(5.0, ElementKind::Advert(key));
        timeline.append_element(85.0, ElementKind::Content);
        timeline.take_modified();

        timeline.update_offset(20.0, &mut pool);
        assert!(timeline.take_modified());
        assert!(pool.get(key).is_none());
        let elements = timeline.all_elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].offset, 20.0);
        assert_eq!(elements[0].duration, 80.0);
        assert_eq!(timeline.start_offset(), 20.0);
    }

    #[test]
    fn update_offset_trims_straddling_break_tail_first() {
        let mut pool = BreakPool::default();
        let key = pooled_break(&mut pool, 10.0, &[10.0, 10.0, 10.0]);
        let mut timeline = Timeline::new();
        timeline.append_element(10.0, ElementKind::Content);
        timeline.append_element(30.0, ElementKind::Advert(key));
        timeline.take_modified();

        // 15 seconds of the break remain in the window.
        timeline.update_offset(25.0, &mut pool);

        let ad_break = pool.get(key).unwrap();
        assert_eq!(ad_break.adverts.len(), 2);
        assert_eq!(ad_break.adverts[0].duration, 5.0);
        assert_eq!(ad_break.adverts[1].duration, 10.0);
        assert_eq!(ad_break.start_position, 25.0);
        let first = &timeline.all_elements()[0];
        assert!(first.is_advert());
        assert_eq!(first.offset, 25.0);
        assert_eq!(first.duration, 15.0);
    }

    #[test]
    fn update_offset_is_idempotent() {
        let mut pool = BreakPool::default();
        let key = pooled_break(&mut pool, 10.0, &[10.0]);
        let mut timeline = Timeline::new();
        timeline.append_element(10.0, ElementKind::Content);
        timeline.append_element(10.0, ElementKind::Advert(key));
        timeline.append_element(80.0, ElementKind::Content);
        timeline.update_offset(15.0, &mut pool);
        timeline.take_modified();

        timeline.update_offset(15.0, &mut pool);
        assert!(!timeline.take_modified());
        assert_eq!(timeline.start_offset(), 15.0);
    }
}

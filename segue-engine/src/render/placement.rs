//! Aspect-ratio-correct placement of a source frame inside a target frame
//!
//! A wider source is letterboxed (bars top and bottom), a taller source is
//! pillarboxed (bars left and right). The placed rectangle is always centred
//! and never exceeds the target.

/// Destination rectangle in target-frame pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Placement {
    /// Rectangle covering the whole target
    pub fn full(target_width: u32, target_height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: target_width as f64,
            height: target_height as f64,
        }
    }

    /// Whether the point lies inside the rectangle (right/bottom edges exclusive)
    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x && px < self.x + self.width && py >= self.y && py < self.y + self.height
    }
}

/// Fit a `source` frame into a `target` frame preserving its aspect ratio
///
/// Degenerate sizes (any zero dimension) fill the whole target.
///
/// ```
/// use segue_engine::render::fit_rect;
///
/// // 4:3 source in a 16:9 frame is pillarboxed
/// let p = fit_rect(640, 480, 1920, 1080);
/// assert_eq!((p.x, p.y, p.width, p.height), (240.0, 0.0, 1440.0, 1080.0));
/// ```
pub fn fit_rect(source_width: u32, source_height: u32, target_width: u32, target_height: u32) -> Placement {
    if source_width == 0 || source_height == 0 || target_width == 0 || target_height == 0 {
        return Placement::full(target_width, target_height);
    }

    let (sw, sh) = (source_width as f64, source_height as f64);
    let (tw, th) = (target_width as f64, target_height as f64);
    let source_aspect = sw / sh;
    let target_aspect = tw / th;

    if source_aspect > target_aspect {
        // Letterbox
        let height = tw / source_aspect;
        Placement {
            x: 0.0,
            y: (th - height) / 2.0,
            width: tw,
            height,
        }
    } else if source_aspect < target_aspect {
        // Pillarbox
        let width = th * source_aspect;
        Placement {
            x: (tw - width) / 2.0,
            y: 0.0,
            width,
            height: th,
        }
    } else {
        Placement::full(target_width, target_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_aspect_fills() {
        assert_eq!(fit_rect(1280, 720, 1920, 1080), Placement::full(1920, 1080));
    }

    #[test]
    fn test_wider_source_is_letterboxed() {
        // 2.4:1 into 16:9
        let p = fit_rect(2400, 1000, 1920, 1080);
        assert_eq!(p.x, 0.0);
        assert_eq!(p.width, 1920.0);
        assert!((p.height - 800.0).abs() < 1e-9);
        assert!((p.y - 140.0).abs() < 1e-9);
    }

    #[test]
    fn test_portrait_source_is_pillarboxed() {
        let p = fit_rect(1080, 1920, 1920, 1080);
        assert_eq!(p.height, 1080.0);
        assert!((p.width - 607.5).abs() < 1e-9);
        assert!((p.x - 656.25).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_sizes_fill_target() {
        assert_eq!(fit_rect(0, 720, 1280, 720), Placement::full(1280, 720));
        assert_eq!(fit_rect(1280, 0, 1280, 720), Placement::full(1280, 720));
    }

    #[test]
    fn test_placement_stays_inside_target() {
        for (w, h) in [(1, 1000), (1000, 1), (333, 777), (4096, 2160)] {
            let p = fit_rect(w, h, 2560, 1440);
            assert!(p.x >= 0.0 && p.y >= 0.0);
            assert!(p.x + p.width <= 2560.0 + 1e-9);
            assert!(p.y + p.height <= 1440.0 + 1e-9);
        }
    }
}

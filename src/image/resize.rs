use ::image::imageops::FilterType;
use ::image::{DynamicImage, GenericImageView};

use crate::core::types::ImageSize;

// ---------------------------------------------------------------------------
// Resize planning
// ---------------------------------------------------------------------------

/// Region of the source kept by a center crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Geometry of one resize: an optional center crop, then a scale to
/// `width × height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub crop: Option<CropRect>,
    pub width: u32,
    pub height: u32,
}

impl ResizePlan {
    fn identity(width: u32, height: u32) -> Self {
        Self {
            crop: None,
            width,
            height,
        }
    }

    /// True when applying the plan to a `width × height` image changes nothing.
    pub fn is_noop(&self, width: u32, height: u32) -> bool {
        self.crop.is_none() && self.width == width && self.height == height
    }
}

/// `round(a × b / c)` without overflow, never below 1.
fn scale(a: u32, b: u32, c: u32) -> u32 {
    let c = u64::from(c.max(1));
    let v = (u64::from(a) * u64::from(b) + c / 2) / c;
    v.clamp(1, u64::from(u32::MAX)) as u32
}

/// Plan how an `iw × ih` image is turned into `size`.
///
/// - No dimension requested: unchanged.
/// - One dimension requested: the other follows the source aspect ratio;
///   without scale-up the requested dimension is clamped to the source.
/// - Both requested with crop: center-crop to the target aspect ratio, then
///   scale. Equal aspect ratios are not cropped. Without scale-up a crop
///   smaller than the target is returned at its own size.
/// - Both requested without crop: fit inside the box, preserving aspect;
///   without scale-up never larger than the source.
pub fn plan_resize(iw: u32, ih: u32, size: &ImageSize) -> ResizePlan {
    let (rw, rh) = (size.width, size.height);
    let up = size.allow_scale_up;

    if iw == 0 || ih == 0 || (rw == 0 && rh == 0) {
        return ResizePlan::identity(iw, ih);
    }

    if rw == 0 {
        let h = if up { rh } else { rh.min(ih) };
        return ResizePlan::identity(scale(iw, h, ih), h);
    }
    if rh == 0 {
        let w = if up { rw } else { rw.min(iw) };
        return ResizePlan::identity(w, scale(ih, w, iw));
    }

    if size.crop {
        // Compare iw/ih with rw/rh by cross-multiplying.
        let src = u64::from(iw) * u64::from(rh);
        let dst = u64::from(ih) * u64::from(rw);
        let crop = if src == dst {
            None
        } else if src > dst {
            // Source is wider: trim left and right.
            let cw = scale(ih, rw, rh).min(iw);
            Some(CropRect {
                x: (iw - cw) / 2,
                y: 0,
                width: cw,
                height: ih,
            })
        } else {
            // Source is taller: trim top and bottom.
            let ch = scale(iw, rh, rw).min(ih);
            Some(CropRect {
                x: 0,
                y: (ih - ch) / 2,
                width: iw,
                height: ch,
            })
        };

        let (cw, ch) = crop.map_or((iw, ih), |c| (c.width, c.height));
        if !up && (rw > cw || rh > ch) {
            return ResizePlan {
                crop,
                width: cw,
                height: ch,
            };
        }
        return ResizePlan {
            crop,
            width: rw,
            height: rh,
        };
    }

    // Fit inside the box.
    let width_limited = u64::from(rw) * u64::from(ih) <= u64::from(rh) * u64::from(iw);
    let (w, h) = if width_limited {
        (rw, scale(ih, rw, iw))
    } else {
        (scale(iw, rh, ih), rh)
    };
    if !up && (w > iw || h > ih) {
        return ResizePlan::identity(iw, ih);
    }
    ResizePlan::identity(w, h)
}

/// Apply a plan with Lanczos resampling.
pub fn apply_plan(img: DynamicImage, plan: &ResizePlan) -> DynamicImage {
    let (iw, ih) = img.dimensions();
    if plan.is_noop(iw, ih) {
        return img;
    }
    let cropped = match plan.crop {
        Some(c) => img.crop_imm(c.x, c.y, c.width, c.height),
        None => img,
    };
    if cropped.dimensions() == (plan.width, plan.height) {
        return cropped;
    }
    cropped.resize_exact(plan.width, plan.height, FilterType::Lanczos3)
}

/// Resize `img` to `size`.
pub fn resize(img: DynamicImage, size: &ImageSize) -> DynamicImage {
    let plan = plan_resize(img.width(), img.height(), size);
    apply_plan(img, &plan)
}

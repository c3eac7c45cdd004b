/// Element types that can live in a module stack or an assembled canvas.
///
/// `FILL` marks canvas pixels that no module covers.
pub trait Pixel: Copy + Send + Sync + 'static {
    const FILL: Self;

    fn is_fill(&self) -> bool;
}

impl Pixel for f32 {
    const FILL: Self = f32::NAN;

    fn is_fill(&self) -> bool {
        self.is_nan()
    }
}

impl Pixel for f64 {
    const FILL: Self = f64::NAN;

    fn is_fill(&self) -> bool {
        self.is_nan()
    }
}

/// Raw detector counts never reach the top of the 16-bit range.
impl Pixel for u16 {
    const FILL: Self = u16::MAX;

    fn is_fill(&self) -> bool {
        *self == u16::MAX
    }
}

impl Pixel for i32 {
    const FILL: Self = i32::MIN;

    fn is_fill(&self) -> bool {
        *self == i32::MIN
    }
}

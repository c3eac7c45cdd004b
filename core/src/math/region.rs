use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Axis-aligned rectangle in image pixels: `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid rectangle {input:?}: expected \"(x, y, w, h)\"")]
pub struct ParseRectError {
    input: String,
}

impl Rect {
    pub fn new(x: i64, y: i64, w: i64, h: i64) -> Self {
        Self { x, y, w, h }
    }

    /// Row and column ranges of the part of the rectangle inside an image of
    /// `shape` (rows, cols), or `None` if they do not intersect.
    pub fn clip(&self, shape: (usize, usize)) -> Option<(Range<usize>, Range<usize>)> {
        let clamp = |v: i64, max: usize| v.clamp(0, max as i64) as usize;
        let rows = clamp(self.y, shape.0)..clamp(self.y.saturating_add(self.h), shape.0);
        let cols = clamp(self.x, shape.1)..clamp(self.x.saturating_add(self.w), shape.1);
        if rows.is_empty() || cols.is_empty() {
            None
        } else {
            Some((rows, cols))
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x, self.y, self.w, self.h)
    }
}

impl FromStr for Rect {
    type Err = ParseRectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRectError {
            input: s.to_string(),
        };
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(err)?;
        let values = inner
            .split(',')
            .map(|v| v.trim().parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| err())?;
        match values.as_slice() {
            &[x, y, w, h] if w >= 0 && h >= 0 => Ok(Rect::new(x, y, w, h)),
            _ => Err(err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tuple_text() {
        assert_eq!("(10, 10, 5, 5)".parse::<Rect>().unwrap(), Rect::new(10, 10, 5, 5));
        assert_eq!("(-1,2,3,4)".parse::<Rect>().unwrap(), Rect::new(-1, 2, 3, 4));
        assert!("10, 10, 5, 5".parse::<Rect>().is_err());
        assert!("(1, 2, 3)".parse::<Rect>().is_err());
        assert!("(1, 2, -3, 4)".parse::<Rect>().is_err());
    }

    #[test]
    fn display_matches_parse() {
        let rect = Rect::new(3, 4, 5, 6);
        assert_eq!(rect.to_string().parse::<Rect>().unwrap(), rect);
    }

    #[test]
    fn clips_to_image() {
        let rect = Rect::new(-2, 8, 5, 5);
        assert_eq!(rect.clip((10, 10)), Some((8..10, 0..3)));
        assert_eq!(Rect::new(20, 0, 5, 5).clip((10, 10)), None);
    }
}

use std::fmt;
use std::str::FromStr;

use crate::error::SpiderError;

/// Display colormap for an image row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Colormap {
    #[default]
    Gray,
    Hot,
    Jet,
}

impl Colormap {
    pub fn is_gray(self) -> bool {
        matches!(self, Colormap::Gray)
    }

    /// Maps a normalized intensity in `[0, 1]` to RGB.
    pub fn rgb(self, t: f32) -> [u8; 3] {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let (r, g, b) = match self {
            Colormap::Gray => (t, t, t),
            Colormap::Hot => (
                unit(8.0 / 3.0 * t),
                unit(8.0 / 3.0 * t - 1.0),
                unit(4.0 * t - 3.0),
            ),
            Colormap::Jet => (
                unit(1.5 - (4.0 * t - 3.0).abs()),
                unit(1.5 - (4.0 * t - 2.0).abs()),
                unit(1.5 - (4.0 * t - 1.0).abs()),
            ),
        };
        [to_byte(r), to_byte(g), to_byte(b)]
    }

    pub fn gray(t: f32) -> u8 {
        to_byte(if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) })
    }
}

fn unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

fn to_byte(value: f32) -> u8 {
    (value * 255.0).round() as u8
}

impl fmt::Display for Colormap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Colormap::Gray => "gray",
            Colormap::Hot => "hot",
            Colormap::Jet => "jet",
        };
        f.write_str(name)
    }
}

impl FromStr for Colormap {
    type Err = SpiderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gray" | "grey" => Ok(Colormap::Gray),
            "hot" => Ok(Colormap::Hot),
            "jet" => Ok(Colormap::Jet),
            other => Err(SpiderError::Report(format!("unknown colormap '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints() {
        assert_eq!(Colormap::Gray.rgb(0.0), [0, 0, 0]);
        assert_eq!(Colormap::Gray.rgb(1.0), [255, 255, 255]);
        assert_eq!(Colormap::Hot.rgb(0.0), [0, 0, 0]);
        assert_eq!(Colormap::Hot.rgb(1.0), [255, 255, 255]);
        assert_eq!(Colormap::Jet.rgb(0.5), [128, 255, 128]);
        assert_eq!(Colormap::gray(f32::NAN), 0);
    }

    #[test]
    fn parse_names() {
        assert_eq!("hot".parse::<Colormap>().unwrap(), Colormap::Hot);
        assert_eq!("Grey".parse::<Colormap>().unwrap(), Colormap::Gray);
        assert!("viridis".parse::<Colormap>().is_err());
    }
}

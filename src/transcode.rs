use crate::lan_api::DeviceColor;
use strum_macros::{Display, EnumString};

// Conversions between the hub's normalized value domains and the
// vendor's native encodings. All of these are total over their
// documented domains and saturate at the edges rather than erroring:
// the hub rejects out-of-domain capability values outright, so a
// slightly-out-of-range vendor reading must be clamped here.

/// Which of the two mutually exclusive light modes a state snapshot
/// represents. Derived fresh from the raw values on every refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LightMode {
    Color,
    Temperature,
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        return 0.;
    }
    v.clamp(0., 1.)
}

/// hub dim 0..1 -> vendor brightness 0..100
pub fn dim_to_vendor(dim: f64) -> u8 {
    (clamp01(dim) * 100.).round() as u8
}

/// vendor brightness -> hub dim 0..1.
/// Some firmware reports brightness on a 0-255 scale despite the
/// documented 0-100 range; anything above 100 is interpreted as the
/// 255-scaled variant.
pub fn vendor_to_dim(raw: u32) -> f64 {
    if raw > 100 {
        clamp01(raw as f64 / 255.)
    } else {
        clamp01(raw as f64 / 100.)
    }
}

/// hub (hue 0..1, saturation 0..1, dim 0..1) -> packed 24-bit RGB int
pub fn hs_to_rgb_int(hue: f64, saturation: f64, dim: f64) -> u32 {
    let color = csscolorparser::Color::from_hsva(
        (clamp01(hue) * 360.) as f32,
        clamp01(saturation) as f32,
        clamp01(dim) as f32,
        1.,
    );
    let [r, g, b, _a] = color.to_rgba8();
    ((r as u32) << 16) | ((g as u32) << 8) | (b as u32)
}

/// packed 24-bit RGB int -> hub (hue 0..1, saturation 0..1)
pub fn rgb_int_to_hs(rgb: u32) -> (f64, f64) {
    let (r, g, b) = rgb_int_to_components(rgb);
    let color = csscolorparser::Color::from_rgba8(r, g, b, 255);
    let [h, s, _v, _a] = color.to_hsva();
    (clamp01(h as f64 / 360.), clamp01(s as f64))
}

pub fn rgb_int_to_components(rgb: u32) -> (u8, u8, u8) {
    (
        ((rgb >> 16) & 0xff) as u8,
        ((rgb >> 8) & 0xff) as u8,
        (rgb & 0xff) as u8,
    )
}

/// hub color-temperature fraction 0..1 -> kelvin within the device range.
/// 0 is the warm end of the hub slider, which maps to the top of the
/// kelvin range.
pub fn kelvin_from_percent(percent: f64, min: u32, max: u32) -> u32 {
    let percent = clamp01(percent);
    (max as f64 - (max as f64 - min as f64) * percent).round() as u32
}

/// kelvin -> hub color-temperature fraction, clamped to [0,1].
/// Measured values occasionally land outside the advertised range due
/// to vendor rounding.
pub fn percent_from_kelvin(kelvin: u32, min: u32, max: u32) -> f64 {
    if max <= min {
        return 0.;
    }
    clamp01((kelvin as f64 - min as f64) / (max as f64 - min as f64))
}

/// Decides whether a snapshot should be interpreted as color or as
/// color-temperature. Pure white and pure black RGB are reported by
/// some firmware while the device is genuinely in temperature mode,
/// so those are treated as temperature regardless of the kelvin field.
pub fn classify_light_mode(color: DeviceColor, kelvin: u32) -> LightMode {
    let degenerate = (color.r == 255 && color.g == 255 && color.b == 255)
        || (color.r == 0 && color.g == 0 && color.b == 0);
    if degenerate || kelvin != 0 {
        LightMode::Temperature
    } else {
        LightMode::Color
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dim_round_trip() {
        let mut v = 0.0f64;
        while v <= 1.0 {
            let there_and_back = vendor_to_dim(dim_to_vendor(v) as u32);
            assert!(
                (there_and_back - v).abs() < 0.005,
                "{v} -> {there_and_back}"
            );
            v += 0.01;
        }
    }

    #[test]
    fn dim_legacy_255_scale() {
        // raw 200 is on the undocumented 0-255 scale
        assert!((vendor_to_dim(200) - 200. / 255.).abs() < 1e-9);
        // raw 80 is on the documented 0-100 scale
        k9::assert_equal!(vendor_to_dim(80), 0.8);
        // out of range either way still lands in [0,1]
        k9::assert_equal!(vendor_to_dim(400), 1.0);
    }

    #[test]
    fn dim_saturates() {
        k9::assert_equal!(dim_to_vendor(1.5), 100);
        k9::assert_equal!(dim_to_vendor(-0.2), 0);
    }

    #[test]
    fn rgb_primaries() {
        k9::assert_equal!(hs_to_rgb_int(0., 1., 1.), 0xff0000);
        k9::assert_equal!(hs_to_rgb_int(1. / 3., 1., 1.), 0x00ff00);
        k9::assert_equal!(hs_to_rgb_int(2. / 3., 1., 1.), 0x0000ff);
    }

    #[test]
    fn hs_round_trip() {
        for (h, s) in [(0.1, 0.9), (0.25, 0.5), (0.5, 1.0), (0.75, 0.3), (0.9, 0.8)] {
            let (h2, s2) = rgb_int_to_hs(hs_to_rgb_int(h, s, 1.0));
            assert!((h2 - h).abs() < 0.01, "hue {h} -> {h2}");
            assert!((s2 - s).abs() < 0.01, "sat {s} -> {s2}");
        }
    }

    #[test]
    fn kelvin_percent() {
        // 4000K in a 2000-9000 range
        let p = percent_from_kelvin(4000, 2000, 9000);
        assert!((p - 0.2857).abs() < 0.001, "{p}");

        // outbound direction anchors 0 at the top of the range
        k9::assert_equal!(kelvin_from_percent(0., 2000, 9000), 9000);
        k9::assert_equal!(kelvin_from_percent(1., 2000, 9000), 2000);
    }

    #[test]
    fn kelvin_percent_clamps() {
        k9::assert_equal!(percent_from_kelvin(12000, 2000, 9000), 1.0);
        k9::assert_equal!(percent_from_kelvin(500, 2000, 9000), 0.0);
        // degenerate range must not divide by zero
        k9::assert_equal!(percent_from_kelvin(4000, 4000, 4000), 0.0);
    }

    #[test]
    fn light_mode_classification() {
        let white = DeviceColor {
            r: 255,
            g: 255,
            b: 255,
        };
        let black = DeviceColor { r: 0, g: 0, b: 0 };
        let red = DeviceColor { r: 255, g: 0, b: 0 };

        // degenerate rgb always reads as temperature mode
        k9::assert_equal!(classify_light_mode(white, 4000), LightMode::Temperature);
        k9::assert_equal!(classify_light_mode(black, 0), LightMode::Temperature);
        // a real color with no kelvin reading is color mode
        k9::assert_equal!(classify_light_mode(red, 0), LightMode::Color);
        // a nonzero kelvin wins over a leftover color value
        k9::assert_equal!(classify_light_mode(red, 3500), LightMode::Temperature);
    }

    #[test]
    fn light_mode_strings() {
        k9::assert_equal!(LightMode::Color.to_string(), "color");
        k9::assert_equal!(LightMode::Temperature.to_string(), "temperature");
    }
}

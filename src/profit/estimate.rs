//! Package weight and size guesses for listings that do not carry them.

use serde::Serialize;

/// Carrier divisor for volumetric weight, cm³ per kg.
const VOLUMETRIC_DIVISOR: f64 = 5000.0;

struct Profile {
    keywords: &'static [&'static str],
    base_g: u32,
    packaging_g: u32,
    dimensions_cm: [f64; 3],
}

// First match wins, so narrower keywords sit above broader ones.
const PROFILES: &[Profile] = &[
    Profile {
        keywords: &["trading card", "card game", "pokemon", "yu-gi-oh", "yugioh"],
        base_g: 100,
        packaging_g: 200,
        dimensions_cm: [20.0, 15.0, 5.0],
    },
    Profile {
        keywords: &["gundam", "gunpla"],
        base_g: 500,
        packaging_g: 800,
        dimensions_cm: [35.0, 25.0, 15.0],
    },
    Profile {
        keywords: &["model kit", "plastic model"],
        base_g: 600,
        packaging_g: 800,
        dimensions_cm: [40.0, 30.0, 15.0],
    },
    Profile {
        keywords: &["figure", "figma", "nendoroid"],
        base_g: 400,
        packaging_g: 600,
        dimensions_cm: [30.0, 20.0, 20.0],
    },
    Profile {
        keywords: &["senka"],
        base_g: 150,
        packaging_g: 300,
        dimensions_cm: [12.0, 8.0, 8.0],
    },
    Profile {
        keywords: &["shiseido", "cosmetic", "serum", "lotion"],
        base_g: 200,
        packaging_g: 400,
        dimensions_cm: [15.0, 10.0, 10.0],
    },
    Profile {
        keywords: &["japanese knife", "santoku", "gyuto"],
        base_g: 400,
        packaging_g: 600,
        dimensions_cm: [40.0, 12.0, 5.0],
    },
    Profile {
        keywords: &["knife"],
        base_g: 300,
        packaging_g: 500,
        dimensions_cm: [35.0, 10.0, 5.0],
    },
    Profile {
        keywords: &["hello kitty", "sanrio"],
        base_g: 200,
        packaging_g: 400,
        dimensions_cm: [25.0, 20.0, 15.0],
    },
];

const DEFAULT_PROFILE: Profile = Profile {
    keywords: &[],
    base_g: 500,
    packaging_g: 700,
    dimensions_cm: [30.0, 20.0, 15.0],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightBasis {
    Actual,
    Volumetric,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageEstimate {
    /// Matched keyword, `None` when the default profile was used.
    pub matched: Option<&'static str>,
    /// Packed weight: the listing's weight when known, else item plus packaging.
    pub actual_g: u32,
    /// Depth, width, height.
    pub dimensions_cm: [f64; 3],
    pub volumetric_g: u32,
    /// Whichever of actual and volumetric is larger; this is what carriers bill.
    pub applied_g: u32,
    pub basis: WeightBasis,
    /// True when `actual_g` came from the listing rather than the table.
    pub listed_weight: bool,
}

/// Guesses the shipped package for a listing. `text` is matched
/// case-insensitively against the keyword table (title and category are
/// usually joined). Pricier listings tend to be bigger sets, so the
/// listing price scales the profile.
pub fn estimate_package(text: &str, price: f64, listed_weight_g: Option<u32>) -> PackageEstimate {
    let haystack = text.to_lowercase().replace(['_', '-'], " ");
    let (profile, matched) = PROFILES
        .iter()
        .find_map(|profile| {
            profile
                .keywords
                .iter()
                .find(|keyword| haystack.contains(&keyword.replace('-', " ")))
                .map(|keyword| (profile, Some(*keyword)))
        })
        .unwrap_or((&DEFAULT_PROFILE, None));

    let (scale, extra_packaging_g) = price_tier(price);
    let dimensions_cm = profile
        .dimensions_cm
        .map(|side| (side * scale * 10.0).round() / 10.0);
    let packed_g = profile.base_g + profile.packaging_g + extra_packaging_g;
    let table_g = (f64::from(packed_g) * scale) as u32;
    let actual_g = listed_weight_g.filter(|w| *w > 0).unwrap_or(table_g);
    let volumetric_g = volumetric_grams(dimensions_cm);
    let (applied_g, basis) = if volumetric_g > actual_g {
        (volumetric_g, WeightBasis::Volumetric)
    } else {
        (actual_g, WeightBasis::Actual)
    };

    PackageEstimate {
        matched,
        actual_g,
        dimensions_cm,
        volumetric_g,
        applied_g,
        basis,
        listed_weight: listed_weight_g.is_some_and(|w| w > 0),
    }
}

/// Dimension multiplier and extra packaging grams for a listing price.
fn price_tier(price: f64) -> (f64, u32) {
    if price > 200.0 {
        (1.5, 1000)
    } else if price > 100.0 {
        (1.25, 500)
    } else if price > 50.0 {
        (1.0, 0)
    } else {
        (0.8, 0)
    }
}

pub fn volumetric_grams(dimensions_cm: [f64; 3]) -> u32 {
    let [depth, width, height] = dimensions_cm;
    (depth * width * height * 1000.0 / VOLUMETRIC_DIVISOR).floor() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gundam_titles_use_the_kit_profile() {
        let estimate = estimate_package("Bandai MG 1/100 RX-78-2 Gundam Ver 3.0", 80.0, None);
        assert_eq!(estimate.matched, Some("gundam"));
        assert_eq!(estimate.actual_g, 1300);
        assert_eq!(estimate.dimensions_cm, [35.0, 25.0, 15.0]);
        // 35 * 25 * 15 / 5000 kg
        assert_eq!(estimate.volumetric_g, 2625);
        assert_eq!(estimate.applied_g, 2625);
        assert_eq!(estimate.basis, WeightBasis::Volumetric);
    }

    #[test]
    fn unknown_items_fall_back_to_the_default_profile() {
        let estimate = estimate_package("Makita Cordless Drill", 60.0, None);
        assert_eq!(estimate.matched, None);
        assert_eq!(estimate.actual_g, 1200);
        assert_eq!(estimate.dimensions_cm, [30.0, 20.0, 15.0]);
        assert_eq!(estimate.volumetric_g, 1800);
        assert_eq!(estimate.applied_g, 1800);
    }

    #[test]
    fn heavy_listed_weight_beats_volumetric() {
        let estimate = estimate_package("Pokemon card booster box", 30.0, Some(900));
        assert_eq!(estimate.matched, Some("pokemon"));
        assert!(estimate.listed_weight);
        assert_eq!(estimate.dimensions_cm, [16.0, 12.0, 4.0]);
        assert_eq!(estimate.volumetric_g, 153);
        assert_eq!(estimate.applied_g, 900);
        assert_eq!(estimate.basis, WeightBasis::Actual);
    }

    #[test]
    fn narrower_keywords_win_over_broader_ones() {
        let estimate = estimate_package("Sakai Japanese Knife Gyuto 210mm", 150.0, None);
        assert_eq!(estimate.matched, Some("japanese knife"));
        assert_eq!(estimate.dimensions_cm, [50.0, 15.0, 6.3]);
        assert_eq!(estimate.actual_g, 1875);
        assert!(estimate.applied_g >= estimate.actual_g.max(estimate.volumetric_g));
    }

    #[test]
    fn zero_listed_weight_is_ignored() {
        let estimate = estimate_package("figure", 60.0, Some(0));
        assert!(!estimate.listed_weight);
        assert_eq!(estimate.actual_g, 1000);
    }
}

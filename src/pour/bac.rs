//! Blood-alcohol contribution math (§4.5). Pure functions, no I/O — kept
//! separate from the state machine so they're trivially unit-testable
//! against the worked examples in §8.

use crate::db::models::{Gender, Keg, User};

const OZ_TO_ML_ALCOHOL_CONST: f64 = 29.57 * 0.79;
const WIDMARK_R: f64 = 0.806;
/// Standard elimination rate, grams BAC per hour.
const DEFAULT_ELIMINATION_RATE: f64 = 0.02;

/// This pour's own contribution to BAC, ignoring whatever the user was
/// already carrying. Zero if `weight_lbs <= 0` (unknown weight) per §4.5.
pub fn instant_bac(user: &User, keg: &Keg, ticks: u32) -> f64 {
    if user.weight_lbs <= 0.0 {
        return 0.0;
    }

    let kg_weight = user.weight_lbs / 2.2046;
    let water_frac = match user.gender {
        Gender::Male => 0.58,
        Gender::Female => 0.49,
    };
    let body_water_ml = kg_weight * water_frac * 1000.0;
    let grams_pct = (OZ_TO_ML_ALCOHOL_CONST / body_water_ml) * WIDMARK_R * 100.0;

    let ounces = keg.drink_ounces(ticks);
    let alc_oz = ounces * (keg.alcohol_content_percent / 100.0);
    alc_oz * grams_pct
}

/// Decay a prior BAC forward by `seconds_ago` at elimination rate `r`
/// (grams/hour). Never negative; monotone non-increasing in `seconds_ago`.
pub fn decompose_bac(prior_bac: f64, seconds_ago: f64, r: f64) -> f64 {
    (prior_bac - r * seconds_ago / 3600.0).max(0.0)
}

pub fn decompose_bac_default(prior_bac: f64, seconds_ago: f64) -> f64 {
    decompose_bac(prior_bac, seconds_ago, DEFAULT_ELIMINATION_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(weight_lbs: f64, gender: Gender) -> User {
        User {
            id: 1,
            name: "t".into(),
            weight_lbs,
            gender,
        }
    }

    fn keg(ticks_per_ounce: f64, alc_pct: f64) -> Keg {
        Keg {
            id: 1,
            alcohol_content_percent: alc_pct,
            ticks_per_ounce,
            is_current: true,
        }
    }

    #[test]
    fn zero_weight_yields_zero_contribution() {
        let u = user(0.0, Gender::Male);
        let k = keg(100.0, 5.0);
        assert_eq!(instant_bac(&u, &k, 1200), 0.0);
    }

    #[test]
    fn negative_weight_yields_zero_contribution() {
        let u = user(-10.0, Gender::Male);
        let k = keg(100.0, 5.0);
        assert_eq!(instant_bac(&u, &k, 1200), 0.0);
    }

    #[test]
    fn positive_weight_yields_positive_contribution() {
        let u = user(180.0, Gender::Male);
        let k = keg(100.0, 5.0);
        let bac = instant_bac(&u, &k, 1200);
        assert!(bac > 0.0);
    }

    #[test]
    fn female_water_fraction_yields_higher_bac_than_male_same_weight() {
        let k = keg(100.0, 5.0);
        let male_bac = instant_bac(&user(160.0, Gender::Male), &k, 1200);
        let female_bac = instant_bac(&user(160.0, Gender::Female), &k, 1200);
        assert!(female_bac > male_bac);
    }

    #[test]
    fn decompose_zero_elapsed_is_identity() {
        assert_eq!(decompose_bac_default(0.05, 0.0), 0.05);
    }

    #[test]
    fn decompose_is_never_negative() {
        assert_eq!(decompose_bac_default(0.01, 100_000.0), 0.0);
    }

    #[test]
    fn decompose_is_monotone_non_increasing() {
        let a = decompose_bac_default(0.08, 1000.0);
        let b = decompose_bac_default(0.08, 2000.0);
        assert!(b <= a);
    }
}

//! Coarse geographic cells
//!
//! Cells are hierarchical strings: `*` (global), `PE` (country), `PE:LIM` (region)
//! and `PE:LIM:-12.0,-77.0` (city grid at 0.1 degree). Precise coordinates never
//! appear in a cell.

use crate::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resolution of a geographic cell, coarsest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoResolution {
    /// Whole world
    Global,
    /// ISO country code
    Country,
    /// Country subdivision
    Region,
    /// 0.1 degree grid square
    City,
}

/// A validated coarse location
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GeoCell(String);

impl GeoCell {
    /// The global cell
    pub fn global() -> Self {
        Self("*".to_string())
    }

    /// Country cell from a two-letter code
    pub fn country(code: &str) -> Result<Self> {
        Self::parse(&code.to_ascii_uppercase())
    }

    /// Region cell
    pub fn region(country: &str, region: &str) -> Result<Self> {
        Self::parse(&format!(
            "{}:{}",
            country.to_ascii_uppercase(),
            region.to_ascii_uppercase()
        ))
    }

    /// City grid cell. Coordinates are rounded to one decimal place.
    pub fn city(country: &str, region: &str, lat: f64, lon: f64) -> Result<Self> {
        if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
            return Err(NodeError::validation("coordinates out of range"));
        }
        let round = |v: f64| (v * 10.0).round() / 10.0;
        Self::parse(&format!(
            "{}:{}:{:.1},{:.1}",
            country.to_ascii_uppercase(),
            region.to_ascii_uppercase(),
            round(lat),
            round(lon)
        ))
    }

    /// Parse and validate a cell string
    pub fn parse(s: &str) -> Result<Self> {
        if s == "*" {
            return Ok(Self::global());
        }
        let parts: Vec<&str> = s.split(':').collect();
        let code_ok = |p: &str, min: usize, max: usize| {
            (min..=max).contains(&p.len())
                && p.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        };
        let valid = match parts.as_slice() {
            [country] => code_ok(country, 2, 2),
            [country, region] => code_ok(country, 2, 2) && code_ok(region, 1, 8),
            [country, region, grid] => {
                code_ok(country, 2, 2) && code_ok(region, 1, 8) && is_coarse_grid(grid)
            }
            _ => false,
        };
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(NodeError::validation(format!("invalid geo cell: {s}")))
        }
    }

    /// Resolution of the cell
    pub fn resolution(&self) -> GeoResolution {
        if self.0 == "*" {
            return GeoResolution::Global;
        }
        match self.0.matches(':').count() {
            0 => GeoResolution::Country,
            1 => GeoResolution::Region,
            _ => GeoResolution::City,
        }
    }

    /// Coarsen to the given resolution (no-op when already coarser)
    pub fn coarsen(&self, to: GeoResolution) -> Self {
        if to >= self.resolution() {
            return self.clone();
        }
        match to {
            GeoResolution::Global => Self::global(),
            _ => {
                let keep = to as usize;
                let joined = self.0.split(':').take(keep).collect::<Vec<_>>().join(":");
                Self(joined)
            }
        }
    }

    /// Whether `self` lies inside `area` (local containment, no network lookup)
    pub fn within(&self, area: &GeoCell) -> bool {
        if area.0 == "*" {
            return true;
        }
        self.0 == area.0 || self.0.starts_with(&format!("{}:", area.0))
    }

    /// Cell as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `lat,lon` with at most one decimal place each
pub fn is_coarse_grid(grid: &str) -> bool {
    let Some((lat, lon)) = grid.split_once(',') else {
        return false;
    };
    [lat, lon].iter().all(|v| {
        let digits = v.strip_prefix('-').unwrap_or(v);
        let (int, frac) = digits.split_once('.').unwrap_or((digits, ""));
        !int.is_empty()
            && int.len() <= 3
            && int.chars().all(|c| c.is_ascii_digit())
            && frac.len() <= 1
            && frac.chars().all(|c| c.is_ascii_digit())
    })
}

/// Whether a string carries coordinates finer than the city grid
/// (two or more decimals in a numeric token).
pub fn has_precise_coordinates(s: &str) -> bool {
    s.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter_map(|token| token.split_once('.'))
        .any(|(int, frac)| {
            !int.is_empty() && frac.len() >= 2 && frac.chars().all(|c| c.is_ascii_digit())
        })
}

impl fmt::Display for GeoCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for GeoCell {
    type Error = NodeError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<GeoCell> for String {
    fn from(value: GeoCell) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_city_rounding() {
        let cell = GeoCell::city("pe", "lim", -12.0464, -77.0428).unwrap();
        assert_eq!(cell.as_str(), "PE:LIM:-12.0,-77.0");
        assert_eq!(cell.resolution(), GeoResolution::City);
    }

    #[test]
    fn test_coarsen_ladder() {
        let cell = GeoCell::city("PE", "LIM", -12.04, -77.04).unwrap();
        assert_eq!(cell.coarsen(GeoResolution::Region).as_str(), "PE:LIM");
        assert_eq!(cell.coarsen(GeoResolution::Country).as_str(), "PE");
        assert_eq!(cell.coarsen(GeoResolution::Global).as_str(), "*");
        let country = GeoCell::country("PE").unwrap();
        assert_eq!(country.coarsen(GeoResolution::City), country);
    }

    #[test]
    fn test_containment() {
        let cell = GeoCell::city("PE", "LIM", -12.04, -77.04).unwrap();
        assert!(cell.within(&GeoCell::country("PE").unwrap()));
        assert!(cell.within(&GeoCell::region("PE", "LIM").unwrap()));
        assert!(!cell.within(&GeoCell::region("PE", "CUS").unwrap()));
        assert!(cell.within(&GeoCell::global()));
        // "PE" must not match a hypothetical "PER" region prefix
        assert!(!GeoCell::region("PE", "LIMA").unwrap().within(&GeoCell::parse("PE:LIM").unwrap()));
    }

    #[test]
    fn test_precise_coordinates_rejected() {
        assert!(GeoCell::parse("PE:LIM:-12.04,-77.04").is_err());
        assert!(has_precise_coordinates("-12.0464"));
        assert!(!has_precise_coordinates("PE:LIM:-12.0,-77.0"));
        assert!(!has_precise_coordinates("2026-03-02"));
    }
}

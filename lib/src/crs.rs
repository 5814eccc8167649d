// Copyright 2024 The Meridian Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Coordinate reference system identification.
//!
//! Full CRS parsing and reprojection belong to an external geodesy library;
//! this module only extracts the stable identity of a CRS from its WKT
//! (authority name and code, or a derived numeric code for custom CRSs) and
//! normalises WKT for storage.

use blake2::Blake2b512;
use digest::Digest as _;
use once_cell::sync::Lazy;
use regex::Regex;

/// Matches the name string at the root of a WKT definition, e.g.
/// `PROJCS["NZGD2000 / New Zealand Transverse Mercator 2000", ...`.
static ROOT_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*[A-Z_]*\s*[\[(]\s*"((?:""|[^"])*)""#).unwrap()
});

/// Matches the trailing root-level AUTHORITY clause, e.g.
/// `AUTHORITY["EPSG","2193"]]` at the end of the definition.
static ROOT_AUTHORITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)AUTHORITY\s*[\[(]\s*"((?:""|[^"])*)"\s*,\s*"((?:""|[^"])*)"\s*[\])]\s*[\])]\s*$"#)
        .unwrap()
});

/// Returns the human-readable name at the root of a WKT definition.
pub fn parse_name(wkt: &str) -> Option<String> {
    ROOT_NAME_PATTERN
        .captures(wkt)
        .map(|c| c[1].replace("\"\"", "\""))
}

/// Returns the `(authority, code)` pair of the root-level AUTHORITY clause.
pub fn parse_authority(wkt: &str) -> Option<(String, String)> {
    ROOT_AUTHORITY_PATTERN
        .captures(wkt)
        .map(|c| (c[1].to_string(), c[2].to_string()))
}

/// Given a CRS definition, generates a stable, unique identifier for it of
/// type string, e.g. `"EPSG:2193"`.
pub fn get_identifier_str(wkt: &str) -> String {
    if let Some((auth_name, auth_code)) = parse_authority(wkt) {
        if !auth_name.is_empty() && !auth_code.is_empty() {
            return format!("{auth_name}:{auth_code}");
        }
        let code = if auth_name.is_empty() {
            auth_code
        } else {
            auth_name
        };
        let trimmed = code.trim();
        if !trimmed.is_empty() && trimmed != "0" && trimmed != "EPSG" {
            return code;
        }
    }
    format!("CUSTOM:{}", get_identifier_int(wkt))
}

/// Given a CRS definition, generates a stable, unique identifier for it of
/// type integer, e.g. `2193`.
pub fn get_identifier_int(wkt: &str) -> i32 {
    if let Some((_, auth_code)) = parse_authority(wkt) {
        if let Ok(code) = auth_code.parse::<i32>() {
            if code > 0 {
                return code;
            }
        }
    }
    // Stable code that fits easily in an int32 and won't collide with EPSG
    // codes.
    let digest = Blake2b512::digest(wkt.trim().as_bytes());
    let h = u32::from_be_bytes(digest[..4].try_into().unwrap());
    ((h & 0x0FFF_FFFF) + 1_000_000) as i32
}

/// Normalises a WKT definition for storage: whitespace outside quoted strings
/// is removed so that cosmetically different definitions compare equal.
pub fn normalise_wkt(wkt: &str) -> String {
    let mut out = String::with_capacity(wkt.len());
    let mut in_quotes = false;
    let mut chars = wkt.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            out.push(c);
            if c == '"' {
                // An escaped quote inside a string is a doubled quote.
                if chars.peek() == Some(&'"') {
                    out.push(chars.next().unwrap());
                } else {
                    in_quotes = false;
                }
            }
        } else if c == '"' {
            in_quotes = true;
            out.push(c);
        } else if !c.is_whitespace() {
            out.push(c);
        }
    }
    out
}

/// The filename under `meta/crs/` for a CRS identifier.
pub fn wkt_meta_item_name(identifier: &str) -> String {
    format!("crs/{identifier}.wkt")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NZTM_WKT: &str = r#"PROJCS["NZGD2000 / New Zealand Transverse Mercator 2000",
        GEOGCS["NZGD2000", DATUM["New_Zealand_Geodetic_Datum_2000",
        SPHEROID["GRS 1980",6378137,298.257222101, AUTHORITY["EPSG","7019"]],
        AUTHORITY["EPSG","6167"]], AUTHORITY["EPSG","4167"]],
        UNIT["metre",1], AUTHORITY["EPSG","2193"]]"#;

    #[test]
    fn test_parse_name() {
        assert_eq!(
            parse_name(NZTM_WKT).as_deref(),
            Some("NZGD2000 / New Zealand Transverse Mercator 2000")
        );
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority(NZTM_WKT),
            Some(("EPSG".to_string(), "2193".to_string()))
        );
        // Only the root-level clause counts; a definition without a trailing
        // AUTHORITY yields None.
        assert_eq!(parse_authority(r#"PROJCS["foo",UNIT["metre",1]]"#), None);
    }

    #[test]
    fn test_get_identifier() {
        assert_eq!(get_identifier_str(NZTM_WKT), "EPSG:2193");
        assert_eq!(get_identifier_int(NZTM_WKT), 2193);
    }

    #[test]
    fn test_custom_identifier_is_stable() {
        let wkt = r#"PROJCS["bespoke",UNIT["metre",1]]"#;
        let id1 = get_identifier_int(wkt);
        let id2 = get_identifier_int(&format!("  {wkt}  "));
        assert_eq!(id1, id2);
        assert!(id1 >= 1_000_000);
        assert!(get_identifier_str(wkt).starts_with("CUSTOM:"));
    }

    #[test]
    fn test_normalise_wkt() {
        assert_eq!(
            normalise_wkt("PROJCS[ \"a b\" ,\n  UNIT[\"m\", 1]]"),
            "PROJCS[\"a b\",UNIT[\"m\",1]]"
        );
    }
}

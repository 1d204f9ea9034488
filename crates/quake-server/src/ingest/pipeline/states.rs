//! US state lookup used to split a place description into state and country

use std::collections::HashMap;
use std::sync::LazyLock;

/// Country code assigned when the trailing place segment names a US state.
pub const US_COUNTRY_CODE: &str = "US";

/// Two-letter code followed by the abbreviations and names that map to it
const STATE_ALIASES: &[(&str, &[&str])] = &[
    ("AL", &["ALA", "ALABAMA"]),
    ("AK", &["ALK", "ALASKA"]),
    ("AZ", &["ARIZ", "ARIZONA"]),
    ("AR", &["ARK", "ARKANSAS"]),
    ("CA", &["CAL", "CALIF", "CALIFORNIA"]),
    ("CO", &["COL", "COLO", "COLORADO"]),
    ("CT", &["CONN", "CONNECTICUT"]),
    ("DE", &["DEL", "DELAWARE"]),
    ("FL", &["FLA", "FLORIDA"]),
    ("GA", &["GEORGIA"]),
    ("HI", &["HAW", "HAWAII"]),
    ("ID", &["IDA", "IDAHO"]),
    ("IL", &["ILL", "ILLINOIS"]),
    ("IN", &["IND", "INDIANA"]),
    ("IA", &["IOWA"]),
    ("KS", &["KAN", "KANSAS"]),
    ("KY", &["KEN", "KENTUCKY"]),
    ("LA", &["LOUISIANA"]),
    ("ME", &["MAINE"]),
    ("MD", &["MARYLAND"]),
    ("MA", &["MASS", "MASSACHUSETTS"]),
    ("MI", &["MICH", "MICHIGAN"]),
    ("MN", &["MINN", "MINNESOTA"]),
    ("MS", &["MISS", "MISSISSIPPI"]),
    ("MO", &["MISSOURI"]),
    ("MT", &["MONT", "MONTANA"]),
    ("NE", &["NEB", "NEBRASKA"]),
    ("NV", &["NEV", "NEVADA"]),
    ("NH", &["NEWHAMPSHIRE", "NEW HAMPSHIRE"]),
    ("NJ", &["NEWJERSEY", "NEW JERSEY"]),
    ("NM", &["NEWMEXICO", "NEW MEXICO"]),
    ("NY", &["NEWYORK", "NEW YORK"]),
    ("NC", &["NORTHCAROLINA", "NORTH CAROLINA"]),
    ("ND", &["NORTHDAKOTA", "NORTH DAKOTA"]),
    ("OH", &["OHIO"]),
    ("OK", &["OKLA", "OKLAHOMA"]),
    ("OR", &["ORE", "OREGON"]),
    ("PA", &["PENN", "PENNSYLVANIA"]),
    ("RI", &["RHODEISLAND", "RHODE ISLAND"]),
    ("SC", &["SOUTHCAROLINA", "SOUTH CAROLINA"]),
    ("SD", &["SOUTHDAKOTA", "SOUTH DAKOTA"]),
    ("TN", &["TENN", "TENNESSEE"]),
    ("TX", &["TEX", "TEXAS"]),
    ("UT", &["UTAH"]),
    ("VT", &["VERMONT"]),
    ("VA", &["VIRGINIA"]),
    ("WA", &["WASH", "WASHINGTON"]),
    ("WV", &["WESTVIRGINIA", "WEST VIRGINIA"]),
    ("WI", &["WIS", "WISC", "WISCONSIN"]),
    ("WY", &["WYO", "WYOMING"]),
];

static STATES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (code, aliases) in STATE_ALIASES {
        map.insert(*code, *code);
        for alias in *aliases {
            map.insert(*alias, *code);
        }
    }
    map
});

/// Two-letter code for a state abbreviation or name, ignoring case
pub fn state_code(name: &str) -> Option<&'static str> {
    STATES.get(name.trim().to_uppercase().as_str()).copied()
}

/// Split a place into `(state, country)` using its last comma-separated segment
///
/// "9km NE of Aguanga, CA" gives `(Some("CA"), "US")`; "Tonga" gives
/// `(None, "Tonga")`.
pub fn locate(place: &str) -> (Option<String>, String) {
    let segment = place.rsplit(',').next().unwrap_or(place).trim();

    match state_code(segment) {
        Some(code) => (Some(code.to_string()), US_COUNTRY_CODE.to_string()),
        None => (None, segment.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_code_variants() {
        assert_eq!(state_code("CA"), Some("CA"));
        assert_eq!(state_code("calif"), Some("CA"));
        assert_eq!(state_code(" California "), Some("CA"));
        assert_eq!(state_code("New York"), Some("NY"));
        assert_eq!(state_code("NEWYORK"), Some("NY"));
        assert_eq!(state_code("Wisc"), Some("WI"));
        assert_eq!(state_code("Ontario"), None);
    }

    #[test]
    fn test_every_code_maps_to_itself() {
        assert_eq!(STATE_ALIASES.len(), 50);
        for (code, _) in STATE_ALIASES {
            assert_eq!(state_code(code), Some(*code));
        }
    }

    #[test]
    fn test_locate() {
        assert_eq!(locate("9km NE of Aguanga, CA"), (Some("CA".into()), "US".into()));
        assert_eq!(locate("10 km S of Anchorage, Alaska"), (Some("AK".into()), "US".into()));
        assert_eq!(locate("South of the Fiji Islands"), (None, "South of the Fiji Islands".into()));
        assert_eq!(locate("45 km W of Lima, Peru"), (None, "Peru".into()));
        assert_eq!(locate("Mid-Atlantic Ridge, "), (None, "".into()));
    }
}

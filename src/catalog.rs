//! Declarative endpoint catalog for the SYR Trio / Safetec device family.
//!
//! Everything the fetch and normalize layers know about an endpoint lives in
//! this table: command key, unit, decode rule, required flag and refresh
//! group. Supporting a new device variant means editing table rows, not
//! branching code.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Refresh group an endpoint belongs to. Fast keys are fetched every cycle,
/// slow keys describe rarely-changing device metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshGroup {
    Fast,
    Slow,
}

/// How a raw payload value maps to a typed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeKind {
    /// `value = raw / divisor`, rounded to `precision` decimals.
    Scaled { divisor: f64, precision: u32 },
    /// Raw code resolved through one of the code dictionaries.
    Lookup(CodeDictionary),
    /// Pass-through string (trimmed).
    Text,
}

/// Which immutable code dictionary a lookup endpoint consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeDictionary {
    ValveState,
    WifiState,
    AlarmCode,
}

/// One row of the endpoint table. Immutable after load.
#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor {
    /// Short key used throughout the crate and in snapshots, e.g. `vol`.
    pub key: &'static str,
    /// Command key as it appears in device payloads, e.g. `getVOL`.
    pub command: &'static str,
    /// URL path group for per-key requests: `/{api_group}/get/{key}`.
    pub api_group: &'static str,
    /// Canonical unit symbol, empty for unitless endpoints.
    pub unit: &'static str,
    pub decode: DecodeKind,
    /// Required keys are fallback-fetched when missing and miss-counted.
    pub required: bool,
    pub group: RefreshGroup,
}

/// URL path group shared by the Trio command set.
pub const API_GROUP: &str = "trio";

/// Full endpoint set of the Trio firmware. Ordering matches snapshot output.
static ENDPOINTS: &[EndpointDescriptor] = &[
    EndpointDescriptor {
        key: "vol",
        command: "getVOL",
        api_group: API_GROUP,
        unit: "L",
        decode: DecodeKind::Scaled { divisor: 1.0, precision: 0 },
        required: true,
        group: RefreshGroup::Fast,
    },
    EndpointDescriptor {
        key: "flo",
        command: "getFLO",
        api_group: API_GROUP,
        unit: "L/h",
        decode: DecodeKind::Scaled { divisor: 1.0, precision: 0 },
        required: true,
        group: RefreshGroup::Fast,
    },
    EndpointDescriptor {
        key: "bar",
        command: "getBAR",
        api_group: API_GROUP,
        unit: "bar",
        decode: DecodeKind::Scaled { divisor: 1000.0, precision: 3 },
        required: true,
        group: RefreshGroup::Fast,
    },
    EndpointDescriptor {
        key: "cel",
        command: "getCEL",
        api_group: API_GROUP,
        unit: "°C",
        decode: DecodeKind::Scaled { divisor: 10.0, precision: 1 },
        required: true,
        group: RefreshGroup::Fast,
    },
    EndpointDescriptor {
        key: "vlv",
        command: "getVLV",
        api_group: API_GROUP,
        unit: "",
        decode: DecodeKind::Lookup(CodeDictionary::ValveState),
        required: true,
        group: RefreshGroup::Fast,
    },
    EndpointDescriptor {
        key: "ltv",
        command: "getLTV",
        api_group: API_GROUP,
        unit: "L",
        decode: DecodeKind::Scaled { divisor: 1.0, precision: 0 },
        required: false,
        group: RefreshGroup::Fast,
    },
    EndpointDescriptor {
        key: "avo",
        command: "getAVO",
        api_group: API_GROUP,
        unit: "L",
        decode: DecodeKind::Scaled { divisor: 1000.0, precision: 3 },
        required: false,
        group: RefreshGroup::Fast,
    },
    EndpointDescriptor {
        key: "cnd",
        command: "getCND",
        api_group: API_GROUP,
        unit: "µS/cm",
        decode: DecodeKind::Scaled { divisor: 1.0, precision: 0 },
        required: false,
        group: RefreshGroup::Slow,
    },
    EndpointDescriptor {
        key: "bat",
        command: "getBAT",
        api_group: API_GROUP,
        unit: "V",
        decode: DecodeKind::Scaled { divisor: 10.0, precision: 2 },
        required: false,
        group: RefreshGroup::Slow,
    },
    EndpointDescriptor {
        key: "net",
        command: "getNET",
        api_group: API_GROUP,
        unit: "V",
        decode: DecodeKind::Scaled { divisor: 10.0, precision: 2 },
        required: false,
        group: RefreshGroup::Slow,
    },
    EndpointDescriptor {
        key: "ala",
        command: "getALA",
        api_group: API_GROUP,
        unit: "",
        decode: DecodeKind::Lookup(CodeDictionary::AlarmCode),
        required: false,
        group: RefreshGroup::Slow,
    },
    EndpointDescriptor {
        key: "wfs",
        command: "getWFS",
        api_group: API_GROUP,
        unit: "",
        decode: DecodeKind::Lookup(CodeDictionary::WifiState),
        required: false,
        group: RefreshGroup::Slow,
    },
    EndpointDescriptor {
        key: "wfr",
        command: "getWFR",
        api_group: API_GROUP,
        unit: "%",
        decode: DecodeKind::Scaled { divisor: 1.0, precision: 0 },
        required: false,
        group: RefreshGroup::Slow,
    },
    EndpointDescriptor {
        key: "wip",
        command: "getWIP",
        api_group: API_GROUP,
        unit: "",
        decode: DecodeKind::Text,
        required: false,
        group: RefreshGroup::Slow,
    },
    EndpointDescriptor {
        key: "wgw",
        command: "getWGW",
        api_group: API_GROUP,
        unit: "",
        decode: DecodeKind::Text,
        required: false,
        group: RefreshGroup::Slow,
    },
    EndpointDescriptor {
        key: "ver",
        command: "getVER",
        api_group: API_GROUP,
        unit: "",
        decode: DecodeKind::Text,
        required: false,
        group: RefreshGroup::Slow,
    },
    EndpointDescriptor {
        key: "srn",
        command: "getSRN",
        api_group: API_GROUP,
        unit: "",
        decode: DecodeKind::Text,
        required: false,
        group: RefreshGroup::Slow,
    },
];

static BY_KEY: Lazy<HashMap<&'static str, &'static EndpointDescriptor>> =
    Lazy::new(|| ENDPOINTS.iter().map(|d| (d.key, d)).collect());

static BY_COMMAND: Lazy<HashMap<&'static str, &'static EndpointDescriptor>> =
    Lazy::new(|| ENDPOINTS.iter().map(|d| (d.command, d)).collect());

/// All endpoints in canonical order.
pub fn all() -> &'static [EndpointDescriptor] {
    ENDPOINTS
}

/// Look up a descriptor by its short key (`vol`, `bar`, ...).
pub fn describe(key: &str) -> Option<&'static EndpointDescriptor> {
    BY_KEY.get(key).copied()
}

/// Look up a descriptor by its payload command key (`getVOL`, ...).
pub fn describe_command(command: &str) -> Option<&'static EndpointDescriptor> {
    BY_COMMAND.get(command).copied()
}

/// Short keys of every catalog entry, in canonical order.
pub fn all_keys() -> impl Iterator<Item = &'static str> {
    ENDPOINTS.iter().map(|d| d.key)
}

/// Short keys belonging to the given refresh group.
pub fn keys_in_group(group: RefreshGroup) -> impl Iterator<Item = &'static str> {
    ENDPOINTS.iter().filter(move |d| d.group == group).map(|d| d.key)
}

/// Short keys of all required endpoints.
pub fn required_keys() -> impl Iterator<Item = &'static str> {
    ENDPOINTS.iter().filter(|d| d.required).map(|d| d.key)
}

// ---------------------------------------------------------------------------
// Code dictionaries
// ---------------------------------------------------------------------------

static VALVE_STATES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("10", "Closed"),
        ("11", "Closing"),
        ("20", "Open"),
        ("21", "Opening"),
        ("30", "Undefined"),
    ])
});

static WIFI_STATES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("0", "Disconnected"),
        ("1", "Connecting"),
        ("2", "Connected"),
    ])
});

static ALARM_CODES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("FF", "No alarm"),
        ("A1", "Alarm end switch"),
        ("A2", "No network"),
        ("A3", "Volume leakage"),
        ("A4", "Time leakage"),
        ("A5", "Max flow exceeded"),
        ("A6", "Micro leakage"),
        ("A7", "External sensor leakage"),
        ("A8", "Turbine blocked"),
        ("A9", "Pressure sensor fault"),
        ("AA", "Temperature sensor fault"),
    ])
});

impl CodeDictionary {
    /// Resolve a raw device code to its label, if known.
    pub fn label(&self, code: &str) -> Option<&'static str> {
        let table = match self {
            CodeDictionary::ValveState => &*VALVE_STATES,
            CodeDictionary::WifiState => &*WIFI_STATES,
            CodeDictionary::AlarmCode => &*ALARM_CODES,
        };
        table.get(code).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_known_key() {
        let d = describe("bar").expect("bar must exist");
        assert_eq!(d.command, "getBAR");
        assert_eq!(d.unit, "bar");
        assert!(d.required);
        assert_eq!(d.group, RefreshGroup::Fast);
    }

    #[test]
    fn describe_unknown_key_is_none() {
        assert!(describe("xyz").is_none());
        assert!(describe_command("getXYZ").is_none());
    }

    #[test]
    fn describe_command_maps_back_to_key() {
        let d = describe_command("getVOL").expect("getVOL must exist");
        assert_eq!(d.key, "vol");
    }

    #[test]
    fn keys_are_unique() {
        let keys: Vec<_> = all_keys().collect();
        let mut deduped = keys.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(keys.len(), deduped.len());
    }

    #[test]
    fn required_keys_are_all_fast() {
        for key in required_keys() {
            let d = describe(key).unwrap();
            assert_eq!(d.group, RefreshGroup::Fast, "required key {key} must be fast");
        }
    }

    #[test]
    fn group_partition_covers_catalog() {
        let fast = keys_in_group(RefreshGroup::Fast).count();
        let slow = keys_in_group(RefreshGroup::Slow).count();
        assert_eq!(fast + slow, all().len());
    }

    #[test]
    fn valve_dictionary_resolves_known_codes() {
        let dict = CodeDictionary::ValveState;
        assert_eq!(dict.label("10"), Some("Closed"));
        assert_eq!(dict.label("20"), Some("Open"));
        assert_eq!(dict.label("30"), Some("Undefined"));
        assert_eq!(dict.label("99"), None);
    }

    #[test]
    fn alarm_dictionary_has_no_alarm_marker() {
        assert_eq!(CodeDictionary::AlarmCode.label("FF"), Some("No alarm"));
        assert_eq!(CodeDictionary::AlarmCode.label("A3"), Some("Volume leakage"));
    }

    #[test]
    fn every_lookup_endpoint_names_a_dictionary() {
        for d in all() {
            if let DecodeKind::Lookup(dict) = d.decode {
                // Each dictionary must resolve at least one code.
                let probe = match dict {
                    CodeDictionary::ValveState => "10",
                    CodeDictionary::WifiState => "2",
                    CodeDictionary::AlarmCode => "FF",
                };
                assert!(dict.label(probe).is_some(), "empty dictionary for {}", d.key);
            }
        }
    }
}

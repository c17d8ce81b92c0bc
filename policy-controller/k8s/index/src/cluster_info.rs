use netpol_controller_core::Dataplane;

/// Holds cluster metadata.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Indicates whether a peer with both a namespace and a pod selector
    /// selects only pods matching both. Clusters older than 1.11 treat such
    /// peers differently, so they are skipped there.
    pub combined_selectors_and: bool,

    /// Describes the backend that enforces compiled policies.
    pub dataplane: Dataplane,
}

impl ClusterInfo {
    /// Determines whether an API server version supports combined peer
    /// selectors.
    ///
    /// Managed clusters often report minor versions like `11+`, so trailing
    /// non-digits are ignored. Unparseable versions are treated as
    /// unsupported.
    pub fn supports_combined_selectors(major: &str, minor: &str) -> bool {
        fn leading_number(s: &str) -> Option<u32> {
            let digits = s
                .trim()
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>();
            digits.parse().ok()
        }

        match (leading_number(major), leading_number(minor)) {
            (Some(major), _) if major > 1 => true,
            (Some(1), Some(minor)) => minor >= 11,
            _ => false,
        }
    }
}

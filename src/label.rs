//! Labels and the canonical series-key encoding.

/// Maximum length of a label name in bytes. Longer names are truncated.
pub const MAX_LABEL_NAME_LEN: usize = 256;

/// Maximum length of a label value in bytes. Longer values are truncated.
pub const MAX_LABEL_VALUE_LEN: usize = 16 * 1024;

/// Longest metric name the length-prefixed key format can represent.
pub const MAX_METRIC_NAME_LEN: usize = u16::MAX as usize;

/// A time-series label. A label with an empty name or value is invalid and
/// does not participate in series identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut name = name.into();
        let mut value = value.into();
        truncate_at_char_boundary(&mut name, MAX_LABEL_NAME_LEN);
        truncate_at_char_boundary(&mut value, MAX_LABEL_VALUE_LEN);
        Self { name, value }
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.value.is_empty()
    }
}

fn truncate_at_char_boundary(s: &mut String, max_len: usize) {
    if s.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Builds the canonical byte identity of a series from its metric name and
/// labels.
///
/// Labels are sorted by name (byte order ascending) and invalid ones are
/// dropped, so any permutation of the same label set produces the same key.
/// The layout is `u16_be(len(metric)) || metric` followed by
/// `u16_be(len(name)) || name || u16_be(len(value)) || value` per label;
/// every component is clamped to the u16 range.
pub fn marshal_series_key(metric: &str, labels: &[Label]) -> Vec<u8> {
    let metric_bytes = metric.as_bytes();
    let metric_len = metric_bytes.len().min(MAX_METRIC_NAME_LEN);

    let mut sorted: Vec<&Label> = labels.iter().filter(|l| l.is_valid()).collect();
    sorted.sort();

    let mut size = 2 + metric_len;
    for label in &sorted {
        size += 4 + label.name.len() + label.value.len();
    }

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(metric_len as u16).to_be_bytes());
    out.extend_from_slice(&metric_bytes[..metric_len]);

    for label in sorted {
        let name = label.name.as_bytes();
        let name_len = name.len().min(u16::MAX as usize);
        out.extend_from_slice(&(name_len as u16).to_be_bytes());
        out.extend_from_slice(&name[..name_len]);

        let value = label.value.as_bytes();
        let value_len = value.len().min(u16::MAX as usize);
        out.extend_from_slice(&(value_len as u16).to_be_bytes());
        out.extend_from_slice(&value[..value_len]);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_truncation_respects_limits_and_utf8() {
        let label = Label::new("n".repeat(MAX_LABEL_NAME_LEN + 7), "é".repeat(MAX_LABEL_VALUE_LEN));
        assert_eq!(label.name.len(), MAX_LABEL_NAME_LEN);
        assert!(label.value.len() <= MAX_LABEL_VALUE_LEN);
        assert!(label.value.is_char_boundary(label.value.len()));
    }

    #[test]
    fn labels_with_empty_parts_are_invalid() {
        assert!(!Label::new("", "v").is_valid());
        assert!(!Label::new("n", "").is_valid());
        assert!(Label::new("n", "v").is_valid());
    }

    #[test]
    fn key_is_stable_under_label_reordering() {
        let a = Label::new("host", "web-1");
        let b = Label::new("region", "eu-central");
        let c = Label::new("az", "a");

        let reference = marshal_series_key("cpu_seconds", &[a.clone(), b.clone(), c.clone()]);
        let permutations = [
            vec![a.clone(), c.clone(), b.clone()],
            vec![b.clone(), a.clone(), c.clone()],
            vec![b.clone(), c.clone(), a.clone()],
            vec![c.clone(), a.clone(), b.clone()],
            vec![c, b, a],
        ];
        for permutation in permutations {
            assert_eq!(marshal_series_key("cpu_seconds", &permutation), reference);
        }
    }

    #[test]
    fn invalid_labels_do_not_change_identity() {
        let valid = Label::new("host", "web-1");
        let with_junk = vec![Label::new("", "x"), valid.clone(), Label::new("y", "")];
        assert_eq!(
            marshal_series_key("m", &with_junk),
            marshal_series_key("m", &[valid]),
        );
    }

    #[test]
    fn length_prefixes_prevent_boundary_ambiguity() {
        // Without prefixes "ab"+"c" and "a"+"bc" would collide.
        let left = marshal_series_key("m", &[Label::new("ab", "c")]);
        let right = marshal_series_key("m", &[Label::new("a", "bc")]);
        assert_ne!(left, right);
    }

    #[test]
    fn distinct_metrics_get_distinct_keys() {
        assert_ne!(marshal_series_key("a", &[]), marshal_series_key("b", &[]));
    }

    #[test]
    fn oversized_metric_length_is_clamped_not_wrapped() {
        let metric = "m".repeat(MAX_METRIC_NAME_LEN + 10);
        let key = marshal_series_key(&metric, &[]);
        let encoded_len = u16::from_be_bytes([key[0], key[1]]) as usize;
        assert_eq!(encoded_len, MAX_METRIC_NAME_LEN);
        assert_eq!(key.len(), 2 + MAX_METRIC_NAME_LEN);
    }
}

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use regex::Regex;

const MASK: &str = "***";

/// Replaces secret values, and their base64 forms, with `***`.
///
/// Patterns are tried longest first at each position so a secret that
/// contains another secret is masked whole.
#[derive(Debug, Clone)]
pub struct SecretMask {
    pattern: Regex,
}

impl SecretMask {
    /// `None` when there is nothing to mask.
    pub fn new<S: AsRef<str>>(values: &[S]) -> Option<Self> {
        let mut needles: Vec<String> = Vec::new();
        for value in values.iter().map(AsRef::as_ref) {
            if value.is_empty() {
                continue;
            }
            needles.push(value.to_string());
            needles.push(STANDARD.encode(value));
            needles.push(STANDARD_NO_PAD.encode(value));
        }
        if needles.is_empty() {
            return None;
        }

        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        needles.dedup();

        let alternation = needles
            .iter()
            .map(|n| regex::escape(n))
            .collect::<Vec<_>>()
            .join("|");
        // Escaped literals always compile; a failure here means the
        // alternation outgrew the regex size limit.
        match Regex::new(&alternation) {
            Ok(pattern) => Some(Self { pattern }),
            Err(e) => {
                tracing::error!(error = %e, "failed to build secret mask");
                None
            }
        }
    }

    pub fn mask(&self, input: &str) -> String {
        self.pattern.replace_all(input, MASK).into_owned()
    }
}

/// Masks `input` when a mask is present.
pub fn apply(mask: Option<&SecretMask>, input: &str) -> String {
    match mask {
        Some(mask) => mask.mask(input),
        None => input.to_string(),
    }
}

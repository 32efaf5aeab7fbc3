//! Metric identity canonicalization.
//!
//! Every series, histogram and dedup decision in locol keys off the string
//! produced by [`generate_key`]. Equal name and label pairs always produce
//! byte-identical keys, whatever order the labels arrive in.
//!
//! Label values are inserted verbatim. A value containing `"` or `,` can make
//! two distinct label sets render identically; this is a known limitation of
//! the key format.

use crate::sample::{BUCKET_LABEL, NAME_LABEL};

fn is_excluded(key: &str) -> bool {
    key == BUCKET_LABEL || key == NAME_LABEL
}

/// Produce the canonical identity of the series `name` with `labels`.
///
/// The bucket discriminator `le` and the internal name label are dropped. With
/// no labels left the key is exactly `name`, otherwise labels are sorted by
/// key and rendered as `name{k1="v1",k2="v2"}`.
pub fn generate_key<I, K, V>(name: &str, labels: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(K, V)> = labels
        .into_iter()
        .filter(|(k, _)| !is_excluded(k.as_ref()))
        .collect();

    if pairs.is_empty() {
        return name.to_string();
    }

    // Sort on the value as well so duplicate keys from a non-map source still
    // render deterministically.
    pairs.sort_by(|a, b| {
        a.0.as_ref()
            .cmp(b.0.as_ref())
            .then_with(|| a.1.as_ref().cmp(b.1.as_ref()))
    });

    let mut key = String::with_capacity(name.len() + pairs.len() * 16);
    key.push_str(name);
    key.push('{');
    for (idx, (k, v)) in pairs.iter().enumerate() {
        if idx > 0 {
            key.push(',');
        }
        key.push_str(k.as_ref());
        key.push_str("=\"");
        key.push_str(v.as_ref());
        key.push('"');
    }
    key.push('}');
    key
}

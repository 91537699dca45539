use std::collections::BTreeMap;
use std::fmt;

/// Label set attached to an instrument.
///
/// A `BTreeMap` iterates in key order, so two label sets holding the same
/// pairs always render to the same [`MetricKey`] no matter how they were
/// built.
pub type Labels = BTreeMap<String, String>;

/// Canonical identity of an instrument: its name plus its sorted label set,
/// rendered as `name{k1=v1,k2=v2}`, or just `name` when there are no labels.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey(String);

impl MetricKey {
    /// Builds the key for `name` and `labels`.
    pub fn new(name: &str, labels: &Labels) -> Self {
        if labels.is_empty() {
            return MetricKey(name.to_owned());
        }

        let capacity = name.len()
            + 2
            + labels
                .iter()
                .map(|(k, v)| k.len() + v.len() + 2)
                .sum::<usize>();
        let mut key = String::with_capacity(capacity);
        key.push_str(name);
        key.push('{');
        for (i, (k, v)) in labels.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key.push('}');
        MetricKey(key)
    }

    /// The rendered key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds a [`Labels`] set from key/value pairs. Later pairs overwrite earlier
/// ones with the same key.
pub fn labels<I, K, V>(pairs: I) -> Labels
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{labels, Labels, MetricKey};

    #[test]
    fn key_without_labels_is_bare_name() {
        assert_eq!(
            MetricKey::new("http.server.requests.total", &Labels::new()).as_str(),
            "http.server.requests.total"
        );
    }

    #[test]
    fn key_is_independent_of_insertion_order() {
        let forward = labels([("method", "GET"), ("status", "200"), ("route", "/")]);
        let backward = labels([("route", "/"), ("status", "200"), ("method", "GET")]);

        let a = MetricKey::new("requests", &forward);
        let b = MetricKey::new("requests", &backward);

        assert_eq!(a, b);
        assert_eq!(a.as_str(), "requests{method=GET,route=/,status=200}");
    }

    #[test]
    fn different_values_produce_different_keys() {
        let get = MetricKey::new("requests", &labels([("method", "GET")]));
        let post = MetricKey::new("requests", &labels([("method", "POST")]));
        let bare = MetricKey::new("requests", &Labels::new());

        assert_ne!(get, post);
        assert_ne!(get, bare);
        assert_eq!(post.to_string(), "requests{method=POST}");
    }

    #[test]
    fn later_pairs_overwrite_earlier_ones() {
        let set = labels([("env", "dev"), ("env", "prod")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set["env"], "prod");
    }
}

//! Line-oriented state machine over exposition text.
//!
//! The parser is either idle or accumulating one family in a
//! [`FamilyBuilder`]. Metadata and sample lines for the accumulating family
//! extend it; a line naming any other family closes it, flushing it to the
//! output, and starts the next. End of input closes the last family.

use std::time::SystemTime;

use crate::{
    histogram::{self, Histogram},
    sample::{Labels, MetricType, NAME_LABEL},
};

use super::{Error, FamilySample, MetricFamily};

const HISTOGRAM_SUFFIXES: [&str; 3] = ["_bucket", "_sum", "_count"];

/// Whether `name` matches `[a-zA-Z_:][a-zA-Z0-9_:]*`.
#[must_use]
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        }
        _ => false,
    }
}

fn validate_metric_name(name: &str) -> Result<(), Error> {
    if is_valid_metric_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidMetricName(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RawSample {
    /// Includes the sample name under `__name__`.
    labels: Labels,
    value: f64,
    timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
/// The family currently being accumulated.
pub struct FamilyBuilder {
    name: String,
    help: Option<String>,
    /// `None` until declared by `# TYPE` or inferred from a suffix.
    metric_type: Option<MetricType>,
    /// Set when the type came from suffix folding rather than `# TYPE`.
    inferred: bool,
    samples: Vec<RawSample>,
}

impl FamilyBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            help: None,
            metric_type: None,
            inferred: false,
            samples: Vec::new(),
        }
    }

    /// Base name of the family.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finish this family, stripping the internal name label and validating
    /// histogram buckets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHistogramBuckets`] when a histogram family
    /// violates the cumulative contract.
    pub fn close(self) -> Result<MetricFamily, Error> {
        let values: Vec<FamilySample> = self
            .samples
            .into_iter()
            .map(|mut raw| {
                let name = raw.labels.remove(NAME_LABEL).unwrap_or_default();
                FamilySample {
                    name,
                    labels: raw.labels,
                    value: raw.value,
                    timestamp_ms: raw.timestamp_ms,
                }
            })
            .collect();

        let mut metric_type = self.metric_type.unwrap_or_default();
        if metric_type == MetricType::Histogram && self.inferred {
            // Only _sum/_count were seen: summary-style, not a histogram.
            let bucket_name = format!("{}_bucket", self.name);
            if !values.iter().any(|v| v.name == bucket_name) {
                metric_type = MetricType::Summary;
            }
        }

        if metric_type == MetricType::Histogram {
            let results = Histogram::from_samples(
                &self.name,
                values.iter().map(|s| (s.name.as_str(), &s.labels, s.value)),
                SystemTime::UNIX_EPOCH,
            );
            // Incomplete histograms are the consumer's concern; only broken
            // buckets fail the parse.
            for result in results {
                if let Err(histogram::Error::InvalidHistogramBuckets(name)) = result {
                    return Err(Error::InvalidHistogramBuckets(name));
                }
            }
        }

        Ok(MetricFamily {
            name: self.name,
            help: self.help,
            metric_type,
            values,
        })
    }
}

#[derive(Debug, Default)]
/// Parser for the Prometheus text exposition format
pub struct Parser {
    current: Option<FamilyBuilder>,
    families: Vec<MetricFamily>,
}

impl Parser {
    /// Create a new parser instance
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The family being accumulated, if any.
    #[must_use]
    pub fn current(&self) -> Option<&FamilyBuilder> {
        self.current.as_ref()
    }

    /// Families closed so far.
    #[must_use]
    pub fn closed(&self) -> &[MetricFamily] {
        &self.families
    }

    /// Close the current family, if any, pushing it to the output.
    fn flush(&mut self) -> Result<(), Error> {
        if let Some(builder) = self.current.take() {
            self.families.push(builder.close()?);
        }
        Ok(())
    }

    /// Make `name` the accumulating family, closing any other.
    fn switch_to(&mut self, name: &str) -> Result<&mut FamilyBuilder, Error> {
        if self.current.as_ref().is_some_and(|c| c.name != name) {
            self.flush()?;
        }
        Ok(self
            .current
            .get_or_insert_with(|| FamilyBuilder::new(name)))
    }

    /// Consume one line of input.
    ///
    /// # Errors
    ///
    /// See [`Error`]. After an error the parser state is unspecified and the
    /// parse should be abandoned.
    pub fn feed_line(&mut self, line: &str) -> Result<(), Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        if let Some(comment) = line.strip_prefix('#') {
            return self.feed_comment(line, comment);
        }
        self.feed_sample(line)
    }

    /// Close the last family and return every family parsed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHistogramBuckets`] if the last family is an
    /// invalid histogram.
    pub fn finish(mut self) -> Result<Vec<MetricFamily>, Error> {
        self.flush()?;
        Ok(self.families)
    }

    fn feed_comment(&mut self, line: &str, comment: &str) -> Result<(), Error> {
        let comment = comment.trim_start();
        let (keyword, rest) = comment
            .split_once(char::is_whitespace)
            .unwrap_or((comment, ""));
        let rest = rest.trim_start();

        match keyword {
            "HELP" => {
                let (name, text) = rest
                    .split_once(char::is_whitespace)
                    .unwrap_or((rest, ""));
                if name.is_empty() {
                    return Err(Error::MalformedMetricLine(line.to_string()));
                }
                validate_metric_name(name)?;
                let help = unescape_help(text.trim());
                self.switch_to(name)?.help = Some(help);
            }
            "TYPE" => {
                let mut parts = rest.split_whitespace();
                let (Some(name), Some(kind), None) = (parts.next(), parts.next(), parts.next())
                else {
                    return Err(Error::MalformedMetricLine(line.to_string()));
                };
                validate_metric_name(name)?;
                let metric_type = MetricType::from_keyword(kind)
                    .ok_or_else(|| Error::UnknownMetricType(kind.to_string()))?;
                let builder = self.switch_to(name)?;
                builder.metric_type = Some(metric_type);
                builder.inferred = false;
            }
            // Any other comment is ignored.
            _ => {}
        }
        Ok(())
    }

    fn family_name<'a>(&self, sample_name: &'a str) -> (&'a str, bool) {
        if self
            .current
            .as_ref()
            .is_some_and(|c| c.name == sample_name)
        {
            return (sample_name, false);
        }
        for suffix in HISTOGRAM_SUFFIXES {
            if let Some(base) = sample_name.strip_suffix(suffix) {
                if !base.is_empty() {
                    return (base, true);
                }
            }
        }
        (sample_name, false)
    }

    fn feed_sample(&mut self, line: &str) -> Result<(), Error> {
        let (sample_name, mut labels, value, timestamp_ms) = parse_sample_line(line)?;
        let (family, folded) = self.family_name(&sample_name);
        let family = family.to_string();

        let builder = self.switch_to(&family)?;
        if folded && builder.metric_type.is_none() {
            builder.metric_type = Some(MetricType::Histogram);
            builder.inferred = true;
        }
        labels.insert(NAME_LABEL.to_string(), sample_name);
        builder.samples.push(RawSample {
            labels,
            value,
            timestamp_ms,
        });
        Ok(())
    }
}

fn unescape_help(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a sample line into name, labels, value and optional timestamp.
fn parse_sample_line(line: &str) -> Result<(String, Labels, f64, Option<i64>), Error> {
    let malformed = || Error::MalformedMetricLine(line.to_string());

    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    validate_metric_name(name)?;

    let mut rest = &line[name_end..];
    let labels = if let Some(inner) = rest.strip_prefix('{') {
        let (labels, after) = parse_labels(inner).ok_or_else(malformed)?;
        rest = after;
        labels
    } else {
        Labels::new()
    };

    // The value must be separated from the name or label block by whitespace.
    if !rest.starts_with(char::is_whitespace) {
        return Err(malformed());
    }

    let mut tokens = rest.split_whitespace();
    let value = tokens.next().ok_or_else(malformed)?;
    let value = parse_value(value).ok_or_else(malformed)?;
    let timestamp_ms = match tokens.next() {
        Some(ts) => Some(ts.parse::<i64>().map_err(|_| malformed())?),
        None => None,
    };
    if tokens.next().is_some() {
        return Err(malformed());
    }

    Ok((name.to_string(), labels, value, timestamp_ms))
}

fn parse_value(token: &str) -> Option<f64> {
    match token {
        "NaN" => Some(f64::NAN),
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        _ => token.parse::<f64>().ok(),
    }
}

/// Parse the inside of a `{...}` label block. `input` starts just after the
/// opening brace; on success returns the labels and the text after the
/// closing brace. Returns `None` on any malformed segment.
fn parse_labels(input: &str) -> Option<(Labels, &str)> {
    let mut labels = Labels::new();
    let mut chars = input.char_indices().peekable();

    loop {
        // Key, up to '='. A '}' here is only fine if no key was started,
        // covering `{}` and a trailing comma.
        let mut key = String::new();
        let close_at = loop {
            let (idx, c) = chars.next()?;
            match c {
                '=' => break None,
                '}' => break Some(idx),
                ',' => return None,
                _ => key.push(c),
            }
        };
        let key = key.trim();
        if let Some(idx) = close_at {
            return if key.is_empty() {
                Some((labels, &input[idx + 1..]))
            } else {
                None
            };
        }
        if key.is_empty() || key == NAME_LABEL {
            return None;
        }

        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if(|(_, c)| *c == '"').is_some() {
            loop {
                let (_, c) = chars.next()?;
                match c {
                    '"' => break,
                    '\\' => match chars.next()?.1 {
                        '\\' => value.push('\\'),
                        '"' => value.push('"'),
                        'n' => value.push('\n'),
                        _ => return None,
                    },
                    _ => value.push(c),
                }
            }
        } else {
            while let Some((_, c)) = chars.next_if(|(_, c)| *c != ',' && *c != '}') {
                value.push(c);
            }
            let trimmed = value.trim_end().len();
            value.truncate(trimmed);
        }

        if labels.insert(key.to_string(), value).is_some() {
            // Duplicate label name.
            return None;
        }

        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        match chars.next()? {
            (_, ',') => {}
            (idx, '}') => return Some((labels, &input[idx + 1..])),
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{Parser, is_valid_metric_name, parse_labels, parse_sample_line};
    use crate::{
        exposition::{Error, parse},
        sample::MetricType,
    };

    #[test]
    fn metric_name_pattern() {
        assert!(is_valid_metric_name("http_requests_total"));
        assert!(is_valid_metric_name(":job:rate5m"));
        assert!(is_valid_metric_name("_x"));
        assert!(!is_valid_metric_name(""));
        assert!(!is_valid_metric_name("1abc"));
        assert!(!is_valid_metric_name("a-b"));
        assert!(!is_valid_metric_name("caf\u{e9}"));
    }

    #[test]
    fn sample_no_labels() {
        let (name, labels, value, ts) = parse_sample_line("http_requests_total 1027").unwrap();
        assert_eq!(name, "http_requests_total");
        assert!(labels.is_empty());
        assert_eq!(value, 1027.0);
        assert_eq!(ts, None);
    }

    #[test]
    fn sample_with_labels_and_timestamp() {
        let (name, labels, value, ts) = parse_sample_line(
            r#"http_requests_total{method="post",code="200"} 1027 1395066363000"#,
        )
        .unwrap();
        assert_eq!(name, "http_requests_total");
        assert_eq!(labels.get("method").unwrap(), "post");
        assert_eq!(labels.get("code").unwrap(), "200");
        assert_eq!(value, 1027.0);
        assert_eq!(ts, Some(1_395_066_363_000));
    }

    #[test]
    fn label_values_with_commas_braces_and_spaces() {
        let (_, labels, value, _) = parse_sample_line(
            r#"vector_build_info{arch="aarch64",revision="745babd 2024-09-11, {dirty}",version="0.41.1"} 1 1729113558073"#,
        )
        .unwrap();
        assert_eq!(value, 1.0);
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.get("revision").unwrap(), "745babd 2024-09-11, {dirty}");
    }

    #[test]
    fn label_escapes() {
        let (labels, rest) = parse_labels(r#"a="x\"y",b="p\\q",c="l1\nl2"} 1"#).unwrap();
        assert_eq!(labels.get("a").unwrap(), "x\"y");
        assert_eq!(labels.get("b").unwrap(), "p\\q");
        assert_eq!(labels.get("c").unwrap(), "l1\nl2");
        assert_eq!(rest, " 1");
        assert!(parse_labels(r#"a="bad\x"} 1"#).is_none());
    }

    #[test]
    fn unquoted_value_and_trailing_comma() {
        let (labels, _) = parse_labels("a=1,b = two ,} 3").unwrap();
        assert_eq!(labels.get("a").unwrap(), "1");
        assert_eq!(labels.get("b").unwrap(), "two");
        let (labels, _) = parse_labels("} 3").unwrap();
        assert!(labels.is_empty());
    }

    #[test]
    fn malformed_samples() {
        for line in [
            "metric",
            "metric foobar",
            "metric{=\"v\"} 1",
            "metric{key} 1",
            "metric{a=\"1\"",
            "metric{a=\"1\"}5",
            "metric{a=\"1\",a=\"2\"} 5",
            "metric{__name__=\"m\"} 5",
            "metric 1 notatimestamp",
            "metric 1 2 3",
        ] {
            assert!(
                matches!(parse_sample_line(line), Err(Error::MalformedMetricLine(_))),
                "{line} should be malformed"
            );
        }
    }

    #[test]
    fn special_floats() {
        assert!(parse_sample_line("m NaN").unwrap().2.is_nan());
        assert_eq!(parse_sample_line("m +Inf").unwrap().2, f64::INFINITY);
        assert_eq!(parse_sample_line("m -Inf").unwrap().2, f64::NEG_INFINITY);
        assert_eq!(parse_sample_line("m 1.23e45").unwrap().2, 1.23e45);
        assert_eq!(parse_sample_line("m -42.5").unwrap().2, -42.5);
    }

    #[test]
    fn empty_name_rejected() {
        assert!(matches!(
            parse_sample_line("{a=\"b\"} 0"),
            Err(Error::InvalidMetricName(_))
        ));
    }

    #[test]
    fn state_machine_transitions() {
        let mut parser = Parser::new();
        assert!(parser.current().is_none());

        parser.feed_line("# TYPE a gauge").unwrap();
        assert_eq!(parser.current().unwrap().name(), "a");
        parser.feed_line("a 1").unwrap();
        assert!(parser.closed().is_empty());

        // A new family closes the previous one.
        parser.feed_line("b 2").unwrap();
        assert_eq!(parser.closed().len(), 1);
        assert_eq!(parser.closed()[0].name, "a");
        assert_eq!(parser.current().unwrap().name(), "b");

        parser.feed_line("").unwrap();
        parser.feed_line("# just a comment").unwrap();
        let families = parser.finish().unwrap();
        assert_eq!(families.len(), 2);
        assert_eq!(families[1].metric_type, MetricType::Unknown);
    }

    #[test]
    fn suffixes_infer_histogram() {
        let text = "lat_bucket{le=\"1\"} 1\nlat_bucket{le=\"+Inf\"} 2\nlat_sum 3\nlat_count 2\n";
        let families = parse(text).unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "lat");
        assert_eq!(families[0].metric_type, MetricType::Histogram);
        assert_eq!(families[0].values[0].name, "lat_bucket");
    }

    #[test]
    fn sum_count_without_buckets_is_summary() {
        let families = parse("req_sum 10\nreq_count 4\n").unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "req");
        assert_eq!(families[0].metric_type, MetricType::Summary);
    }

    #[test]
    fn declared_summary_keeps_quantiles() {
        let text = r#"
# TYPE rpc summary
rpc{quantile="0.5"} 0.2
rpc{quantile="0.99"} 1.5
rpc_sum 30
rpc_count 100
"#;
        let families = parse(text).unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].metric_type, MetricType::Summary);
        assert_eq!(families[0].values.len(), 4);
    }

    #[test]
    fn counter_named_count_is_not_folded() {
        let text = "# TYPE jobs_count counter\njobs_count 3\n";
        let families = parse(text).unwrap();
        assert_eq!(families[0].name, "jobs_count");
        assert_eq!(families[0].metric_type, MetricType::Counter);
    }

    #[test]
    fn declared_histogram_without_inf_fails() {
        let text = "# TYPE h histogram\nh_bucket{le=\"1\"} 10\nh_bucket{le=\"2\"} 20\nh_sum 1\nh_count 20\n";
        assert_eq!(
            parse(text),
            Err(Error::InvalidHistogramBuckets("h".to_string()))
        );
    }

    #[test]
    fn histogram_missing_sum_still_parses() {
        let text = "# TYPE h histogram\nh_bucket{le=\"+Inf\"} 2\nh_count 2\n";
        let families = parse(text).unwrap();
        assert_eq!(families[0].values.len(), 2);
    }

    #[test]
    fn metadata_errors() {
        assert_eq!(
            parse("# TYPE x flavour"),
            Err(Error::UnknownMetricType("flavour".to_string()))
        );
        assert!(matches!(parse("# TYPE x"), Err(Error::MalformedMetricLine(_))));
        assert!(matches!(parse("# HELP"), Err(Error::MalformedMetricLine(_))));
        assert!(matches!(parse("# HELP 9x hi"), Err(Error::InvalidMetricName(_))));
    }

    #[test]
    fn help_escapes() {
        let families = parse("# HELP x line one\\nline two \\\\ done\nx 1\n").unwrap();
        assert_eq!(
            families[0].help.as_deref(),
            Some("line one\nline two \\ done")
        );
    }

    #[test]
    fn repeated_name_starts_new_family() {
        // `a` appears twice, separated by `b`: two distinct families.
        let text = "a 1\nb 2\na 3\n";
        let families = parse(text).unwrap();
        let names: Vec<&str> = families.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "a"]);
    }

    proptest! {
        #[test]
        fn no_panic_on_any_input(input: String) {
            let _ = parse(&input);
        }

        #[test]
        fn valid_metric_names_accepted(
            name in "[a-zA-Z_:][a-zA-Z0-9_:]*",
            value in prop::num::f64::NORMAL,
        ) {
            let line = format!("{name} {value}");
            let (parsed_name, _, parsed_value, _) = parse_sample_line(&line).unwrap();
            prop_assert_eq!(parsed_name, name);
            prop_assert_eq!(parsed_value, value);
        }

        #[test]
        fn label_escaping_roundtrip(
            name in "[a-zA-Z_][a-zA-Z0-9_]*",
            label_name in "[a-zA-Z][a-zA-Z0-9_]*",
            raw_value in ".*",
            metric_value in "[0-9]+",
        ) {
            let escaped = raw_value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n");
            let line = format!("{name}{{{label_name}=\"{escaped}\"}} {metric_value}");
            let (_, labels, _, _) = parse_sample_line(&line).unwrap();
            prop_assert_eq!(labels.get(&label_name), Some(&raw_value));
        }

        #[test]
        fn timestamp_parsing(
            name in "[a-zA-Z_][a-zA-Z0-9_]*",
            value in prop::num::f64::NORMAL,
            timestamp in prop::num::i64::ANY,
        ) {
            let line = format!("{name} {value} {timestamp}");
            let (_, _, _, ts) = parse_sample_line(&line).unwrap();
            prop_assert_eq!(ts, Some(timestamp));
        }
    }
}
